//! Environment-assembled server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

use enx_auth::JwksConfig;
use enx_db_postgres::PostgresConfig;
use enx_federation::FederationConfig;

/// Top-level configuration, read from `ENX_*` environment variables with
/// sensible defaults for everything except the database URL.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub postgres: PostgresConfig,
    /// HTTP listener for the JWKS trigger and health endpoints.
    pub http_addr: SocketAddr,
    /// gRPC listener for the federation-out service.
    pub grpc_addr: SocketAddr,
    pub federation: FederationConfig,
    pub jwks: JwksConfig,
    /// JWKS endpoint of the identity provider that mints peer ID tokens.
    /// Federation is disabled when unset.
    pub peer_jwks_uri: Option<Url>,
}

impl ServerConfig {
    /// Reads configuration from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let postgres = PostgresConfig::new(
            env_or("ENX_DATABASE_URL", "postgres://localhost/enx"),
        );

        let http_addr: SocketAddr = env_or("ENX_HTTP_ADDR", "0.0.0.0:8080").parse()?;
        let grpc_addr: SocketAddr = env_or("ENX_GRPC_ADDR", "0.0.0.0:8443").parse()?;

        let mut federation = FederationConfig::default();
        if let Some(max_records) = env_parse::<u32>("ENX_FEDERATION_MAX_RECORDS")? {
            federation.max_records = max_records;
        }
        if let Some(secs) = env_parse::<u64>("ENX_FEDERATION_TIMEOUT_SECS")? {
            federation.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("ENX_FEDERATION_TRUNCATE_WINDOW_SECS")? {
            federation.truncate_window = Duration::from_secs(secs);
        }

        let mut jwks = JwksConfig::default();
        if let Some(workers) = env_parse::<usize>("ENX_JWKS_MAX_WORKERS")? {
            jwks.max_workers = workers.max(1);
        }
        if let Some(secs) = env_parse::<u64>("ENX_JWKS_CLEANUP_TTL_SECS")? {
            jwks.cleanup_ttl = Duration::from_secs(secs);
        }

        let peer_jwks_uri = match std::env::var("ENX_PEER_JWKS_URI") {
            Ok(raw) if !raw.trim().is_empty() => Some(Url::parse(raw.trim())?),
            _ => None,
        };

        Ok(Self {
            postgres,
            http_addr,
            grpc_addr,
            federation,
            jwks,
            peer_jwks_uri,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => Ok(Some(raw.trim().parse()?)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // Environment-free construction: everything defaulted.
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.grpc_addr.port(), 8443);
        assert_eq!(config.federation.max_records, 500);
        assert!(config.peer_jwks_uri.is_none());
    }
}
