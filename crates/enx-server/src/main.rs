//! ENX key server entrypoint.

use std::future::IntoFuture;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use enx_auth::oidc::{ProviderIdTokenValidator, ProviderIdTokenValidatorConfig};
use enx_auth::JwksManager;
use enx_db_postgres::{
    PgExposureStore, PgFederationAuthorizationStore, PgHealthAuthorityStore, PgLockManager,
    create_pool, ensure_schema,
};
use enx_federation::FederationOutService;
use enx_federation::proto::federation_server::FederationServer;
use enx_server::ServerConfig;
use enx_server::jwks_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env()?;

    let pool = create_pool(&config.postgres).await?;
    ensure_schema(&pool).await?;

    let authorities = Arc::new(PgHealthAuthorityStore::new(pool.clone()));
    let locks = Arc::new(PgLockManager::new(pool.clone()));
    let jwks_manager = Arc::new(JwksManager::new(authorities, locks, config.jwks.clone()));

    let http = {
        let app = jwks_handler::router(Arc::clone(&jwks_manager));
        let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
        info!(addr = %config.http_addr, "JWKS endpoint listening");
        axum::serve(listener, app)
    };

    match &config.peer_jwks_uri {
        Some(peer_jwks_uri) => {
            let validator = Arc::new(ProviderIdTokenValidator::new(
                ProviderIdTokenValidatorConfig::new(peer_jwks_uri.clone()),
            ));
            let service = FederationOutService::new(
                Arc::new(PgExposureStore::new(pool.clone())),
                Arc::new(PgFederationAuthorizationStore::new(pool.clone())),
                validator,
                config.federation.clone(),
            );
            let grpc = tonic::transport::Server::builder()
                .add_service(FederationServer::new(service))
                .serve(config.grpc_addr);
            info!(addr = %config.grpc_addr, "federation-out service listening");

            tokio::select! {
                result = http.into_future() => result?,
                result = grpc => result?,
            }
        }
        None => {
            warn!("ENX_PEER_JWKS_URI unset, federation-out disabled");
            http.await?;
        }
    }

    Ok(())
}
