//! Bearer-token authentication for federation peers.
//!
//! Every RPC carries exactly one `authorization: Bearer <token>` metadata
//! entry. The token is validated as an OIDC ID token; its issuer and
//! subject select a stored federation authorization, which scopes the
//! caller's regions. All failures collapse to `Unauthenticated` so an
//! unauthorized caller learns nothing about which step rejected it.

use std::sync::Arc;
use std::time::Duration;

use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::debug;

use enx_auth::oidc::IdTokenValidator;
use enx_auth::KeyLookupCache;
use enx_core::FederationOutAuthorization;
use enx_storage::FederationAuthorizationStore;

/// Authenticates federation peers and resolves their authorizations.
pub(crate) struct PeerAuthenticator {
    validator: Arc<dyn IdTokenValidator>,
    authorizations: Arc<dyn FederationAuthorizationStore>,
    cache: KeyLookupCache<FederationOutAuthorization>,
}

impl PeerAuthenticator {
    pub(crate) fn new(
        validator: Arc<dyn IdTokenValidator>,
        authorizations: Arc<dyn FederationAuthorizationStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            validator,
            authorizations,
            cache: KeyLookupCache::new(cache_ttl),
        }
    }

    /// Authenticates the request metadata and returns the caller's
    /// authorization.
    pub(crate) async fn authenticate(
        &self,
        metadata: &MetadataMap,
    ) -> Result<FederationOutAuthorization, Status> {
        let token = bearer_token(metadata)?;

        let claims = self.validator.validate(token).await.map_err(|e| {
            debug!(error = %e, "peer token rejected");
            unauthenticated()
        })?;

        let cache_key = format!("{}\u{1f}{}", claims.issuer, claims.subject);
        let authorization = self
            .cache
            .write_through(&cache_key, || async {
                match self
                    .authorizations
                    .get(&claims.issuer, &claims.subject)
                    .await
                {
                    Ok(auth) => Ok(Some(auth)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "authorization lookup failed");
                Status::internal("internal error")
            })?
            .ok_or_else(|| {
                debug!(issuer = %claims.issuer, subject = %claims.subject, "no federation authorization");
                unauthenticated()
            })?;

        if let Some(audience) = &authorization.audience
            && !claims.has_audience(audience)
        {
            debug!("peer token audience does not match pinned audience");
            return Err(unauthenticated());
        }

        Ok(authorization)
    }
}

/// Extracts the bearer token, requiring exactly one well-formed
/// authorization entry.
fn bearer_token(metadata: &MetadataMap) -> Result<&str, Status> {
    let mut values = metadata.get_all("authorization").iter();
    let first = values.next().ok_or_else(unauthenticated)?;
    if values.next().is_some() {
        return Err(unauthenticated());
    }
    let value = first.to_str().map_err(|_| unauthenticated())?;
    let token = value.strip_prefix("Bearer ").ok_or_else(unauthenticated)?;
    if token.is_empty() {
        return Err(unauthenticated());
    }
    Ok(token)
}

fn unauthenticated() -> Status {
    Status::unauthenticated("invalid authorization")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut metadata = MetadataMap::new();
        assert!(bearer_token(&metadata).is_err());

        metadata.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&metadata).unwrap(), "abc123");
    }

    #[test]
    fn test_bearer_token_rejects_malformed() {
        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", "Basic abc123".parse().unwrap());
        assert!(bearer_token(&metadata).is_err());

        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", "Bearer ".parse().unwrap());
        assert!(bearer_token(&metadata).is_err());
    }

    #[test]
    fn test_bearer_token_rejects_duplicates() {
        let mut metadata = MetadataMap::new();
        metadata.append("authorization", "Bearer one".parse().unwrap());
        metadata.append("authorization", "Bearer two".parse().unwrap());
        assert!(bearer_token(&metadata).is_err());
    }
}
