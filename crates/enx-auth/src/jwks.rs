//! JWKS reconciliation.
//!
//! Drives each health authority's stored signing keys toward eventual
//! consistency with its advertised JWKS document. An HTTP handler invokes
//! [`JwksManager::update_all`] on a schedule; a named distributed lease
//! keeps concurrent invocations across the fleet from doing the work twice.
//!
//! Key identity is the *stripped PEM body* — armor and whitespace removed —
//! never the `kid`. An authority re-publishing the same key under a new
//! `kid` must not revoke-and-reinsert it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use rand::seq::SliceRandom;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use enx_core::{HealthAuthority, HealthAuthorityKey, pem_body};
use enx_storage::{HealthAuthorityStore, LockManager};

use crate::error::JwksError;

/// Name of the fleet-wide lease serializing JWKS imports.
const JWKS_LOCK_ID: &str = "jwks-import";

/// Configuration for the JWKS manager.
#[derive(Debug, Clone)]
pub struct JwksConfig {
    /// Per-request timeout for JWKS document fetches (default: 10 seconds).
    pub request_timeout: Duration,

    /// Keys revoked longer ago than this are purged (default: 30 days).
    pub cleanup_ttl: Duration,

    /// Worker pool bound; defaults to the CPU count, minimum 3.
    pub max_workers: usize,

    /// TTL of the `jwks-import` lease (default: 1 minute).
    pub lock_ttl: Duration,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            cleanup_ttl: Duration::from_secs(30 * 24 * 3600),
            max_workers: num_cpus::get().max(3),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

impl JwksConfig {
    /// Sets the per-request fetch timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the revoked-key purge horizon.
    #[must_use]
    pub fn with_cleanup_ttl(mut self, ttl: Duration) -> Self {
        self.cleanup_ttl = ttl;
        self
    }

    /// Sets the worker pool bound.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Sets the lease TTL.
    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// Outcome of an [`JwksManager::update_all`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// All enabled authorities were processed.
    Updated,
    /// Another worker holds the lease; nothing was done.
    AlreadyLocked,
}

/// Reconciles stored signing keys with advertised JWKS documents.
#[derive(Clone)]
pub struct JwksManager {
    store: Arc<dyn HealthAuthorityStore>,
    locks: Arc<dyn LockManager>,
    client: reqwest::Client,
    config: JwksConfig,
}

impl JwksManager {
    /// Creates a manager over the given stores.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(
        store: Arc<dyn HealthAuthorityStore>,
        locks: Arc<dyn LockManager>,
        config: JwksConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            store,
            locks,
            client,
            config,
        }
    }

    /// Reconciles every JWKS-enabled authority.
    ///
    /// Holds the `jwks-import` lease for the duration; a concurrent
    /// invocation elsewhere in the fleet observes
    /// [`UpdateOutcome::AlreadyLocked`] and does nothing. One authority's
    /// failure does not abort its peers; failures are joined into one
    /// error after all workers drain.
    #[instrument(skip(self))]
    pub async fn update_all(&self) -> Result<UpdateOutcome, JwksError> {
        let unlocker = match self.locks.lock(JWKS_LOCK_ID, self.config.lock_ttl).await {
            Ok(unlocker) => unlocker,
            Err(e) if e.is_already_locked() => {
                info!("jwks-import lease held elsewhere, skipping");
                return Ok(UpdateOutcome::AlreadyLocked);
            }
            Err(e) => return Err(JwksError::Storage(e)),
        };

        let result = self.run_updates().await;

        // The lease is released regardless of the update result.
        if let Err(e) = unlocker.unlock().await {
            warn!(error = %e, "failed to release jwks-import lease");
        }
        result.map(|()| UpdateOutcome::Updated)
    }

    async fn run_updates(&self) -> Result<(), JwksError> {
        let authorities = self.store.list_all().await?;
        let mut enabled: Vec<HealthAuthority> = authorities
            .into_iter()
            .filter(HealthAuthority::jwks_enabled)
            .collect();

        // Shuffled so a fleet of deployments does not stampede a shared
        // identity provider in issuer order. `thread_rng` is
        // cryptographically seeded.
        enabled.shuffle(&mut rand::thread_rng());
        info!(count = enabled.len(), "reconciling JWKS documents");

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut workers = JoinSet::new();
        for authority in enabled {
            let manager = self.clone();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let issuer = authority.issuer.clone();
                let result = manager.update_ha(&authority).await;
                (issuer, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((issuer, Err(e))) => {
                    warn!(issuer = %issuer, error = %e, "authority update failed");
                    failures.push((issuer, e));
                }
                Err(e) => {
                    failures.push((
                        "<unknown>".to_string(),
                        JwksError::Worker(e.to_string()),
                    ));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(JwksError::Joined(failures))
        }
    }

    /// Reconciles one authority's keys with its JWKS document.
    #[instrument(skip(self, authority), fields(issuer = %authority.issuer))]
    pub async fn update_ha(&self, authority: &HealthAuthority) -> Result<(), JwksError> {
        let now = OffsetDateTime::now_utc();
        let uri = authority.jwks_uri.as_deref().map(str::trim).unwrap_or("");

        // Purging long-revoked keys is best effort.
        let threshold = now - self.config.cleanup_ttl;
        match self.store.purge_keys(authority.id, threshold).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "purged expired keys"),
            Err(e) => warn!(error = %e, "key purge failed, continuing"),
        }

        let current = self.store.get_keys(authority.id).await?;
        let remote = self.fetch_keys(uri).await?;

        let remote_bodies: HashSet<String> =
            remote.iter().map(|(_, pem)| pem_body(pem)).collect();
        let local_bodies: HashSet<String> = current
            .iter()
            .map(|key| pem_body(&key.public_key_pem))
            .collect();

        let mut revoked = 0u32;
        for key in &current {
            if remote_bodies.contains(&pem_body(&key.public_key_pem)) {
                continue;
            }
            // Already-closed windows stay as they are.
            if key.thru.is_some_and(|thru| thru <= now) {
                continue;
            }
            let mut key = key.clone();
            key.revoke(now);
            self.store.update_key(&key).await?;
            revoked += 1;
        }

        let mut inserted = 0u32;
        for (kid, pem) in &remote {
            if local_bodies.contains(&pem_body(pem)) {
                continue;
            }
            let key = HealthAuthorityKey {
                authority_id: authority.id,
                version: kid.clone(),
                from: now,
                thru: None,
                public_key_pem: pem.clone(),
            };
            self.store.add_key(authority, &key).await?;
            inserted += 1;
        }

        info!(inserted, revoked, "authority keys reconciled");
        Ok(())
    }

    /// Fetches and converts the authority's JWKS document: a JSON array of
    /// JWK objects, each yielding `(kid, SPKI PEM)`.
    async fn fetch_keys(&self, uri: &str) -> Result<Vec<(String, String)>, JwksError> {
        debug!(uri, "fetching JWKS document");
        let response = self
            .client
            .get(uri)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(JwksError::Status {
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await?;
        let jwks: Vec<Jwk> =
            serde_json::from_slice(&body).map_err(|e| JwksError::Parse(e.to_string()))?;

        jwks.iter()
            .map(|jwk| {
                let kid = jwk
                    .common
                    .key_id
                    .clone()
                    .ok_or_else(|| JwksError::Key("missing kid".to_string()))?;
                Ok((kid, jwk_to_pem(jwk)?))
            })
            .collect()
    }
}

/// Converts an EC P-256 JWK into a trimmed SPKI PEM.
fn jwk_to_pem(jwk: &Jwk) -> Result<String, JwksError> {
    use p256::elliptic_curve::sec1::FromEncodedPoint;
    use p256::pkcs8::EncodePublicKey;

    let AlgorithmParameters::EllipticCurve(params) = &jwk.algorithm else {
        return Err(JwksError::Key(
            "only elliptic-curve keys are supported".to_string(),
        ));
    };
    if params.curve != EllipticCurve::P256 {
        return Err(JwksError::Key(format!(
            "unsupported curve {:?}",
            params.curve
        )));
    }

    let x = URL_SAFE_NO_PAD
        .decode(&params.x)
        .map_err(|e| JwksError::Key(format!("x coordinate: {e}")))?;
    let y = URL_SAFE_NO_PAD
        .decode(&params.y)
        .map_err(|e| JwksError::Key(format!("y coordinate: {e}")))?;
    if x.len() != 32 || y.len() != 32 {
        return Err(JwksError::Key("coordinates must be 32 bytes".to_string()));
    }

    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(&x),
        p256::FieldBytes::from_slice(&y),
        false,
    );
    let key = Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(&point))
        .ok_or_else(|| JwksError::Key("point is not on the curve".to_string()))?;

    let pem = key
        .to_public_key_pem(p256::pkcs8::LineEnding::LF)
        .map_err(|e| JwksError::Key(e.to_string()))?;
    Ok(pem.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use p256::pkcs8::{EncodePublicKey, LineEnding};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use enx_storage::memory::{MemoryHealthAuthorityStore, MemoryLockManager};

    fn new_public_key() -> (p256::PublicKey, String) {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let key = secret.public_key();
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .unwrap()
            .trim()
            .to_string();
        (key, pem)
    }

    fn jwk_json(kid: &str, key: &p256::PublicKey) -> serde_json::Value {
        let point = key.to_encoded_point(false);
        json!({
            "kty": "EC",
            "crv": "P-256",
            "kid": kid,
            "use": "sig",
            "alg": "ES256",
            "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
            "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
        })
    }

    async fn seed_authority(
        store: &MemoryHealthAuthorityStore,
        issuer: &str,
        jwks_uri: &str,
    ) -> HealthAuthority {
        let mut authority = HealthAuthority {
            id: 0,
            issuer: issuer.to_string(),
            audience: "aud".to_string(),
            name: "name".to_string(),
            jwks_uri: Some(jwks_uri.to_string()),
            enable_stats_api: false,
            keys: vec![],
        };
        store.add(&mut authority).await.unwrap();
        authority
    }

    fn manager(
        store: Arc<MemoryHealthAuthorityStore>,
        locks: Arc<MemoryLockManager>,
    ) -> JwksManager {
        JwksManager::new(
            store,
            locks,
            JwksConfig::default().with_request_timeout(Duration::from_secs(2)),
        )
    }

    #[test]
    fn test_jwk_to_pem_matches_spki_encoding() {
        let (key, pem) = new_public_key();
        let jwk: Jwk = serde_json::from_value(jwk_json("v1", &key)).unwrap();
        let converted = jwk_to_pem(&jwk).unwrap();
        assert_eq!(pem_body(&converted), pem_body(&pem));
        assert_eq!(converted, converted.trim());
    }

    #[test]
    fn test_jwk_to_pem_rejects_non_ec() {
        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "RSA",
            "kid": "r1",
            "n": "AQAB",
            "e": "AQAB",
        }))
        .unwrap();
        assert!(matches!(jwk_to_pem(&jwk), Err(JwksError::Key(_))));
    }

    #[tokio::test]
    async fn test_update_ha_inserts_and_leaves_common_keys() {
        let mock = MockServer::start().await;
        let store = Arc::new(MemoryHealthAuthorityStore::new());
        let locks = Arc::new(MemoryLockManager::new());

        let (key1, pem1) = new_public_key();
        let (key2, _pem2) = new_public_key();

        let uri = format!("{}/jwks", mock.uri());
        let authority = seed_authority(&store, "doh.example", &uri).await;
        let stored = HealthAuthorityKey {
            authority_id: authority.id,
            version: "v1".to_string(),
            from: OffsetDateTime::now_utc() - time::Duration::days(7),
            thru: None,
            public_key_pem: pem1.clone(),
        };
        store.add_key(&authority, &stored).await.unwrap();

        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([jwk_json("v1", &key1), jwk_json("v2", &key2)])),
            )
            .mount(&mock)
            .await;

        let manager = manager(Arc::clone(&store), Arc::clone(&locks));
        manager.update_ha(&authority).await.unwrap();

        let keys = store.get_keys(authority.id).await.unwrap();
        assert_eq!(keys.len(), 2);
        // v1 untouched: same window, same PEM.
        assert_eq!(keys[0].version, "v1");
        assert!(keys[0].thru.is_none());
        assert_eq!(keys[0].public_key_pem, pem1);
        // v2 inserted open-ended.
        assert_eq!(keys[1].version, "v2");
        assert!(keys[1].thru.is_none());
    }

    #[tokio::test]
    async fn test_update_ha_revokes_departed_keys() {
        let mock = MockServer::start().await;
        let store = Arc::new(MemoryHealthAuthorityStore::new());
        let locks = Arc::new(MemoryLockManager::new());

        let (key1, pem1) = new_public_key();
        let (_key2, pem2) = new_public_key();

        let uri = format!("{}/jwks", mock.uri());
        let authority = seed_authority(&store, "doh.example", &uri).await;
        for (version, pem) in [("v1", &pem1), ("v2", &pem2)] {
            let key = HealthAuthorityKey {
                authority_id: authority.id,
                version: version.to_string(),
                from: OffsetDateTime::now_utc() - time::Duration::days(7),
                thru: None,
                public_key_pem: pem.clone(),
            };
            store.add_key(&authority, &key).await.unwrap();
        }

        // Remote now only advertises v1.
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([jwk_json("v1", &key1)])))
            .mount(&mock)
            .await;

        let manager = manager(Arc::clone(&store), Arc::clone(&locks));
        manager.update_ha(&authority).await.unwrap();

        let keys = store.get_keys(authority.id).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].thru.is_none(), "v1 must stay untouched");
        assert!(keys[1].thru.is_some(), "v2 must be revoked");
    }

    #[tokio::test]
    async fn test_update_ha_matches_on_pem_body_not_kid() {
        let mock = MockServer::start().await;
        let store = Arc::new(MemoryHealthAuthorityStore::new());
        let locks = Arc::new(MemoryLockManager::new());

        let (key1, pem1) = new_public_key();
        let uri = format!("{}/jwks", mock.uri());
        let authority = seed_authority(&store, "doh.example", &uri).await;
        let stored = HealthAuthorityKey {
            authority_id: authority.id,
            version: "v1".to_string(),
            from: OffsetDateTime::now_utc() - time::Duration::days(7),
            thru: None,
            public_key_pem: pem1,
        };
        store.add_key(&authority, &stored).await.unwrap();

        // Same key re-published under a different kid: no churn.
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([jwk_json("renamed", &key1)])),
            )
            .mount(&mock)
            .await;

        let manager = manager(Arc::clone(&store), Arc::clone(&locks));
        manager.update_ha(&authority).await.unwrap();

        let keys = store.get_keys(authority.id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].version, "v1");
        assert!(keys[0].thru.is_none());
    }

    #[tokio::test]
    async fn test_update_all_already_locked_is_noop() {
        let store = Arc::new(MemoryHealthAuthorityStore::new());
        let locks = Arc::new(MemoryLockManager::new());
        let manager = manager(store, Arc::clone(&locks));

        let held = locks
            .lock(JWKS_LOCK_ID, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            manager.update_all().await.unwrap(),
            UpdateOutcome::AlreadyLocked
        );

        held.unlock().await.unwrap();
        assert_eq!(manager.update_all().await.unwrap(), UpdateOutcome::Updated);
    }

    #[tokio::test]
    async fn test_update_all_joins_independent_failures() {
        let mock = MockServer::start().await;
        let store = Arc::new(MemoryHealthAuthorityStore::new());
        let locks = Arc::new(MemoryLockManager::new());

        let (key1, _pem1) = new_public_key();
        seed_authority(&store, "bad.example", &format!("{}/broken", mock.uri())).await;
        seed_authority(&store, "good.example", &format!("{}/jwks", mock.uri())).await;

        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([jwk_json("v1", &key1)])))
            .mount(&mock)
            .await;

        let manager = manager(Arc::clone(&store), Arc::clone(&locks));
        let err = manager.update_all().await.unwrap_err();
        match err {
            JwksError::Joined(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "bad.example");
            }
            other => panic!("expected joined error, got {other}"),
        }

        // The healthy authority was still updated.
        let good = store.get_by_issuer("good.example").await.unwrap();
        assert_eq!(good.keys.len(), 1);

        // And the lease was released despite the failure.
        locks
            .lock(JWKS_LOCK_ID, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_ha_skips_authorities_without_200() {
        let mock = MockServer::start().await;
        let store = Arc::new(MemoryHealthAuthorityStore::new());
        let locks = Arc::new(MemoryLockManager::new());

        let uri = format!("{}/jwks", mock.uri());
        let authority = seed_authority(&store, "doh.example", &uri).await;

        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock)
            .await;

        let manager = manager(store, locks);
        assert!(matches!(
            manager.update_ha(&authority).await,
            Err(JwksError::Status { status: 404 })
        ));
    }
}
