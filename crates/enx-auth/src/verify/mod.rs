//! Diagnosis-certificate verification.
//!
//! A publish request carries a JWT minted by a health authority's
//! certificate service plus the HMAC secret the client used to bind the
//! payload. Verification proceeds strictly in this order: parse the header,
//! resolve the issuer, check the audience, verify the ECDSA signature
//! against a currently-valid authority key, and only then consult the
//! app's authority membership — checking membership first would leak the
//! authorized set through timing. Custom claims and the payload HMAC come
//! last.

pub mod claims;
pub mod mac;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use enx_core::{AuthorizedApp, HealthAuthority, VerifiedClaims};
use enx_storage::HealthAuthorityStore;

use crate::cache::KeyLookupCache;
use crate::error::VerifyError;

pub use claims::{CertificateClaims, TransmissionRiskOverride};
pub use mac::{MAX_SECRET_LENGTH, MIN_SECRET_LENGTH, PublishKey};

/// Configuration for the certificate verifier.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Clock skew tolerated on temporal claims (default: 60 seconds).
    pub clock_skew: Duration,

    /// Audience required of stats-API tokens.
    pub stats_audience: String,

    /// TTL for cached issuer lookups, positive and negative (default: 5
    /// minutes).
    pub cache_ttl: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            clock_skew: Duration::from_secs(60),
            stats_audience: String::new(),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl VerifierConfig {
    /// Sets the tolerated clock skew.
    #[must_use]
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Sets the stats-API audience.
    #[must_use]
    pub fn with_stats_audience(mut self, audience: impl Into<String>) -> Self {
        self.stats_audience = audience.into();
        self
    }

    /// Sets the issuer-lookup cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// The slice of a publish request the verifier consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub keys: Vec<PublishKey>,
    /// The diagnosis certificate (a JWT).
    pub verification_payload: String,
    /// Base64 of the 16–32 byte HMAC secret the client generated.
    pub hmac_key: String,
}

/// Verifies diagnosis certificates and stats-API tokens.
pub struct CertificateVerifier {
    store: Arc<dyn HealthAuthorityStore>,
    cache: KeyLookupCache<HealthAuthority>,
    config: VerifierConfig,
}

impl CertificateVerifier {
    /// Creates a verifier over the given authority store.
    #[must_use]
    pub fn new(store: Arc<dyn HealthAuthorityStore>, config: VerifierConfig) -> Self {
        let cache = KeyLookupCache::new(config.cache_ttl);
        Self {
            store,
            cache,
            config,
        }
    }

    /// Verifies a publish request's certificate and payload binding.
    #[instrument(skip_all, fields(app = %app.app_package_name))]
    pub async fn verify(
        &self,
        app: &AuthorizedApp,
        publish: &PublishRequest,
    ) -> Result<VerifiedClaims, VerifyError> {
        let now = OffsetDateTime::now_utc();
        let token = &publish.verification_payload;

        let kid = checked_header(token)?;
        let unverified = unverified_claims(token)?;

        let authority = self.authority_by_issuer(&unverified.iss).await?;
        if unverified.aud != authority.audience {
            return Err(VerifyError::AudienceMismatch);
        }

        let claims = self.decode_against_authority(token, &kid, &authority, &authority.audience, now)?;

        // Membership is checked strictly after signature verification.
        if !app.is_authorized_for(authority.id) {
            return Err(VerifyError::UnauthorizedApp {
                health_authority_id: authority.id,
            });
        }

        claims.validate_custom(now)?;

        let secret = BASE64
            .decode(&publish.hmac_key)
            .map_err(|e| VerifyError::InvalidClaims(format!("hmac key: {e}")))?;
        if !(MIN_SECRET_LENGTH..=MAX_SECRET_LENGTH).contains(&secret.len()) {
            return Err(VerifyError::InvalidClaims(format!(
                "hmac secret must be {MIN_SECRET_LENGTH}-{MAX_SECRET_LENGTH} bytes, got {}",
                secret.len()
            )));
        }
        let signed_mac = BASE64
            .decode(&claims.signed_mac)
            .map_err(|e| VerifyError::InvalidClaims(format!("signed mac: {e}")))?;
        if !mac::accepts(&publish.keys, &secret, &signed_mac) {
            return Err(VerifyError::HmacMismatch);
        }

        debug!(
            health_authority_id = authority.id,
            report_type = %claims.report_type,
            "certificate verified"
        );
        Ok(VerifiedClaims {
            health_authority_id: authority.id,
            report_type: claims.report_type,
            symptom_onset_interval: claims.symptom_onset_interval,
        })
    }

    /// Verifies a stats-API token, returning the authority id.
    ///
    /// Reuses the certificate parse-and-lookup pipeline, but the audience
    /// is the server-configured stats audience and the authority must have
    /// the stats API enabled.
    #[instrument(skip_all)]
    pub async fn verify_stats_token(&self, token: &str) -> Result<i64, VerifyError> {
        let now = OffsetDateTime::now_utc();
        let kid = checked_header(token)?;
        let unverified = unverified_claims(token)?;

        let authority = self.authority_by_issuer(&unverified.iss).await?;
        if unverified.aud != self.config.stats_audience {
            return Err(VerifyError::AudienceMismatch);
        }

        self.decode_against_authority(token, &kid, &authority, &self.config.stats_audience, now)?;

        if !authority.enable_stats_api {
            return Err(VerifyError::StatsNotEnabled);
        }
        Ok(authority.id)
    }

    async fn authority_by_issuer(&self, issuer: &str) -> Result<HealthAuthority, VerifyError> {
        let loaded = self
            .cache
            .write_through(issuer, || async {
                match self.store.get_by_issuer(issuer).await {
                    Ok(ha) => Ok(Some(ha)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(VerifyError::Lookup(e)),
                }
            })
            .await?;
        loaded.ok_or_else(|| VerifyError::UnknownIssuer(issuer.to_string()))
    }

    /// Selects the authority key named by `kid` that is valid now and
    /// verifies signature and temporal claims against it.
    fn decode_against_authority(
        &self,
        token: &str,
        kid: &str,
        authority: &HealthAuthority,
        audience: &str,
        now: OffsetDateTime,
    ) -> Result<CertificateClaims, VerifyError> {
        let key = authority
            .find_key_valid_at(kid, now)
            .ok_or(VerifyError::NoPublicKeys)?;
        let decoding_key = DecodingKey::from_ec_pem(key.public_key_pem.as_bytes())
            .map_err(|e| VerifyError::Lookup(enx_storage::StorageError::internal(format!(
                "stored public key unusable: {e}"
            ))))?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[audience]);
        validation.leeway = self.config.clock_skew.as_secs();
        validation.validate_nbf = true;

        let data = decode::<CertificateClaims>(token, &decoding_key, &validation)
            .map_err(map_jwt_error)?;

        // `iat` in the future is "not valid yet", distinct from expiry.
        if let Some(iat) = data.claims.iat
            && iat > (now.unix_timestamp() + self.config.clock_skew.as_secs() as i64)
        {
            return Err(VerifyError::NotValidYet);
        }
        Ok(data.claims)
    }
}

/// Parses the JWT header, requiring ES256 and a `kid`.
fn checked_header(token: &str) -> Result<String, VerifyError> {
    let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    if header.alg != Algorithm::ES256 {
        return Err(VerifyError::Malformed(format!(
            "signing method must be ES256, got {:?}",
            header.alg
        )));
    }
    header
        .kid
        .ok_or_else(|| VerifyError::Malformed("kid header required".to_string()))
}

/// Shape of the claims needed before signature verification.
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: String,
    #[serde(default)]
    aud: String,
}

/// Reads `iss`/`aud` from the claims segment without verifying anything.
/// Key selection needs the issuer before a signature check is possible.
fn unverified_claims(token: &str) -> Result<UnverifiedClaims, VerifyError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    let data = decode::<UnverifiedClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| VerifyError::Malformed(format!("claims: {e}")))?;
    Ok(data.claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> VerifyError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => VerifyError::Expired,
        ErrorKind::ImmatureSignature => VerifyError::NotValidYet,
        ErrorKind::InvalidAudience => VerifyError::AudienceMismatch,
        ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
        _ => VerifyError::Malformed(err.to_string()),
    }
}
