//! OIDC ID-token validation for federation peers.
//!
//! The federation-out server authenticates callers by the OIDC ID token in
//! their bearer metadata. Validation itself is a collaborator behind
//! [`IdTokenValidator`] so deployments can plug their identity platform in;
//! [`ProviderIdTokenValidator`] is the standard implementation, verifying
//! tokens against the provider's published JWKS endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Signing algorithms accepted on peer ID tokens.
const ACCEPTED_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256, Algorithm::ES256];

/// Claims extracted from a validated ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdTokenClaims {
    pub issuer: String,
    pub subject: String,
    pub audiences: Vec<String>,
}

impl IdTokenClaims {
    /// Whether the token was minted for the given audience.
    #[must_use]
    pub fn has_audience(&self, audience: &str) -> bool {
        self.audiences.iter().any(|a| a == audience)
    }
}

/// Errors from ID-token validation.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// Structurally invalid token.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The provider's JWKS does not contain the token's `kid`.
    #[error("Signing key not found: {0}")]
    KeyNotFound(String),

    /// Signature or registered-claim validation failed.
    #[error("Token invalid: {0}")]
    Invalid(String),

    /// The provider JWKS could not be fetched.
    #[error("JWKS fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// Validates OIDC ID tokens.
#[async_trait]
pub trait IdTokenValidator: Send + Sync {
    /// Validates `token` and returns its identity claims.
    async fn validate(&self, token: &str) -> Result<IdTokenClaims, OidcError>;
}

/// Configuration for [`ProviderIdTokenValidator`].
#[derive(Debug, Clone)]
pub struct ProviderIdTokenValidatorConfig {
    /// The provider's JWKS endpoint.
    pub jwks_uri: Url,

    /// When set, the token's `iss` must equal this.
    pub expected_issuer: Option<String>,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// How long a fetched JWKS is reused (default: 1 hour).
    pub cache_ttl: Duration,
}

impl ProviderIdTokenValidatorConfig {
    /// Creates a configuration for the given JWKS endpoint.
    #[must_use]
    pub fn new(jwks_uri: Url) -> Self {
        Self {
            jwks_uri,
            expected_issuer: None,
            request_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(3600),
        }
    }

    /// Pins the expected issuer.
    #[must_use]
    pub fn with_expected_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    /// Sets the JWKS cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Raw registered claims; `aud` may be a string or an array.
#[derive(Debug, Deserialize)]
struct RawIdClaims {
    iss: String,
    sub: String,
    aud: Audience,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl From<Audience> for Vec<String> {
    fn from(aud: Audience) -> Self {
        match aud {
            Audience::One(a) => vec![a],
            Audience::Many(many) => many,
        }
    }
}

/// ID-token validator backed by a provider JWKS endpoint.
pub struct ProviderIdTokenValidator {
    config: ProviderIdTokenValidatorConfig,
    client: reqwest::Client,
    cached: RwLock<Option<(JwkSet, Instant)>>,
}

impl ProviderIdTokenValidator {
    /// Creates a validator for the configured provider.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(config: ProviderIdTokenValidatorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            client,
            cached: RwLock::new(None),
        }
    }

    async fn jwks(&self) -> Result<JwkSet, OidcError> {
        {
            let cached = self.cached.read().await;
            if let Some((jwks, fetched_at)) = cached.as_ref()
                && fetched_at.elapsed() < self.config.cache_ttl
            {
                return Ok(jwks.clone());
            }
        }

        debug!(uri = %self.config.jwks_uri, "fetching provider JWKS");
        let jwks: JwkSet = self
            .client
            .get(self.config.jwks_uri.as_str())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut cached = self.cached.write().await;
        *cached = Some((jwks.clone(), Instant::now()));
        Ok(jwks)
    }
}

#[async_trait]
impl IdTokenValidator for ProviderIdTokenValidator {
    async fn validate(&self, token: &str) -> Result<IdTokenClaims, OidcError> {
        let header = decode_header(token).map_err(|e| OidcError::Malformed(e.to_string()))?;
        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(OidcError::Malformed(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| OidcError::Malformed("kid header required".to_string()))?;

        let jwks = self.jwks().await?;
        let jwk = jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(&kid))
            .ok_or_else(|| OidcError::KeyNotFound(kid.clone()))?;
        let decoding_key =
            DecodingKey::from_jwk(jwk).map_err(|e| OidcError::Invalid(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        // The authorization record pins the audience; it is not validated
        // here.
        validation.validate_aud = false;
        if let Some(issuer) = &self.config.expected_issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<RawIdClaims>(token, &decoding_key, &validation)
            .map_err(|e| OidcError::Invalid(e.to_string()))?;

        Ok(IdTokenClaims {
            issuer: data.claims.iss,
            subject: data.claims.sub,
            audiences: data.claims.aud.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Provider {
        mock: MockServer,
        encoding_key: EncodingKey,
    }

    async fn start_provider(kid: &str) -> Provider {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let private_pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        let point = secret.public_key().to_encoded_point(false);

        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "EC",
                    "crv": "P-256",
                    "kid": kid,
                    "use": "sig",
                    "alg": "ES256",
                    "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
                    "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
                }]
            })))
            .mount(&mock)
            .await;

        Provider {
            mock,
            encoding_key: EncodingKey::from_ec_pem(private_pem.as_bytes()).unwrap(),
        }
    }

    fn validator(provider: &Provider) -> ProviderIdTokenValidator {
        let jwks_uri = Url::parse(&format!("{}/jwks", provider.mock.uri())).unwrap();
        ProviderIdTokenValidator::new(ProviderIdTokenValidatorConfig::new(jwks_uri))
    }

    fn sign(provider: &Provider, kid: &str, claims: serde_json::Value) -> String {
        let header = Header {
            alg: Algorithm::ES256,
            kid: Some(kid.to_string()),
            ..Default::default()
        };
        encode(&header, &claims, &provider.encoding_key).unwrap()
    }

    fn exp() -> i64 {
        (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 300) as i64
    }

    #[tokio::test]
    async fn test_validate_id_token() {
        let provider = start_provider("peer-key").await;
        let validator = validator(&provider);

        let token = sign(
            &provider,
            "peer-key",
            json!({
                "iss": "https://peer.example",
                "sub": "fed-client",
                "aud": "exposure-federation",
                "exp": exp(),
            }),
        );
        let claims = validator.validate(&token).await.unwrap();
        assert_eq!(claims.issuer, "https://peer.example");
        assert_eq!(claims.subject, "fed-client");
        assert!(claims.has_audience("exposure-federation"));
        assert!(!claims.has_audience("other"));
    }

    #[tokio::test]
    async fn test_validate_audience_array() {
        let provider = start_provider("peer-key").await;
        let validator = validator(&provider);

        let token = sign(
            &provider,
            "peer-key",
            json!({
                "iss": "https://peer.example",
                "sub": "fed-client",
                "aud": ["a", "b"],
                "exp": exp(),
            }),
        );
        let claims = validator.validate(&token).await.unwrap();
        assert_eq!(claims.audiences, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_validate_unknown_kid() {
        let provider = start_provider("peer-key").await;
        let validator = validator(&provider);

        let token = sign(
            &provider,
            "other-key",
            json!({"iss": "i", "sub": "s", "aud": "a", "exp": exp()}),
        );
        assert!(matches!(
            validator.validate(&token).await,
            Err(OidcError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_expired_token() {
        let provider = start_provider("peer-key").await;
        let validator = validator(&provider);

        let token = sign(
            &provider,
            "peer-key",
            json!({"iss": "i", "sub": "s", "aud": "a", "exp": 1_000_000}),
        );
        assert!(matches!(
            validator.validate(&token).await,
            Err(OidcError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_issuer_pinning() {
        let provider = start_provider("peer-key").await;
        let jwks_uri = Url::parse(&format!("{}/jwks", provider.mock.uri())).unwrap();
        let validator = ProviderIdTokenValidator::new(
            ProviderIdTokenValidatorConfig::new(jwks_uri)
                .with_expected_issuer("https://peer.example"),
        );

        let token = sign(
            &provider,
            "peer-key",
            json!({"iss": "https://rogue.example", "sub": "s", "aud": "a", "exp": exp()}),
        );
        assert!(matches!(
            validator.validate(&token).await,
            Err(OidcError::Invalid(_))
        ));
    }
}
