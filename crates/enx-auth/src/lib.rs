//! # enx-auth
//!
//! The authorization and key-management substrate of the ENX key server:
//!
//! - [`KeyLookupCache`] — TTL-bounded write-through cache with singleflight
//!   loads and negative caching
//! - [`CertificateVerifier`] — validates diagnosis certificates (ES256 JWTs
//!   bound to the publish payload by HMAC) and stats-API tokens
//! - [`JwksManager`] — reconciles each health authority's stored signing
//!   keys with its advertised JWKS document
//! - [`oidc`] — OIDC ID-token validation for federation peers

pub mod cache;
pub mod error;
pub mod jwks;
pub mod oidc;
pub mod verify;

pub use cache::KeyLookupCache;
pub use error::{JwksError, VerifyError};
pub use jwks::{JwksConfig, JwksManager, UpdateOutcome};
pub use oidc::{IdTokenClaims, IdTokenValidator, OidcError};
pub use verify::{CertificateVerifier, PublishRequest, VerifierConfig};
