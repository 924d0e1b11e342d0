//! Error types for certificate verification and JWKS reconciliation.

use enx_storage::StorageError;

/// Errors from diagnosis-certificate and stats-token verification.
///
/// `NotYetValid` and `Expired` are distinct so callers can treat clock skew
/// differently from replay. Everything in this enum is surfaced to peers as
/// a generic authentication failure; the detail exists for logs and tests.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Structurally invalid token: not a JWT, wrong algorithm, missing
    /// `kid`, undecodable segment.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The token's issuer is not a known health authority.
    #[error("Unknown issuer: {0}")]
    UnknownIssuer(String),

    /// The token's audience does not match the authority's configured
    /// audience (or the stats audience, on the stats path).
    #[error("Audience mismatch")]
    AudienceMismatch,

    /// No key with the token's `kid` is valid right now.
    #[error("No valid public keys for token")]
    NoPublicKeys,

    /// The ECDSA signature did not verify.
    #[error("Signature invalid")]
    SignatureInvalid,

    /// The token's `iat`/`nbf` lies in the future.
    #[error("Token not valid yet")]
    NotValidYet,

    /// The token's `exp` has passed.
    #[error("Token expired")]
    Expired,

    /// The signed MAC matches neither accepted canonicalization of the
    /// publish payload.
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// The app is not allowed to publish for this health authority.
    #[error("App not authorized for health authority {health_authority_id}")]
    UnauthorizedApp { health_authority_id: i64 },

    /// The authority exists but has the stats API disabled.
    #[error("Stats API not enabled for this health authority")]
    StatsNotEnabled,

    /// A claim failed its domain rule (report type, onset interval, secret
    /// length).
    #[error("Invalid claims: {0}")]
    InvalidClaims(String),

    /// The health-authority lookup failed for a reason other than absence.
    #[error("Lookup failed: {0}")]
    Lookup(#[from] StorageError),
}

/// Errors from JWKS reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// Network failure reaching the JWKS endpoint.
    #[error("JWKS fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-200 status.
    #[error("JWKS endpoint returned status {status}")]
    Status { status: u16 },

    /// The document was not a JWK array.
    #[error("Failed to parse JWKS document: {0}")]
    Parse(String),

    /// A JWK could not be converted to a stored key.
    #[error("Invalid JWK: {0}")]
    Key(String),

    /// A storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A worker task died before reporting a result.
    #[error("Worker failed: {0}")]
    Worker(String),

    /// Independent per-authority failures, joined.
    #[error("{}", join_failures(.0))]
    Joined(Vec<(String, JwksError)>),
}

fn join_failures(failures: &[(String, JwksError)]) -> String {
    let parts: Vec<String> = failures
        .iter()
        .map(|(issuer, err)| format!("{issuer}: {err}"))
        .collect();
    format!(
        "{} authority update(s) failed: {}",
        failures.len(),
        parts.join("; ")
    )
}
