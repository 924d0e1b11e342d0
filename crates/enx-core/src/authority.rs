//! Health authorities and their versioned signing keys.
//!
//! A health authority is identified by its JWT issuer and holds an ordered
//! set of ECDSA P-256 public keys, each addressed by a version string (the
//! JWT `kid`). Keys carry an activation window; revocation closes the window
//! rather than deleting the key so in-flight certificates fail cleanly.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{CoreError, Result};

/// A health authority: an issuer trusted to sign diagnosis certificates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAuthority {
    /// Stable numeric id; zero until persisted.
    pub id: i64,
    /// JWT issuer; the natural key, unique across authorities.
    pub issuer: String,
    /// Expected JWT audience for certificates from this authority.
    pub audience: String,
    /// Human-readable name.
    pub name: String,
    /// JWKS endpoint for automatic key reconciliation, when the authority
    /// publishes one.
    pub jwks_uri: Option<String>,
    /// Whether this authority may mint stats-API tokens.
    pub enable_stats_api: bool,
    /// Signing keys, in insertion order.
    #[serde(default)]
    pub keys: Vec<HealthAuthorityKey>,
}

impl HealthAuthority {
    /// Validates the invariants for inserting a new authority: issuer,
    /// audience and name non-empty, no keys attached yet (keys are added
    /// afterwards), and a non-blank JWKS URI when present.
    pub fn validate_new(&self) -> Result<()> {
        if self.issuer.trim().is_empty() {
            return Err(CoreError::invalid_authority("issuer must not be empty"));
        }
        if self.audience.trim().is_empty() {
            return Err(CoreError::invalid_authority("audience must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid_authority("name must not be empty"));
        }
        if !self.keys.is_empty() {
            return Err(CoreError::invalid_authority(
                "an authority must be inserted without keys",
            ));
        }
        if let Some(uri) = &self.jwks_uri
            && uri.trim().is_empty()
        {
            return Err(CoreError::invalid_authority(
                "jwks_uri must not be blank when present",
            ));
        }
        Ok(())
    }

    /// Whether JWKS reconciliation applies to this authority.
    #[must_use]
    pub fn jwks_enabled(&self) -> bool {
        self.jwks_uri
            .as_deref()
            .is_some_and(|uri| !uri.trim().is_empty())
    }

    /// Finds the key with the given version that is valid at `t`.
    #[must_use]
    pub fn find_key_valid_at(
        &self,
        version: &str,
        t: OffsetDateTime,
    ) -> Option<&HealthAuthorityKey> {
        self.keys
            .iter()
            .find(|k| k.version == version && k.is_valid_at(t))
    }
}

/// A versioned public key belonging to a health authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAuthorityKey {
    pub authority_id: i64,
    /// Key version; matches the JWT `kid` header.
    pub version: String,
    /// Activation instant. A key is valid strictly after this.
    pub from: OffsetDateTime,
    /// Deactivation instant; `None` means open-ended.
    pub thru: Option<OffsetDateTime>,
    /// SPKI PEM encoding of the ECDSA P-256 public key, trimmed.
    pub public_key_pem: String,
}

impl HealthAuthorityKey {
    /// A key is valid at `t` iff `t > from` and `thru` is unset or after `t`.
    #[must_use]
    pub fn is_valid_at(&self, t: OffsetDateTime) -> bool {
        t > self.from && self.thru.is_none_or(|thru| thru > t)
    }

    /// Closes the validity window at `now`.
    ///
    /// For future-dated keys (`now <= from`) the window is clamped shut at
    /// `from` so the valid-at test never admits the key.
    pub fn revoke(&mut self, now: OffsetDateTime) {
        self.thru = Some(if now <= self.from { self.from } else { now });
    }

    /// Validates the window ordering and that the PEM parses to an ECDSA
    /// public key.
    pub fn validate(&self) -> Result<()> {
        if let Some(thru) = self.thru
            && thru < self.from
        {
            return Err(CoreError::InvalidTimeRange {
                from: self.from.unix_timestamp(),
                thru: thru.unix_timestamp(),
            });
        }
        parse_public_key_pem(&self.public_key_pem).map(|_| ())
    }
}

/// Parses a trimmed SPKI PEM into an ECDSA P-256 public key.
pub fn parse_public_key_pem(pem: &str) -> Result<p256::PublicKey> {
    use p256::pkcs8::DecodePublicKey;

    p256::PublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| CoreError::invalid_public_key(e.to_string()))
}

/// Strips the PEM armor and all whitespace, leaving the base64 body.
///
/// This is the canonical identity test for key material: two PEM documents
/// describe the same key iff their stripped bodies are equal, regardless of
/// the `kid` they were published under.
#[must_use]
pub fn pem_body(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.split_whitespace())
        .collect()
}
