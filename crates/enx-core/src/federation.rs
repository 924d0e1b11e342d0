//! Federation records: peer authorizations, fetch cursors, verified claims.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Authorization record for a federation peer, keyed by the OIDC
/// `(issuer, subject)` pair from its bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationOutAuthorization {
    pub issuer: String,
    pub subject: String,
    /// When set, the token's audience must equal this exactly.
    pub audience: Option<String>,
    /// Regions this peer may receive. Intersected with the regions the
    /// caller requests.
    pub include_regions: BTreeSet<String>,
    /// Regions withheld from this peer. Unioned with the regions the caller
    /// excludes.
    pub exclude_regions: BTreeSet<String>,
    /// Free-text operator note.
    pub note: String,
}

/// Resumable position in one timestamp-ordered key stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// High-water unix-seconds timestamp; monotonic across successful pages.
    pub timestamp: i64,
    /// Opaque database continuation; empty when none.
    pub next_token: String,
}

impl Cursor {
    /// Raises the high-water mark; never lowers it.
    pub fn advance_to(&mut self, timestamp: i64) {
        if timestamp > self.timestamp {
            self.timestamp = timestamp;
        }
    }
}

/// The pair of cursors a federation caller echoes between fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchState {
    pub key_cursor: Cursor,
    pub revised_key_cursor: Cursor,
}

/// Output of a successful certificate verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub health_authority_id: i64,
    pub report_type: String,
    pub symptom_onset_interval: u32,
}
