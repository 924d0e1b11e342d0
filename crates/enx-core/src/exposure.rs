//! Exposure keys as persisted by the publish pipeline.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Length of exposure key material in bytes. Keys of any other length are
/// malformed and silently dropped during export.
pub const KEY_LENGTH: usize = 16;

/// Report type attached to a diagnosis.
///
/// The database stores the lower-case string form; the wire carries the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    ConfirmedTest,
    ConfirmedClinicalDiagnosis,
    Revoked,
    Unknown,
}

impl ReportType {
    /// Maps a database report-type string to the transport enum.
    ///
    /// Unrecognized strings map to [`ReportType::Unknown`] rather than
    /// failing: the federation stream must keep flowing across schema
    /// evolution on the peer side.
    #[must_use]
    pub fn from_database_string(s: &str) -> Self {
        match s {
            "confirmed" => Self::ConfirmedTest,
            "likely" => Self::ConfirmedClinicalDiagnosis,
            "negative" => Self::Revoked,
            _ => Self::Unknown,
        }
    }

    /// The database string form, if this report type has one.
    #[must_use]
    pub fn as_database_str(&self) -> Option<&'static str> {
        match self {
            Self::ConfirmedTest => Some("confirmed"),
            Self::ConfirmedClinicalDiagnosis => Some("likely"),
            Self::Revoked => Some("negative"),
            Self::Unknown => None,
        }
    }
}

/// A stored exposure, as persisted by the publish pipeline.
///
/// Revision fields are populated when a later publish updated the report
/// type (e.g. a likely diagnosis confirmed or revoked); revised keys are
/// exported in their own federation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub id: i64,
    pub exposure_key: Vec<u8>,
    pub transmission_risk: i32,
    pub regions: Vec<String>,
    pub interval_number: i32,
    pub interval_count: i32,
    pub created_at: OffsetDateTime,
    pub local_provenance: bool,
    pub traveler: bool,
    pub report_type: String,
    pub days_since_symptom_onset: Option<i32>,
    pub revised_report_type: Option<String>,
    pub revised_at: Option<OffsetDateTime>,
    pub revised_transmission_risk: Option<i32>,
    pub revised_days_since_symptom_onset: Option<i32>,
}

/// Normalizes a region code: trimmed and upper-cased. Returns `None` for
/// blank input.
#[must_use]
pub fn normalize_region(region: &str) -> Option<String> {
    let trimmed = region.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Normalizes a list of region codes, dropping blanks and duplicates.
/// The result is sorted for deterministic comparison.
#[must_use]
pub fn normalize_regions(regions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = regions
        .iter()
        .filter_map(|r| normalize_region(r))
        .collect();
    out.sort();
    out.dedup();
    out
}
