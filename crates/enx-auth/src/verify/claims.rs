//! Diagnosis-certificate claims and their domain rules.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::VerifyError;

/// Report types a certificate may carry.
const ACCEPTED_REPORT_TYPES: &[&str] = &["confirmed", "likely", "negative"];

/// Claims carried by a diagnosis certificate.
///
/// Registered claims are handled by the JWT layer; this struct adds the
/// custom claims binding the certificate to the publish payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateClaims {
    pub iss: String,
    pub aud: String,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
    pub exp: i64,

    /// Base64 HMAC over the canonical publish payload.
    pub signed_mac: String,
    /// One of `confirmed`, `likely`, `negative`.
    #[serde(default)]
    pub report_type: String,
    /// Rolling interval of symptom onset.
    #[serde(default)]
    pub symptom_onset_interval: u32,
    /// Optional per-interval transmission-risk overrides, passed through to
    /// the publish pipeline untouched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transmission_risks: Vec<TransmissionRiskOverride>,
}

/// A transmission-risk override effective from a rolling interval onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionRiskOverride {
    pub transmission_risk: i32,
    pub since_rolling_interval: i32,
}

impl CertificateClaims {
    /// Validates the custom-claim domain rules: a recognized report type and
    /// an onset interval no later than one day past `now`.
    pub fn validate_custom(&self, now: OffsetDateTime) -> Result<(), VerifyError> {
        if !ACCEPTED_REPORT_TYPES.contains(&self.report_type.as_str()) {
            return Err(VerifyError::InvalidClaims(format!(
                "unsupported report type {:?}",
                self.report_type
            )));
        }

        let horizon = enx_core::interval_number(now + time::Duration::days(1));
        if self.symptom_onset_interval > horizon as u32 {
            return Err(VerifyError::InvalidClaims(format!(
                "symptom onset interval {} is in the future",
                self.symptom_onset_interval
            )));
        }
        Ok(())
    }
}
