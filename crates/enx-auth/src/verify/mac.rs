//! HMAC binding between a diagnosis certificate and its publish payload.
//!
//! The certificate's `signed_mac` claim commits the signer to the exact keys
//! being published. The canonical message sorts keys by their base64 string,
//! renders each as `<key>.<interval_number>.<interval_count>.<risk>` and
//! joins the lines with `,`. Two canonicalizations are accepted: the current
//! one carrying each key's transmission risk, and the older one with the
//! risk forced to zero for clients that omit risk scoring. The zero-risk
//! form is only admissible when no key on the wire carries a risk score;
//! otherwise a tampered risk value would still validate against it. Both
//! MACs are always computed and compared; acceptance never short-circuits
//! on the first mismatch.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted HMAC secret length in bytes.
pub const MIN_SECRET_LENGTH: usize = 16;
/// Maximum accepted HMAC secret length in bytes.
pub const MAX_SECRET_LENGTH: usize = 32;

/// One key from a publish request, as covered by the MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishKey {
    /// Base64 of the 16-byte key material.
    pub key: String,
    pub interval_number: i32,
    pub interval_count: i32,
    #[serde(default)]
    pub transmission_risk: i32,
}

/// Renders the canonical MAC message. `zero_risk` selects the older
/// canonicalization with the transmission risk forced to zero.
#[must_use]
pub fn canonical_message(keys: &[PublishKey], zero_risk: bool) -> String {
    let mut sorted: Vec<&PublishKey> = keys.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let lines: Vec<String> = sorted
        .iter()
        .map(|k| {
            let risk = if zero_risk { 0 } else { k.transmission_risk };
            format!(
                "{}.{}.{}.{}",
                k.key, k.interval_number, k.interval_count, risk
            )
        })
        .collect();
    lines.join(",")
}

/// Computes HMAC-SHA-256 of `message` under `secret`.
#[must_use]
pub fn compute(secret: &[u8], message: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Whether `signed_mac` equals an accepted canonicalization's MAC.
///
/// Both candidates are computed and compared unconditionally under
/// constant-time equality; the zero-risk candidate only counts when every
/// key on the wire has a zero transmission risk.
#[must_use]
pub fn accepts(keys: &[PublishKey], secret: &[u8], signed_mac: &[u8]) -> bool {
    let all_zero_risk = keys.iter().all(|k| k.transmission_risk == 0);

    let current = compute(secret, &canonical_message(keys, false));
    let legacy = compute(secret, &canonical_message(keys, true));

    let matches_current = current.as_slice().ct_eq(signed_mac);
    let matches_legacy =
        legacy.as_slice().ct_eq(signed_mac) & subtle::Choice::from(u8::from(all_zero_risk));
    bool::from(matches_current | matches_legacy)
}
