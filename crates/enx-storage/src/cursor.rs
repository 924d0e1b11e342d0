//! Opaque continuation cursors for exposure iteration.
//!
//! A continuation is a keyset position `(timestamp, row id)` encoded as
//! unpadded base64url. Callers must treat the token as opaque and echo it
//! verbatim; only storage backends decode it.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::StorageError;

/// Encodes a keyset position.
#[must_use]
pub fn encode_cursor(ts: i64, id: i64) -> String {
    URL_SAFE_NO_PAD.encode(format!("{ts}:{id}"))
}

/// Decodes a keyset position produced by [`encode_cursor`].
pub fn decode_cursor(token: &str) -> Result<(i64, i64), StorageError> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| StorageError::internal(format!("malformed cursor: {e}")))?;
    let raw = String::from_utf8(raw)
        .map_err(|e| StorageError::internal(format!("malformed cursor: {e}")))?;
    let (ts, id) = raw
        .split_once(':')
        .ok_or_else(|| StorageError::internal("malformed cursor"))?;
    Ok((
        ts.parse()
            .map_err(|e| StorageError::internal(format!("malformed cursor: {e}")))?,
        id.parse()
            .map_err(|e| StorageError::internal(format!("malformed cursor: {e}")))?,
    ))
}
