//! Time arithmetic shared by the publish and federation pipelines.
//!
//! Exposure keys are aligned to 10-minute rolling intervals counted from the
//! unix epoch. Federation fetches are bounded to the most recent *complete*
//! window so callers never race keys still being published into the current
//! one.

use std::time::Duration;

use time::OffsetDateTime;

/// Length of one rolling interval.
pub const INTERVAL_LENGTH: Duration = Duration::from_secs(600);

/// Returns the current UTC time.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Returns the rolling interval number containing `t` (10-minute units since
/// the unix epoch).
#[must_use]
pub fn interval_number(t: OffsetDateTime) -> i32 {
    (t.unix_timestamp() / INTERVAL_LENGTH.as_secs() as i64) as i32
}

/// Returns the instant at which interval `n` begins.
#[must_use]
pub fn interval_start(n: i32) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(i64::from(n) * INTERVAL_LENGTH.as_secs() as i64)
        .expect("interval number out of range")
}

/// Truncates `t` down to the start of the window of length `window`
/// containing it.
///
/// A zero-length window returns `t` unchanged.
#[must_use]
pub fn truncate_window(t: OffsetDateTime, window: Duration) -> OffsetDateTime {
    let secs = window.as_secs() as i64;
    if secs == 0 {
        return t;
    }
    let ts = t.unix_timestamp();
    OffsetDateTime::from_unix_timestamp(ts - ts.rem_euclid(secs))
        .expect("truncated timestamp out of range")
}
