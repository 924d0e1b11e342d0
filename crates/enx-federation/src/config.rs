//! Configuration for the federation-out service.

use std::time::Duration;

/// Tunables for the federation `Fetch` RPC.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Server-side cap on keys per response (default: 500).
    pub max_records: u32,

    /// Deadline for one `Fetch`; a shorter caller RPC deadline wins
    /// (default: 60 seconds).
    pub fetch_timeout: Duration,

    /// Fetches cover the most recent *complete* window of this length;
    /// keys created inside the open window are withheld to avoid racing
    /// publishers (default: 1 hour).
    pub truncate_window: Duration,

    /// TTL for cached peer authorization lookups (default: 5 minutes).
    pub auth_cache_ttl: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_records: 500,
            fetch_timeout: Duration::from_secs(60),
            truncate_window: Duration::from_secs(3600),
            auth_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl FederationConfig {
    /// Sets the per-response record cap.
    #[must_use]
    pub fn with_max_records(mut self, max_records: u32) -> Self {
        self.max_records = max_records;
        self
    }

    /// Sets the fetch deadline.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the window truncation length.
    #[must_use]
    pub fn with_truncate_window(mut self, window: Duration) -> Self {
        self.truncate_window = window;
        self
    }
}
