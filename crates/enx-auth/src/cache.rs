//! TTL-bounded write-through cache with singleflight loads.
//!
//! Lookups against the health-authority and federation-authorization stores
//! sit on the hot path of every publish and federation call. This cache
//! collapses concurrent identical lookups into one load and caches both
//! positive and negative results for the configured TTL. Negative caching
//! keeps an attacker probing unknown issuers from amplifying into database
//! traffic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// One cached slot. `value` is `None` until the first successful load;
/// `Some(None)` is the negative sentinel.
struct Slot<T> {
    value: Option<Option<T>>,
    expires_at: Instant,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            value: None,
            expires_at: Instant::now(),
        }
    }

    fn fresh(&self) -> bool {
        self.value.is_some() && Instant::now() < self.expires_at
    }
}

/// Write-through cache keyed by string.
///
/// `write_through` returns `Ok(None)` for a cached (or freshly loaded)
/// negative result; loader failures are returned to the caller and never
/// cached.
pub struct KeyLookupCache<T> {
    ttl: Duration,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot<T>>>>>,
}

impl<T: Clone> KeyLookupCache<T> {
    /// Creates a cache whose entries (positive and negative alike) expire
    /// after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the fresh entry under `key`, or invokes `loader` exactly once
    /// to populate it.
    ///
    /// Concurrent callers for the same key serialize on a per-key latch:
    /// while one loader runs, the others wait and then observe its result.
    /// A loader returning `Ok(None)` caches the absence; a loader returning
    /// `Err` leaves the slot untouched so the next caller retries.
    pub async fn write_through<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(
                slots
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Slot::empty()))),
            )
        };

        // Per-key latch: the map lock above is held only for the entry
        // clone, so loads for different keys proceed independently.
        let mut slot = slot.lock().await;
        if slot.fresh() {
            return Ok(slot.value.clone().unwrap_or_default());
        }

        let value = loader().await?;
        slot.value = Some(value.clone());
        slot.expires_at = Instant::now() + self.ttl;
        Ok(value)
    }

    /// Drops expired slots. Latches for keys currently loading are kept.
    pub async fn purge_expired(&self) {
        let mut slots = self.slots.lock().await;
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard.fresh(),
            // A held latch means a load is in flight; keep it.
            Err(_) => true,
        });
    }

    /// Number of slots currently held, fresh or not.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Whether the cache holds no slots.
    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}
