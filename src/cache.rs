//! TTL key/value cache for provider responses.
//!
//! Entries become invisible to readers after the soft TTL and are physically
//! purged by a janitor task after the hard TTL. Between the two an expired
//! entry may linger in storage without being observable. There is no bound on
//! entry count; keys here are bounded by the number of active chats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

/// Soft TTL: how long a saved entry stays visible to `try_get`.
pub const DEFAULT_SOFT_TTL: Duration = Duration::from_secs(5 * 60);
/// Hard TTL: how long until the janitor physically removes an entry.
pub const DEFAULT_HARD_TTL: Duration = Duration::from_secs(10 * 60);

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// In-memory cache with soft-expiry reads and periodic hard cleanup.
///
/// Cheap to clone; all clones share the same storage.
pub struct TtlCache<V> {
    entries: Arc<DashMap<String, Entry<V>>>,
    soft_ttl: Duration,
    hard_ttl: Duration,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            soft_ttl: self.soft_ttl,
            hard_ttl: self.hard_ttl,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(soft_ttl: Duration, hard_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            soft_ttl,
            hard_ttl,
        }
    }

    /// Cache with the default 5 minute / 10 minute expiration windows.
    #[must_use]
    pub fn with_default_ttls() -> Self {
        Self::new(DEFAULT_SOFT_TTL, DEFAULT_HARD_TTL)
    }

    /// Store a value under `key` with the default expiration.
    pub fn save(&self, key: &str, value: V) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Fetch a value if it exists and its soft TTL has not elapsed.
    pub fn try_get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() >= self.soft_ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Remove an entry. No-op if the key is absent.
    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of physically stored entries, including soft-expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the cleanup task that purges entries past the hard TTL.
    ///
    /// Runs until the returned handle is aborted or the runtime shuts down.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let hard_ttl = self.hard_ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hard_ttl);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let before = entries.len();
                entries.retain(|_, entry| entry.stored_at.elapsed() < hard_ttl);
                let purged = before.saturating_sub(entries.len());
                if purged > 0 {
                    debug!(purged, "cache janitor removed expired entries");
                }
            }
        })
    }
}
