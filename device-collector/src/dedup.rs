//! In-memory "already published" set.
//!
//! Entries expire a fixed time after they were written, and once the cache is full the
//! least recently written keys are evicted first. The cache lives only as long as the
//! process: after a restart every device may be published once more, so downstream
//! consumers must tolerate duplicates keyed by device id.

use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;

#[derive(Clone)]
pub struct DedupCache {
    cache: Cache<String, ()>,
}

impl DedupCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self { cache }
    }

    /// Atomically claims `key`. Returns true if the key was not live and is now claimed by
    /// the caller, false if another caller claimed it within the window.
    ///
    /// A rejected claim does not count as an access, so eviction order stays by write time.
    pub fn try_claim(&self, key: &str) -> bool {
        if self.cache.contains_key(key) {
            return false;
        }
        self.cache.entry_by_ref(key).or_insert(()).is_fresh()
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Approximate number of live entries. Eviction is applied lazily, so this may briefly
    /// run above capacity until pending maintenance runs.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("cache", &"<moka cache>")
            .finish()
    }
}
