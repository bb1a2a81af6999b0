use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

/// One cached format lookup: the format string configured on a log group,
/// the id of the flow log it came from, and how many flow logs were found on
/// the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFormat {
    pub format: String,
    pub flow_log_id: String,
    pub flow_log_count: i64,
    cached_at: Instant,
}

/// A concurrency-safe memoizer of flow log format strings, keyed by log
/// group name. Entries expire after a TTL but are only evicted when a reader
/// next observes them (opportunistic eviction), so the map never needs a
/// background sweeper.
///
/// Lives for the lifetime of the process; everything else in a delivery is
/// per-invocation.
#[derive(Debug)]
pub struct FormatCache {
    entries: RwLock<HashMap<String, CachedFormat>>,
    ttl: Duration,
}

impl FormatCache {
    pub fn new(ttl: Duration) -> FormatCache {
        FormatCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Looks up the cached format for a log group. Returns None on a miss,
    /// including the case where an entry exists but has outlived the TTL, in
    /// which case the stale entry is deleted on the way out.
    pub fn get(&self, log_group: &str) -> Option<CachedFormat> {
        let expired = {
            let entries = self.entries.read().unwrap();
            match entries.get(log_group) {
                None => return None,
                Some(entry) if entry.cached_at.elapsed() <= self.ttl => {
                    return Some(entry.clone());
                }
                Some(_) => true,
            }
        };
        // The read lock must be fully released before we take the write
        // lock; RwLock does not support upgrading in place.
        debug_assert!(expired);

        let mut entries = self.entries.write().unwrap();
        // Re-check under exclusive access: a concurrent writer may have
        // refreshed the entry between our unlock and lock, and a concurrent
        // reader may have already deleted it.
        match entries.get(log_group) {
            Some(entry) if entry.cached_at.elapsed() <= self.ttl => Some(entry.clone()),
            Some(_) => {
                entries.remove(log_group);
                None
            }
            None => None,
        }
    }

    /// Stores a format lookup result, overwriting any prior entry and
    /// stamping the current time.
    pub fn set(&self, log_group: &str, format: &str, flow_log_id: &str, flow_log_count: i64) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            log_group.to_owned(),
            CachedFormat {
                format: format.to_owned(),
                flow_log_id: flow_log_id.to_owned(),
                flow_log_count,
                cached_at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn contains(&self, log_group: &str) -> bool {
        self.entries.read().unwrap().contains_key(log_group)
    }
}
