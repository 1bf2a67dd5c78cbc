use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::{ExtractedStats, SubjectKey};
use crate::traits::Clock;

/// Default lifetime of a cached result.
pub const DEFAULT_CACHE_TTL: TimeDelta = TimeDelta::minutes(30);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: ExtractedStats,
    stored_at: DateTime<Utc>,
}

/// TTL cache of extraction results keyed by subject and region.
///
/// Expired entries are dropped when a lookup finds them; there is no
/// background sweep.
pub struct ResultCache {
    entries: Mutex<HashMap<SubjectKey, CacheEntry>>,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    pub fn new(ttl: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<SubjectKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned result cache mutex");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, key: &SubjectKey) -> Option<ExtractedStats> {
        let now = self.clock.now();
        let mut entries = self.lock_entries();

        let fresh = entries.get(key).map(|e| now - e.stored_at < self.ttl)?;
        if fresh {
            entries.get(key).map(|e| e.value.clone())
        } else {
            entries.remove(key);
            tracing::debug!(%key, "Evicted expired cache entry");
            None
        }
    }

    pub fn put(&self, key: SubjectKey, value: ExtractedStats) {
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now(),
        };
        self.lock_entries().insert(key, entry);
    }

    /// Drop every entry. Operator reset only.
    pub fn invalidate_all(&self) {
        let mut entries = self.lock_entries();
        let dropped = entries.len();
        entries.clear();
        tracing::info!(dropped, "Result cache cleared");
    }

    /// Number of stored entries, including expired ones not yet looked up.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ManualClock;

    fn stats(count: u64, clock: &ManualClock) -> ExtractedStats {
        ExtractedStats {
            subject_id: "123".into(),
            region: "US".into(),
            display_name: None,
            active_count: count,
            observed_at: clock.now(),
        }
    }

    #[test]
    fn hit_before_ttl_miss_after() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(DEFAULT_CACHE_TTL, Arc::new(clock.clone()));
        let key = SubjectKey::new("123", "US");

        cache.put(key.clone(), stats(42, &clock));

        clock.advance(TimeDelta::minutes(29));
        assert_eq!(cache.get(&key).map(|s| s.active_count), Some(42));

        clock.advance(TimeDelta::minutes(2));
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn expiry_is_exact_at_ttl() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(DEFAULT_CACHE_TTL, Arc::new(clock.clone()));
        let key = SubjectKey::new("123", "US");
        cache.put(key.clone(), stats(1, &clock));

        clock.advance(DEFAULT_CACHE_TTL - TimeDelta::milliseconds(1));
        assert!(cache.get(&key).is_some());
        clock.advance(TimeDelta::milliseconds(1));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn expired_entries_are_evicted_on_read_only() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(DEFAULT_CACHE_TTL, Arc::new(clock.clone()));
        let key = SubjectKey::new("123", "US");
        cache.put(key.clone(), stats(1, &clock));

        clock.advance(TimeDelta::hours(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn put_overwrites_and_restarts_ttl() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(DEFAULT_CACHE_TTL, Arc::new(clock.clone()));
        let key = SubjectKey::new("123", "US");

        cache.put(key.clone(), stats(1, &clock));
        clock.advance(TimeDelta::minutes(20));
        cache.put(key.clone(), stats(2, &clock));
        clock.advance(TimeDelta::minutes(20));

        assert_eq!(cache.get(&key).map(|s| s.active_count), Some(2));
    }

    #[test]
    fn keys_are_per_region() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(DEFAULT_CACHE_TTL, Arc::new(clock.clone()));
        cache.put(SubjectKey::new("123", "US"), stats(1, &clock));

        assert!(cache.get(&SubjectKey::new("123", "us")).is_some());
        assert!(cache.get(&SubjectKey::new("123", "GB")).is_none());
    }

    #[test]
    fn invalidate_all_clears() {
        let clock = ManualClock::new();
        let cache = ResultCache::new(DEFAULT_CACHE_TTL, Arc::new(clock.clone()));
        cache.put(SubjectKey::new("1", "US"), stats(1, &clock));
        cache.put(SubjectKey::new("2", "US"), stats(2, &clock));

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
