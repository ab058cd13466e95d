use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::slice::SliceRuntime;

/// Memoizes per-(user, slice) runtimes for the round that is currently live.
/// Rebuilding a slice for every click is pure CPU; under hot contention the
/// same few slices are requested thousands of times, so a small bounded map
/// pays for itself. Eviction picks an arbitrary victim: correctness only
/// needs bounded size, recomputation is always possible.
pub struct RuntimeCache {
    max_users: usize,
    max_slices_per_user: usize,
    inner: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    round_id: i64,
    salt: String,
    users: HashMap<i64, HashMap<usize, Arc<SliceRuntime>>>,
}

impl RuntimeCache {
    pub fn new(max_users: usize, max_slices_per_user: usize) -> Self {
        Self {
            max_users,
            max_slices_per_user,
            inner: Mutex::new(CacheState::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_users > 0 && self.max_slices_per_user > 0
    }

    /// Drops everything; called when the current runtime is replaced.
    pub fn reset(&self) {
        if !self.enabled() {
            return;
        }
        let mut state = self.inner.lock();
        state.round_id = 0;
        state.salt.clear();
        state.users.clear();
    }

    pub fn get(&self, round_id: i64, salt: &str, user_id: i64, slice_id: usize) -> Option<Arc<SliceRuntime>> {
        if !self.enabled() {
            return None;
        }
        let mut state = self.inner.lock();
        if state.round_id != round_id || state.salt != salt {
            state.round_id = round_id;
            state.salt = salt.to_string();
            state.users.clear();
            return None;
        }
        state.users.get(&user_id).and_then(|slices| slices.get(&slice_id)).cloned()
    }

    /// Inserts under the capacity bounds. A stale (round, salt) pair means a
    /// runtime swap raced the rebuild; the value is still valid for the
    /// caller but must not repopulate the cache.
    pub fn put(&self, round_id: i64, salt: &str, user_id: i64, slice_id: usize, runtime: Arc<SliceRuntime>) {
        if !self.enabled() {
            return;
        }
        let mut state = self.inner.lock();
        if state.round_id != round_id || state.salt != salt {
            return;
        }
        if !state.users.contains_key(&user_id) && state.users.len() >= self.max_users {
            if let Some(victim) = state.users.keys().next().copied() {
                state.users.remove(&victim);
            }
        }
        let slices = state.users.entry(user_id).or_default();
        if !slices.contains_key(&slice_id) && slices.len() >= self.max_slices_per_user {
            if let Some(victim) = slices.keys().next().copied() {
                slices.remove(&victim);
            }
        }
        slices.insert(slice_id, runtime);
    }

    #[cfg(test)]
    fn user_count(&self) -> usize {
        self.inner.lock().users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::slice::{build_slice_runtime, SliceManifest};

    fn runtime(seed: u32) -> Arc<SliceRuntime> {
        Arc::new(build_slice_runtime(&SliceManifest {
            slice_id: 0,
            start_at_ms: 0,
            duration_ms: 1_000,
            drop_count: 4,
            bomb_count: 1,
            big_count: 0,
            empty_count: 0,
            big_multiplier: 2.0,
            window_ms: 1_200,
            seed,
            score_total: 10,
        }))
    }

    #[test]
    fn test_hit_after_put() {
        let cache = RuntimeCache::new(4, 4);
        assert!(cache.get(1, "s", 10, 0).is_none());
        cache.put(1, "s", 10, 0, runtime(1));
        assert!(cache.get(1, "s", 10, 0).is_some());
    }

    #[test]
    fn test_round_change_invalidates() {
        let cache = RuntimeCache::new(4, 4);
        cache.get(1, "s", 10, 0);
        cache.put(1, "s", 10, 0, runtime(1));
        assert!(cache.get(1, "s", 10, 0).is_some());
        assert!(cache.get(2, "s", 10, 0).is_none());
        // the old round's entry is gone too
        assert!(cache.get(1, "s", 10, 0).is_none());
    }

    #[test]
    fn test_salt_change_invalidates() {
        let cache = RuntimeCache::new(4, 4);
        cache.get(1, "a", 10, 0);
        cache.put(1, "a", 10, 0, runtime(1));
        assert!(cache.get(1, "a", 10, 0).is_some());
        assert!(cache.get(1, "b", 10, 0).is_none());
    }

    #[test]
    fn test_stale_put_ignored() {
        let cache = RuntimeCache::new(4, 4);
        cache.get(1, "s", 10, 0);
        // a get under the new round flips the tracked (round, salt)
        assert!(cache.get(2, "s", 10, 0).is_none());
        cache.put(1, "s", 10, 0, runtime(1));
        assert!(cache.get(1, "s", 10, 0).is_none());
    }

    #[test]
    fn test_user_capacity_bound() {
        let cache = RuntimeCache::new(2, 4);
        cache.get(1, "s", 0, 0);
        cache.put(1, "s", 1, 0, runtime(1));
        cache.put(1, "s", 2, 0, runtime(1));
        cache.put(1, "s", 3, 0, runtime(1));
        assert_eq!(cache.user_count(), 2);
    }

    #[test]
    fn test_slice_capacity_bound() {
        let cache = RuntimeCache::new(2, 2);
        cache.get(1, "s", 0, 0);
        for slice_id in 0..5 {
            cache.put(1, "s", 7, slice_id, runtime(slice_id as u32 + 1));
        }
        let hits = (0..5).filter(|&s| cache.get(1, "s", 7, s).is_some()).count();
        assert_eq!(hits, 2);
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache = RuntimeCache::new(0, 4);
        assert!(!cache.enabled());
        cache.put(1, "s", 1, 0, runtime(1));
        assert!(cache.get(1, "s", 1, 0).is_none());
    }
}
