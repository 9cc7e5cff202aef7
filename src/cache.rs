//! Process-local transient game state.
//!
//! Everything here legitimately resets on restart: the cycle itself restarts,
//! and the scheduler rebuilds timer handles through startup reconciliation.
//! Unset keys read back as absent values, never errors.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::profile::MemberId;

/// Opaque handle to an armed timer. Cancelling is immediate and total.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub trait GameCache: Send + Sync {
    fn add_fetcher(&self, community_id: &str, member_id: &str);
    fn clear_fetchers(&self, community_id: &str);
    /// Members who fetched this cycle; empty when nothing is recorded.
    fn fetchers(&self, community_id: &str) -> Vec<MemberId>;

    fn set_last_summon_time(&self, community_id: &str, time: DateTime<Utc>);
    fn last_summon_time(&self, community_id: &str) -> Option<DateTime<Utc>>;

    fn set_appearance_bounds(&self, community_id: &str, description: String);
    fn appearance_bounds(&self, community_id: &str) -> Option<String>;

    fn set_timer(&self, community_id: &str, handle: TimerHandle);
    /// Removes and returns the active handle, leaving the slot empty.
    fn take_timer(&self, community_id: &str) -> Option<TimerHandle>;
}

#[derive(Default)]
pub struct InMemoryGameCache {
    fetchers: Mutex<HashMap<String, Vec<MemberId>>>,
    summon_times: Mutex<HashMap<String, DateTime<Utc>>>,
    bounds: Mutex<HashMap<String, String>>,
    timers: Mutex<HashMap<String, TimerHandle>>,
}

impl InMemoryGameCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GameCache for InMemoryGameCache {
    fn add_fetcher(&self, community_id: &str, member_id: &str) {
        Self::locked(&self.fetchers)
            .entry(community_id.to_string())
            .or_default()
            .push(member_id.to_string());
    }

    fn clear_fetchers(&self, community_id: &str) {
        Self::locked(&self.fetchers).insert(community_id.to_string(), Vec::new());
    }

    fn fetchers(&self, community_id: &str) -> Vec<MemberId> {
        Self::locked(&self.fetchers).get(community_id).cloned().unwrap_or_default()
    }

    fn set_last_summon_time(&self, community_id: &str, time: DateTime<Utc>) {
        Self::locked(&self.summon_times).insert(community_id.to_string(), time);
    }

    fn last_summon_time(&self, community_id: &str) -> Option<DateTime<Utc>> {
        Self::locked(&self.summon_times).get(community_id).copied()
    }

    fn set_appearance_bounds(&self, community_id: &str, description: String) {
        Self::locked(&self.bounds).insert(community_id.to_string(), description);
    }

    fn appearance_bounds(&self, community_id: &str) -> Option<String> {
        Self::locked(&self.bounds).get(community_id).cloned()
    }

    fn set_timer(&self, community_id: &str, handle: TimerHandle) {
        Self::locked(&self.timers).insert(community_id.to_string(), handle);
    }

    fn take_timer(&self, community_id: &str) -> Option<TimerHandle> {
        Self::locked(&self.timers).remove(community_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_keys_read_as_absent_values() {
        let cache = InMemoryGameCache::new();
        assert!(cache.fetchers("c1").is_empty());
        assert!(cache.last_summon_time("c1").is_none());
        assert!(cache.appearance_bounds("c1").is_none());
        assert!(cache.take_timer("c1").is_none());
    }

    #[test]
    fn fetchers_accumulate_and_clear() {
        let cache = InMemoryGameCache::new();
        cache.add_fetcher("c1", "alice");
        cache.add_fetcher("c1", "bob");
        cache.add_fetcher("c2", "carol");
        assert_eq!(cache.fetchers("c1"), vec!["alice".to_string(), "bob".to_string()]);
        cache.clear_fetchers("c1");
        assert!(cache.fetchers("c1").is_empty());
        assert_eq!(cache.fetchers("c2"), vec!["carol".to_string()]);
    }

    #[test]
    fn summon_time_and_bounds_roundtrip() {
        let cache = InMemoryGameCache::new();
        let now = Utc::now();
        cache.set_last_summon_time("c1", now);
        assert_eq!(cache.last_summon_time("c1"), Some(now));
        cache.set_appearance_bounds("c1", "soon".to_string());
        assert_eq!(cache.appearance_bounds("c1"), Some("soon".to_string()));
    }

    #[tokio::test]
    async fn timer_slot_is_take_once() {
        let cache = InMemoryGameCache::new();
        let handle = TimerHandle::new(tokio::spawn(async {}));
        cache.set_timer("c1", handle);
        let taken = cache.take_timer("c1");
        assert!(taken.is_some());
        assert!(cache.take_timer("c1").is_none());
        taken.unwrap().cancel();
    }
}
