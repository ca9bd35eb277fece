//! Process-wide coalescing caches
//!
//! Both structures are created at startup, shared behind `Arc`, and drained
//! by a single background consumer.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::model::{SubAccountId, UserId};

/// Multi-producer/single-consumer set of keys changed since the last drain
#[derive(Debug)]
pub struct DirtySet<K> {
    keys: Mutex<HashSet<K>>,
}

/// A (user, sub-account) whose balance view changed
pub type DirtyBalances = DirtySet<(UserId, SubAccountId)>;

impl<K: Eq + Hash + Clone> DirtySet<K> {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
        }
    }

    /// Record a change; repeated marks before the next drain coalesce
    pub fn mark(&self, key: K) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.insert(key);
    }

    /// Take every key marked since the previous drain
    pub fn drain(&self) -> Vec<K> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for DirtySet<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse per-user liveness timestamps
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_seen: DashMap<UserId, DateTime<Utc>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity now
    pub fn touch(&self, user_id: UserId) {
        self.touch_at(user_id, Utc::now());
    }

    /// Record activity at a given instant
    pub fn touch_at(&self, user_id: UserId, at: DateTime<Utc>) {
        self.last_seen.insert(user_id, at);
    }

    pub fn last_seen(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.last_seen.get(&user_id).map(|t| *t)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.last_seen.contains_key(&user_id)
    }

    /// Drop entries last seen before `cutoff`, returning how many were removed
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.last_seen.len();
        self.last_seen.retain(|_, seen| *seen >= cutoff);
        before - self.last_seen.len()
    }

    pub fn online_count(&self) -> usize {
        self.last_seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn marks_coalesce_until_drained() {
        let dirty: DirtyBalances = DirtySet::new();
        dirty.mark((1, 10));
        dirty.mark((1, 10));
        dirty.mark((2, 20));
        let mut drained = dirty.drain();
        drained.sort();
        assert_eq!(drained, vec![(1, 10), (2, 20)]);
        assert!(dirty.is_empty());
    }

    #[test]
    fn prune_drops_stale_users() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.touch_at(1, now - Duration::seconds(20));
        tracker.touch_at(2, now);
        assert_eq!(tracker.prune_older_than(now - Duration::seconds(15)), 1);
        assert!(!tracker.is_online(1));
        assert!(tracker.is_online(2));
    }
}
