//! Per-key async mutexes
//!
//! A key's entry lives only while someone holds or waits for its lock, so the
//! table stays as small as the set of keys in use.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Table<K> = DashMap<K, Arc<Mutex<()>>>;

/// Async mutex per key
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
    table: Arc<Table<K>>,
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock of `key`
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        // Cloned under the shard lock; release counts references under it too
        let mutex = self
            .table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            key: Some(key),
            guard: Some(guard),
            table: self.table.clone(),
        }
    }

    /// Whether `key` is locked right now
    pub fn is_held(&self, key: &K) -> bool {
        self.table
            .get(key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Keys with a live entry
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Held lock of one key; released on drop
pub struct KeyGuard<K: Eq + Hash> {
    key: Option<K>,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<Table<K>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(key) = self.key.take() {
            self.table.remove_if(&key, |_, m| Arc::strong_count(m) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn entries_go_away_after_release() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock(1).await;
            let _b = locks.lock(2).await;
            assert_eq!(locks.len(), 2);
            assert!(locks.is_held(&1));
        }
        assert!(locks.is_empty());
        assert!(!locks.is_held(&1));
    }

    #[tokio::test]
    async fn waiters_keep_the_entry_alive() {
        let locks = Arc::new(KeyedLocks::new());
        let first = locks.lock(7).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(7).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(first);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn one_holder_at_a_time() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("key").await;
                assert_eq!(inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(locks.is_empty());
    }
}
