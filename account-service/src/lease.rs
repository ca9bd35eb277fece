//! Per-sub-account leases
//!
//! A lease is the sub-account's mutex, held while an operation both reads and
//! writes its balances. When two are needed they are taken in ascending ID
//! order.

use common::locks::{KeyGuard, KeyedLocks};
use common::model::SubAccountId;
use tracing::trace;

/// Exclusive hold on one sub-account; released on drop
pub struct Lease {
    sub_account_id: SubAccountId,
    _guard: KeyGuard<SubAccountId>,
}

impl Lease {
    pub fn sub_account_id(&self) -> SubAccountId {
        self.sub_account_id
    }
}

/// Exclusive hold on two sub-accounts
pub struct PairLease {
    _first: Lease,
    _second: Option<Lease>,
}

/// Sub-account mutexes, kept only while leased or awaited
#[derive(Default)]
pub struct LeaseManager {
    locks: KeyedLocks<SubAccountId>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, sub_account_id: SubAccountId) -> Lease {
        let guard = self.locks.lock(sub_account_id).await;
        trace!("lease acquired on sub-account {}", sub_account_id);
        Lease {
            sub_account_id,
            _guard: guard,
        }
    }

    /// Lock two sub-accounts, lower ID first
    pub async fn acquire_pair(&self, a: SubAccountId, b: SubAccountId) -> PairLease {
        if a == b {
            return PairLease {
                _first: self.acquire(a).await,
                _second: None,
            };
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let first = self.acquire(low).await;
        let second = self.acquire(high).await;
        PairLease {
            _first: first,
            _second: Some(second),
        }
    }

    /// Whether the sub-account is currently leased
    pub fn is_held(&self, sub_account_id: SubAccountId) -> bool {
        self.locks.is_held(&sub_account_id)
    }

    /// Sub-accounts with a live mutex
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn lease_is_released_on_drop() {
        let leases = LeaseManager::new();
        {
            let lease = leases.acquire(5).await;
            assert_eq!(lease.sub_account_id(), 5);
            assert!(leases.is_held(5));
        }
        assert!(!leases.is_held(5));
        assert_eq!(leases.tracked(), 0);
    }

    #[tokio::test]
    async fn opposite_pairs_do_not_deadlock() {
        let leases = Arc::new(LeaseManager::new());
        let mut tasks = Vec::new();
        for i in 0..20 {
            let leases = leases.clone();
            tasks.push(tokio::spawn(async move {
                let (a, b) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
                let _pair = leases.acquire_pair(a, b).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
        }
        let all = futures_join(tasks);
        tokio::time::timeout(Duration::from_secs(5), all)
            .await
            .expect("pair leases deadlocked");
        assert_eq!(leases.tracked(), 0);
    }

    async fn futures_join(tasks: Vec<tokio::task::JoinHandle<()>>) {
        for task in tasks {
            task.await.unwrap();
        }
    }
}
