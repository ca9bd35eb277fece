//! Funds-engine port
//!
//! Balances live in an external funds engine. The core reads them and asks
//! the engine to move amounts between buckets; it never stores balances.

use std::collections::HashMap;

use async_trait::async_trait;
use common::decimal::{Decimal, Quantity};
use common::error::{Error, Result};
use common::model::balance::BalanceEntry;
use common::model::SubAccountId;
use dashmap::DashMap;
use tracing::debug;

/// Funds engine collaborator
#[async_trait]
pub trait FundsEngine: Send + Sync {
    /// Every coin balance of a sub-account; `btc_value` is left at zero
    async fn balances(&self, sub_account_id: SubAccountId) -> Result<Vec<BalanceEntry>>;

    /// One coin balance, zero when the coin was never held
    async fn balance(&self, sub_account_id: SubAccountId, coin: &str) -> Result<BalanceEntry>;

    /// Credit `available`
    async fn deposit(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()>;

    /// Move `amount` from `available` to `in_withdrawals`
    async fn lock_withdrawal(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()>;

    /// Move `amount` from `in_withdrawals` back to `available`
    async fn release_withdrawal(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()>;

    /// Remove `amount` from `in_withdrawals`; the funds left the exchange
    async fn consume_withdrawal(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()>;

    /// Move `available` funds between two sub-accounts
    async fn transfer(
        &self,
        from: SubAccountId,
        to: SubAccountId,
        coin: &str,
        amount: Quantity,
    ) -> Result<()>;
}

fn insufficient() -> Error {
    Error::InvalidInput("Insufficient balance".to_string())
}

/// Funds engine kept in memory
#[derive(Default)]
pub struct InMemoryFundsEngine {
    entries: DashMap<(SubAccountId, String), BalanceEntry>,
}

impl InMemoryFundsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(sub_account_id: SubAccountId, coin: &str) -> (SubAccountId, String) {
        (sub_account_id, coin.to_lowercase())
    }

    fn modify<F>(&self, sub_account_id: SubAccountId, coin: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut BalanceEntry) -> Result<()>,
    {
        let key = Self::key(sub_account_id, coin);
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| BalanceEntry::zero(&coin.to_lowercase()));
        // Work on a copy so a failed check leaves the entry untouched
        let mut updated = entry.clone();
        f(&mut updated)?;
        *entry = updated;
        Ok(())
    }

    /// Move `amount` from `available` to `in_orders`
    pub fn lock_order(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()> {
        self.modify(sub_account_id, coin, |e| {
            if e.available < amount {
                return Err(insufficient());
            }
            e.available -= amount;
            e.in_orders += amount;
            Ok(())
        })
    }

    /// Move `amount` from `in_orders` back to `available`
    pub fn release_order(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()> {
        self.modify(sub_account_id, coin, |e| {
            if e.in_orders < amount {
                return Err(Error::Internal("order lock underflow".to_string()));
            }
            e.in_orders -= amount;
            e.available += amount;
            Ok(())
        })
    }

    /// One side of a trade: `spent` leaves `in_orders`, `received` lands in
    /// `available` of the other coin
    pub fn settle_order(
        &self,
        sub_account_id: SubAccountId,
        spent_coin: &str,
        spent: Quantity,
        received_coin: &str,
        received: Quantity,
    ) -> Result<()> {
        self.modify(sub_account_id, spent_coin, |e| {
            if e.in_orders < spent {
                return Err(Error::Internal("order lock underflow".to_string()));
            }
            e.in_orders -= spent;
            Ok(())
        })?;
        self.modify(sub_account_id, received_coin, |e| {
            e.available += received;
            Ok(())
        })
    }
}

#[async_trait]
impl FundsEngine for InMemoryFundsEngine {
    async fn balances(&self, sub_account_id: SubAccountId) -> Result<Vec<BalanceEntry>> {
        let mut entries: Vec<BalanceEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == sub_account_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.coin.cmp(&b.coin));
        Ok(entries)
    }

    async fn balance(&self, sub_account_id: SubAccountId, coin: &str) -> Result<BalanceEntry> {
        Ok(self
            .entries
            .get(&Self::key(sub_account_id, coin))
            .map(|e| e.clone())
            .unwrap_or_else(|| BalanceEntry::zero(&coin.to_lowercase())))
    }

    async fn deposit(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidInput("Amount must be positive".to_string()));
        }
        debug!("Deposit {} {} to sub-account {}", amount, coin, sub_account_id);
        self.modify(sub_account_id, coin, |e| {
            e.available += amount;
            Ok(())
        })
    }

    async fn lock_withdrawal(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()> {
        self.modify(sub_account_id, coin, |e| {
            if e.available < amount {
                return Err(insufficient());
            }
            e.available -= amount;
            e.in_withdrawals += amount;
            Ok(())
        })
    }

    async fn release_withdrawal(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()> {
        self.modify(sub_account_id, coin, |e| {
            if e.in_withdrawals < amount {
                return Err(Error::Internal("withdrawal lock underflow".to_string()));
            }
            e.in_withdrawals -= amount;
            e.available += amount;
            Ok(())
        })
    }

    async fn consume_withdrawal(&self, sub_account_id: SubAccountId, coin: &str, amount: Quantity) -> Result<()> {
        self.modify(sub_account_id, coin, |e| {
            if e.in_withdrawals < amount {
                return Err(Error::Internal("withdrawal lock underflow".to_string()));
            }
            e.in_withdrawals -= amount;
            Ok(())
        })
    }

    async fn transfer(
        &self,
        from: SubAccountId,
        to: SubAccountId,
        coin: &str,
        amount: Quantity,
    ) -> Result<()> {
        self.modify(from, coin, |e| {
            if e.available < amount {
                return Err(insufficient());
            }
            e.available -= amount;
            Ok(())
        })?;
        self.modify(to, coin, |e| {
            e.available += amount;
            Ok(())
        })
    }
}

/// BTC valuation of coins
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Price of one unit of `coin` in BTC
    async fn btc_rate(&self, coin: &str) -> Result<Option<Decimal>>;

    /// Every known rate
    async fn all_rates(&self) -> Result<HashMap<String, Decimal>>;
}

/// Fixed rates, updated by hand
pub struct StaticRates {
    rates: DashMap<String, Decimal>,
}

impl StaticRates {
    pub fn new() -> Self {
        let rates = DashMap::new();
        rates.insert("btc".to_string(), Decimal::ONE);
        Self { rates }
    }

    pub fn set(&self, coin: &str, btc_rate: Decimal) {
        self.rates.insert(coin.to_lowercase(), btc_rate);
    }
}

impl Default for StaticRates {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateSource for StaticRates {
    async fn btc_rate(&self, coin: &str) -> Result<Option<Decimal>> {
        Ok(self.rates.get(&coin.to_lowercase()).map(|r| *r))
    }

    async fn all_rates(&self) -> Result<HashMap<String, Decimal>> {
        Ok(self
            .rates
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn lock_and_release_keep_the_sum() {
        let funds = InMemoryFundsEngine::new();
        funds.deposit(1, "btc", dec!(1.0)).await.unwrap();
        funds.lock_withdrawal(1, "BTC", dec!(0.4)).await.unwrap();

        let entry = funds.balance(1, "BTC").await.unwrap();
        assert_eq!(entry.available, dec!(0.6));
        assert_eq!(entry.in_withdrawals, dec!(0.4));
        assert_eq!(entry.total(), dec!(1.0));

        assert!(funds.lock_withdrawal(1, "BTC", dec!(0.7)).await.is_err());
        let entry = funds.balance(1, "BTC").await.unwrap();
        assert_eq!(entry.available, dec!(0.6));

        funds.release_withdrawal(1, "BTC", dec!(0.4)).await.unwrap();
        assert_eq!(funds.balance(1, "BTC").await.unwrap().available, dec!(1.0));
    }

    #[tokio::test]
    async fn order_locks_settle_into_the_other_coin() {
        let funds = InMemoryFundsEngine::new();
        funds.deposit(1, "usdt", dec!(100)).await.unwrap();
        funds.lock_order(1, "usdt", dec!(60)).unwrap();
        assert!(funds.lock_order(1, "usdt", dec!(41)).is_err());

        funds.settle_order(1, "usdt", dec!(50), "btc", dec!(0.5)).unwrap();
        funds.release_order(1, "usdt", dec!(10)).unwrap();
        assert!(funds.release_order(1, "usdt", dec!(1)).is_err());

        let usdt = funds.balance(1, "usdt").await.unwrap();
        assert_eq!(usdt.available, dec!(50));
        assert_eq!(usdt.in_orders, dec!(0));
        assert_eq!(funds.balance(1, "btc").await.unwrap().available, dec!(0.5));
    }
}
