//! Balance view models
//!
//! Balances are never stored by the core; they are read from the funds
//! engine and reshaped into these views.

use serde::{Deserialize, Serialize};

use crate::decimal::{Decimal, Quantity};
use crate::model::{SubAccountId, UserId};
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// Balance of one coin inside a sub-account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct BalanceEntry {
    /// Coin symbol
    pub coin: String,
    /// Free to trade or withdraw
    pub available: Quantity,
    /// Locked by open orders
    pub in_orders: Quantity,
    /// Locked by pending withdrawals
    pub in_withdrawals: Quantity,
    /// Value of the whole entry in BTC
    pub btc_value: Decimal,
}

impl BalanceEntry {
    /// Empty entry for a coin
    pub fn zero(coin: &str) -> Self {
        Self {
            coin: coin.to_string(),
            available: Quantity::ZERO,
            in_orders: Quantity::ZERO,
            in_withdrawals: Quantity::ZERO,
            btc_value: Decimal::ZERO,
        }
    }

    /// available + in_orders + in_withdrawals
    pub fn total(&self) -> Quantity {
        self.available + self.in_orders + self.in_withdrawals
    }
}

/// Balances of a (user, sub-account)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct Balances {
    pub user_id: UserId,
    pub sub_account_id: SubAccountId,
    pub entries: Vec<BalanceEntry>,
}

impl Balances {
    /// Entry for a coin, zero if the coin was never funded
    pub fn get(&self, coin: &str) -> BalanceEntry {
        self.entries
            .iter()
            .find(|e| e.coin == coin)
            .cloned()
            .unwrap_or_else(|| BalanceEntry::zero(coin))
    }

    /// Sum of BTC valuations
    pub fn total_btc(&self) -> Decimal {
        self.entries.iter().map(|e| e.btc_value).sum()
    }
}
