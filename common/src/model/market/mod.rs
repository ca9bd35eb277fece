//! Market and coin reference data

use serde::{Deserialize, Serialize};

use crate::decimal::Quantity;
use crate::model::withdraw::ExternalSystem;
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// Market configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct Market {
    /// Market ID (e.g., "btcusdt")
    pub id: String,
    /// Base coin symbol (e.g., "btc")
    pub base_coin: String,
    /// Quote coin symbol (e.g., "usdt")
    pub quote_coin: String,
    /// Decimal places accepted in prices
    pub price_precision: u32,
    /// Decimal places accepted in amounts
    pub amount_precision: u32,
    /// Minimum order amount in base coin
    pub min_amount: Quantity,
    /// Whether trading is enabled
    pub active: bool,
}

/// Withdraw fee for one external system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawFee {
    pub system: ExternalSystem,
    pub fee: Quantity,
}

/// Coin reference data needed by the withdrawal workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    /// Lowercase symbol (e.g., "btc")
    pub symbol: String,
    /// Chain the coin lives on (e.g., "bitcoin")
    pub chain: String,
    /// Decimal places withdrawals are quantized to
    pub token_precision: u32,
    pub min_withdraw: Quantity,
    /// Regex a destination address must match on on-chain custody
    pub address_pattern: Option<String>,
    /// Fees per external system; a system without a fee entry is not supported
    pub withdraw_fees: Vec<WithdrawFee>,
}

impl Coin {
    /// Fee for the given external system
    pub fn fee_for(&self, system: ExternalSystem) -> Option<Quantity> {
        self.withdraw_fees
            .iter()
            .find(|f| f.system == system)
            .map(|f| f.fee)
    }
}
