//! Coin catalog used by withdrawals

use std::sync::Arc;

use common::decimal::dec;
use common::error::{Error, Result};
use common::model::market::{Coin, WithdrawFee};
use common::model::withdraw::ExternalSystem;
use dashmap::DashMap;
use regex::Regex;

/// A coin and its compiled address pattern
#[derive(Clone)]
pub struct CatalogCoin {
    pub coin: Coin,
    address: Option<Regex>,
}

impl CatalogCoin {
    /// Whether `address` is a well-formed destination for this coin
    pub fn address_valid(&self, address: &str) -> bool {
        match &self.address {
            Some(re) => re.is_match(address),
            None => !address.trim().is_empty(),
        }
    }
}

/// Coins known to the exchange, keyed by lowercase symbol
#[derive(Default)]
pub struct CoinCatalog {
    coins: DashMap<String, Arc<CatalogCoin>>,
}

impl CoinCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a coin
    pub fn insert(&self, coin: Coin) -> Result<()> {
        let address = match &coin.address_pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                Error::InvalidInput(format!("Invalid address pattern for {}: {}", coin.symbol, e))
            })?),
            None => None,
        };
        let symbol = coin.symbol.to_lowercase();
        self.coins
            .insert(symbol, Arc::new(CatalogCoin { coin, address }));
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<CatalogCoin>> {
        self.coins.get(&symbol.to_lowercase()).map(|c| c.clone())
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.coins.iter().map(|c| c.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// BTC, ETH and USDT with the usual address formats
    pub fn with_defaults() -> Self {
        let catalog = Self::new();
        for coin in default_coins() {
            // Patterns below are constant and compile
            let _ = catalog.insert(coin);
        }
        catalog
    }
}

fn fees(custody: common::decimal::Decimal, fiat: common::decimal::Decimal) -> Vec<WithdrawFee> {
    vec![
        WithdrawFee {
            system: ExternalSystem::InternalCustody,
            fee: custody,
        },
        WithdrawFee {
            system: ExternalSystem::ProviderA,
            fee: fiat,
        },
        WithdrawFee {
            system: ExternalSystem::ProviderB,
            fee: fiat,
        },
    ]
}

fn default_coins() -> Vec<Coin> {
    vec![
        Coin {
            symbol: "btc".to_string(),
            chain: "bitcoin".to_string(),
            token_precision: 8,
            min_withdraw: dec!(0.001),
            address_pattern: Some(
                r"^(bc1[a-z0-9]{25,62}|[13][a-km-zA-HJ-NP-Z1-9]{25,34})$".to_string(),
            ),
            withdraw_fees: fees(dec!(0.0005), dec!(0.001)),
        },
        Coin {
            symbol: "eth".to_string(),
            chain: "ethereum".to_string(),
            token_precision: 8,
            min_withdraw: dec!(0.01),
            address_pattern: Some(r"^0x[0-9a-fA-F]{40}$".to_string()),
            withdraw_fees: fees(dec!(0.005), dec!(0.01)),
        },
        Coin {
            symbol: "usdt".to_string(),
            chain: "ethereum".to_string(),
            token_precision: 6,
            min_withdraw: dec!(10),
            address_pattern: Some(r"^0x[0-9a-fA-F]{40}$".to_string()),
            withdraw_fees: fees(dec!(5), dec!(2)),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btc_addresses() {
        let catalog = CoinCatalog::with_defaults();
        let btc = catalog.get("BTC").unwrap();
        assert!(btc.address_valid("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"));
        assert!(btc.address_valid("1BoatSLRHtKNngkdXEeobR76b53LETtpyT"));
        assert!(!btc.address_valid("0x52908400098527886E0F7030069857D2E4169EE7"));
        assert!(!btc.address_valid(""));
        assert_eq!(btc.coin.fee_for(ExternalSystem::InternalCustody), Some(dec!(0.0005)));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let catalog = CoinCatalog::new();
        let mut coin = default_coins().remove(0);
        coin.address_pattern = Some("([".to_string());
        assert!(catalog.insert(coin).is_err());
        assert!(catalog.get("btc").is_none());
    }
}
