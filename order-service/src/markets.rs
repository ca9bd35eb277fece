//! Market catalog

use common::decimal::{dec, Quantity};
use common::error::{Error, Result};
use common::model::market::Market;
use dashmap::DashMap;

/// Markets keyed by lowercase ID
#[derive(Default)]
pub struct MarketCatalog {
    markets: DashMap<String, Market>,
}

impl MarketCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, market: Market) {
        self.markets.insert(market.id.to_lowercase(), market);
    }

    pub fn get(&self, id: &str) -> Option<Market> {
        self.markets.get(&id.to_lowercase()).map(|m| m.clone())
    }

    /// A market that accepts orders
    pub fn active(&self, id: &str) -> Result<Market> {
        match self.get(id) {
            Some(market) if market.active => Ok(market),
            Some(_) => Err(Error::InvalidInput(format!("Market {} is not active", id))),
            None => Err(Error::NotFound(format!("Market not found: {}", id))),
        }
    }

    /// Sorted by ID
    pub fn list(&self) -> Vec<Market> {
        let mut markets: Vec<Market> = self.markets.iter().map(|m| m.clone()).collect();
        markets.sort_by(|a, b| a.id.cmp(&b.id));
        markets
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut market = self
            .markets
            .get_mut(&id.to_lowercase())
            .ok_or_else(|| Error::NotFound(format!("Market not found: {}", id)))?;
        market.active = active;
        Ok(())
    }

    /// btcusdt, ethusdt and ethbtc; ltcusdt is listed but halted
    pub fn with_defaults() -> Self {
        let catalog = Self::new();
        let market = |id: &str, base: &str, quote: &str, price_dp: u32, amount_dp: u32, min: Quantity, active: bool| Market {
            id: id.to_string(),
            base_coin: base.to_string(),
            quote_coin: quote.to_string(),
            price_precision: price_dp,
            amount_precision: amount_dp,
            min_amount: min,
            active,
        };
        catalog.insert(market("btcusdt", "btc", "usdt", 2, 6, dec!(0.0001), true));
        catalog.insert(market("ethusdt", "eth", "usdt", 2, 5, dec!(0.001), true));
        catalog.insert(market("ethbtc", "eth", "btc", 6, 4, dec!(0.001), true));
        catalog.insert(market("ltcusdt", "ltc", "usdt", 2, 4, dec!(0.01), false));
        catalog
    }
}
