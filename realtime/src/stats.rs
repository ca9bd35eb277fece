//! Market statistics port
//!
//! The 24h ticker is pulled from a [`MarketStats`] collaborator. The
//! in-memory implementation derives it from the engine's recent trades.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::decimal::{Decimal, Price, Quantity};
use common::error::Result;
use order_service::{MarketCatalog, OrderEngine};
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};

/// 24h statistics of one market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub market_id: String,
    pub last_price: Price,
    pub high: Price,
    pub low: Price,
    /// Base volume over the last 24h
    pub volume: Quantity,
    /// Quote volume over the last 24h
    pub quote_volume: Decimal,
    /// Quote volume over the 24h before that
    pub previous_quote_volume: Decimal,
}

/// A ticker message as published on `public:market/24h_tick`
#[derive(Debug, Clone, Serialize)]
pub struct Tick {
    #[serde(flatten)]
    pub summary: MarketSummary,
    /// Percent change of the quote volume against the previous 24h
    pub quote_volume_change: Option<Decimal>,
}

impl From<MarketSummary> for Tick {
    fn from(summary: MarketSummary) -> Self {
        let quote_volume_change = quote_volume_change(&summary);
        Self {
            summary,
            quote_volume_change,
        }
    }
}

/// Percent change, `None` when there was no previous volume
pub fn quote_volume_change(summary: &MarketSummary) -> Option<Decimal> {
    if summary.previous_quote_volume.is_zero() {
        return None;
    }
    let change = (summary.quote_volume - summary.previous_quote_volume)
        / summary.previous_quote_volume
        * Decimal::ONE_HUNDRED;
    Some(change.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

#[async_trait]
pub trait MarketStats: Send + Sync {
    async fn summaries(&self) -> Result<Vec<MarketSummary>>;
}

/// Statistics computed from the matching engine's trade history
pub struct EngineMarketStats {
    engine: Arc<dyn OrderEngine>,
    markets: Arc<MarketCatalog>,
    history: usize,
}

impl EngineMarketStats {
    pub fn new(engine: Arc<dyn OrderEngine>, markets: Arc<MarketCatalog>) -> Self {
        Self {
            engine,
            markets,
            history: 500,
        }
    }
}

#[async_trait]
impl MarketStats for EngineMarketStats {
    async fn summaries(&self) -> Result<Vec<MarketSummary>> {
        let now = Utc::now();
        let day_ago = now - Duration::hours(24);
        let two_days_ago = now - Duration::hours(48);

        let mut summaries = Vec::new();
        for market in self.markets.list().into_iter().filter(|m| m.active) {
            let trades = self.engine.recent_trades(&market.id, self.history).await?;
            let mut summary = MarketSummary {
                market_id: market.id.clone(),
                last_price: trades.first().map_or(Price::ZERO, |t| t.price),
                high: Price::ZERO,
                low: Price::ZERO,
                volume: Quantity::ZERO,
                quote_volume: Decimal::ZERO,
                previous_quote_volume: Decimal::ZERO,
            };
            for trade in &trades {
                if trade.created_at >= day_ago {
                    summary.high = summary.high.max(trade.price);
                    if summary.low.is_zero() || trade.price < summary.low {
                        summary.low = trade.price;
                    }
                    summary.volume += trade.amount;
                    summary.quote_volume += trade.amount * trade.price;
                } else if trade.created_at >= two_days_ago {
                    summary.previous_quote_volume += trade.amount * trade.price;
                }
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn summary(quote: Decimal, previous: Decimal) -> MarketSummary {
        MarketSummary {
            market_id: "btcusdt".to_string(),
            last_price: dec!(1),
            high: dec!(1),
            low: dec!(1),
            volume: dec!(1),
            quote_volume: quote,
            previous_quote_volume: previous,
        }
    }

    #[test]
    fn change_is_relative_to_the_previous_day() {
        assert_eq!(quote_volume_change(&summary(dec!(150), dec!(100))), Some(dec!(50)));
        assert_eq!(quote_volume_change(&summary(dec!(50), dec!(150))), Some(dec!(-66.67)));
        assert_eq!(quote_volume_change(&summary(dec!(50), dec!(0))), None);
    }
}
