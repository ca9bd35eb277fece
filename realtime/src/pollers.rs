//! Public market publishers
//!
//! Each poller pulls from a collaborator and publishes on its public
//! channels. When a collaborator fails the tick is skipped and nothing stale
//! goes out.

use std::sync::Arc;

use account_service::RateSource;
use async_trait::async_trait;
use common::error::Result;
use dashmap::DashMap;
use order_service::OrderEngine;
use serde_json::json;
use tracing::warn;

use crate::channel::{Channel, ChannelKind, KindTag};
use crate::dispatch::Periodic;
use crate::hub::Hub;
use crate::stats::{MarketStats, Tick};

/// `public:market/24h_tick`, one message per market
pub struct TickerPoller {
    stats: Arc<dyn MarketStats>,
    hub: Arc<Hub>,
}

impl TickerPoller {
    pub fn new(stats: Arc<dyn MarketStats>, hub: Arc<Hub>) -> Self {
        Self { stats, hub }
    }
}

#[async_trait]
impl Periodic for TickerPoller {
    fn name(&self) -> &'static str {
        "ticker"
    }

    async fn tick(&self) -> Result<()> {
        let channel = Channel::public(ChannelKind::Ticker);
        if !self.hub.has_subscribers(&channel) {
            return Ok(());
        }
        let summaries = match self.stats.summaries().await {
            Ok(summaries) => summaries,
            Err(e) => {
                warn!("market stats unavailable, ticker skipped: {}", e);
                return Ok(());
            }
        };
        for summary in summaries {
            self.hub
                .publish(&channel, serde_json::to_value(Tick::from(summary))?);
        }
        Ok(())
    }
}

/// `public:market-depth/<market>`
pub struct DepthPoller {
    engine: Arc<dyn OrderEngine>,
    hub: Arc<Hub>,
    limit: usize,
}

impl DepthPoller {
    pub fn new(engine: Arc<dyn OrderEngine>, hub: Arc<Hub>, limit: usize) -> Self {
        Self { engine, hub, limit }
    }
}

#[async_trait]
impl Periodic for DepthPoller {
    fn name(&self) -> &'static str {
        "depth"
    }

    async fn tick(&self) -> Result<()> {
        for channel in self.hub.subscribed(KindTag::Depth) {
            let ChannelKind::Depth(market) = &channel.kind else {
                continue;
            };
            match self.engine.depth(market, self.limit).await {
                Ok(depth) => {
                    self.hub.publish(&channel, serde_json::to_value(&depth)?);
                }
                Err(e) => warn!(market = %market, "depth unavailable, skipped: {}", e),
            }
        }
        Ok(())
    }
}

/// `public:trades/<market>`, only trades newer than the last publish
pub struct TradesPoller {
    engine: Arc<dyn OrderEngine>,
    hub: Arc<Hub>,
    limit: usize,
    last_sent: DashMap<String, i64>,
}

impl TradesPoller {
    pub fn new(engine: Arc<dyn OrderEngine>, hub: Arc<Hub>, limit: usize) -> Self {
        Self {
            engine,
            hub,
            limit,
            last_sent: DashMap::new(),
        }
    }
}

#[async_trait]
impl Periodic for TradesPoller {
    fn name(&self) -> &'static str {
        "trades"
    }

    async fn tick(&self) -> Result<()> {
        for channel in self.hub.subscribed(KindTag::Trades) {
            let ChannelKind::Trades(market) = &channel.kind else {
                continue;
            };
            let trades = match self.engine.recent_trades(market, self.limit).await {
                Ok(trades) => trades,
                Err(e) => {
                    warn!(market = %market, "trades unavailable, skipped: {}", e);
                    continue;
                }
            };
            let last = self.last_sent.get(market).map(|id| *id).unwrap_or(0);
            let fresh: Vec<_> = trades.into_iter().filter(|t| t.id > last).collect();
            let Some(newest) = fresh.first().map(|t| t.id) else {
                continue;
            };
            self.hub.publish(&channel, serde_json::to_value(&fresh)?);
            self.last_sent.insert(market.clone(), newest);
        }
        Ok(())
    }
}

/// `public:coins-value`
pub struct CoinsValuePoller {
    rates: Arc<dyn RateSource>,
    hub: Arc<Hub>,
}

impl CoinsValuePoller {
    pub fn new(rates: Arc<dyn RateSource>, hub: Arc<Hub>) -> Self {
        Self { rates, hub }
    }
}

#[async_trait]
impl Periodic for CoinsValuePoller {
    fn name(&self) -> &'static str {
        "coins-value"
    }

    async fn tick(&self) -> Result<()> {
        let channel = Channel::public(ChannelKind::CoinsValue);
        if !self.hub.has_subscribers(&channel) {
            return Ok(());
        }
        match self.rates.all_rates().await {
            Ok(rates) => {
                self.hub.publish(&channel, json!({ "btc": rates }));
            }
            Err(e) => warn!("coin rates unavailable, skipped: {}", e),
        }
        Ok(())
    }
}
