//! Order holds against the in-memory funds engine
//!
//! An order locks what it may spend when it is placed (or activated, for
//! composite children), each fill moves the spent part to the counter coin
//! and whatever is left returns to `available` once the order is closed.
//! Buys hold quote, sells hold base.

use std::sync::Arc;

use account_service::InMemoryFundsEngine;
use common::decimal::{Decimal, Price, Quantity};
use common::error::{Error, Result};
use common::model::order::{Order, Side};
use common::model::{OrderId, SubAccountId};
use dashmap::DashMap;
use tracing::{debug, error};

use crate::markets::MarketCatalog;

struct Hold {
    sub_account_id: SubAccountId,
    coin: String,
    remaining: Decimal,
}

/// Funds locked by open orders
pub struct OrderFunds {
    funds: Arc<InMemoryFundsEngine>,
    markets: Arc<MarketCatalog>,
    holds: DashMap<OrderId, Hold>,
}

impl OrderFunds {
    pub fn new(funds: Arc<InMemoryFundsEngine>, markets: Arc<MarketCatalog>) -> Self {
        Self {
            funds,
            markets,
            holds: DashMap::new(),
        }
    }

    /// (base, quote) of a market
    fn coins(&self, market_id: &str) -> Result<(String, String)> {
        let market = self
            .markets
            .get(market_id)
            .ok_or_else(|| Error::NotFound(format!("Market not found: {}", market_id)))?;
        Ok((market.base_coin, market.quote_coin))
    }

    /// Lock what `order` may spend; `quote_cost` is only read for buys
    pub fn hold(&self, order: &Order, quote_cost: Decimal) -> Result<()> {
        let (base, quote) = self.coins(&order.market_id)?;
        let (coin, amount) = match order.side {
            Side::Buy => (quote, quote_cost),
            Side::Sell => (base, order.amount),
        };
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        self.funds.lock_order(order.sub_account_id, &coin, amount)?;
        debug!(order_id = order.id, %amount, coin = %coin, "order funds locked");
        self.holds.insert(
            order.id,
            Hold {
                sub_account_id: order.sub_account_id,
                coin,
                remaining: amount,
            },
        );
        Ok(())
    }

    /// Locked amount left for an order
    pub fn remaining(&self, order_id: OrderId) -> Option<Decimal> {
        self.holds.get(&order_id).map(|h| h.remaining)
    }

    /// Settle one side of a trade of `qty` at `price`
    pub fn fill(&self, order: &Order, qty: Quantity, price: Price) {
        let Some(mut hold) = self.holds.get_mut(&order.id) else {
            error!(order_id = order.id, "fill without locked funds");
            return;
        };
        let (base, quote) = match self.coins(&order.market_id) {
            Ok(coins) => coins,
            Err(e) => {
                error!(order_id = order.id, "fill not settled: {}", e);
                return;
            }
        };
        let (spent, received_coin, received) = match order.side {
            Side::Buy => (qty * price, base, qty),
            Side::Sell => (qty, quote, qty * price),
        };
        let spent = spent.min(hold.remaining);
        match self.funds.settle_order(
            hold.sub_account_id,
            &hold.coin,
            spent,
            &received_coin,
            received,
        ) {
            Ok(()) => hold.remaining -= spent,
            Err(e) => error!(order_id = order.id, "fill not settled: {}", e),
        }
    }

    /// Return the unspent part of a closed order
    pub fn release(&self, order_id: OrderId) {
        let Some((_, hold)) = self.holds.remove(&order_id) else {
            return;
        };
        if hold.remaining <= Decimal::ZERO {
            return;
        }
        if let Err(e) = self
            .funds
            .release_order(hold.sub_account_id, &hold.coin, hold.remaining)
        {
            error!(order_id, "order funds not released: {}", e);
        }
    }
}
