//! Matching-engine port and the in-memory engine
//!
//! The engine owns order lifecycle: matching, stop triggers and the children
//! of composite orders. Every order change is pushed to the registered
//! [`OrderEventSink`]s after the market lock is released. Attached to an
//! in-memory funds engine it also locks, settles and releases order funds.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use account_service::InMemoryFundsEngine;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::decimal::{Price, Quantity};
use common::error::{Error, Result};
use common::model::order::{
    Order, OrderType, Side, Status, StopKind, TrailingStop, UiSource,
};
use common::model::{OrderId, SubAccountId, UserId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::markets::MarketCatalog;
use crate::order_book::OrderBook;
use crate::settlement::OrderFunds;

const TRADE_HISTORY: usize = 500;

/// An order as handed to the engine
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub owner_id: UserId,
    pub sub_account_id: SubAccountId,
    pub market_id: String,
    pub order_type: OrderType,
    pub side: Side,
    pub amount: Quantity,
    pub price: Price,
    pub stop: StopKind,
    pub stop_price: Price,
    pub take_profit_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
    pub trailing_stop: Option<TrailingStop>,
    pub parent_order_id: Option<OrderId>,
    pub ui: UiSource,
    pub client_order_id: Option<String>,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    CancelledNow,
    AlreadyFilled,
    AlreadyCancelled,
}

/// An executed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub market_id: String,
    pub price: Price,
    pub amount: Quantity,
    pub taker_side: Side,
    pub created_at: DateTime<Utc>,
}

/// Level-2 depth
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Depth {
    pub market_id: String,
    /// Best (highest) bid first
    pub bids: Vec<(Price, Quantity)>,
    /// Best (lowest) ask first
    pub asks: Vec<(Price, Quantity)>,
}

/// Receives every order change the engine makes
pub trait OrderEventSink: Send + Sync {
    fn on_order(&self, order: &Order);
}

/// Matching engine collaborator
#[async_trait]
pub trait OrderEngine: Send + Sync {
    /// Register a receiver of order changes
    fn subscribe(&self, sink: Arc<dyn OrderEventSink>);
    async fn submit(&self, order: NewOrder) -> Result<Order>;
    async fn cancel(&self, order_id: OrderId) -> Result<(CancelStatus, Order)>;
    async fn get(&self, order_id: OrderId) -> Result<Option<Order>>;
    /// Replace an OCO/OTO order with its children inside the engine
    async fn replace_composite(&self, order_id: OrderId, order: NewOrder) -> Result<Order>;
    async fn depth(&self, market_id: &str, limit: usize) -> Result<Depth>;
    /// Newest first
    async fn recent_trades(&self, market_id: &str, limit: usize) -> Result<Vec<Trade>>;
}

#[derive(Default)]
struct MarketState {
    book: OrderBook,
    trades: VecDeque<Trade>,
    /// Stop orders waiting for their trigger
    stops: Vec<OrderId>,
    /// Children of composite orders, placed once the parent fills
    dormant: HashMap<OrderId, Vec<OrderId>>,
}

/// Matching engine kept in memory
pub struct InMemoryOrderEngine {
    markets: DashMap<String, Arc<Mutex<MarketState>>>,
    orders: DashMap<OrderId, Order>,
    next_order_id: AtomicI64,
    next_trade_id: AtomicI64,
    sinks: RwLock<Vec<Arc<dyn OrderEventSink>>>,
    funds: Option<OrderFunds>,
}

impl Default for InMemoryOrderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrderEngine {
    pub fn new() -> Self {
        Self {
            markets: DashMap::new(),
            orders: DashMap::new(),
            next_order_id: AtomicI64::new(1),
            next_trade_id: AtomicI64::new(1),
            sinks: RwLock::new(Vec::new()),
            funds: None,
        }
    }

    /// Lock order funds in `funds`; orders the balance cannot cover are refused
    pub fn with_funds(mut self, funds: Arc<InMemoryFundsEngine>, markets: Arc<MarketCatalog>) -> Self {
        self.funds = Some(OrderFunds::new(funds, markets));
        self
    }

    /// Register a new market
    pub fn register_market(&self, market_id: &str) {
        info!("Registering market: {}", market_id);
        self.markets
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(MarketState::default())));
    }

    fn market(&self, market_id: &str) -> Result<Arc<Mutex<MarketState>>> {
        self.markets
            .get(market_id)
            .map(|m| m.clone())
            .ok_or_else(|| Error::NotFound(format!("Market not found: {}", market_id)))
    }

    fn publish(&self, changed: Vec<Order>) {
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
        for order in &changed {
            for sink in sinks.iter() {
                sink.on_order(order);
            }
        }
    }

    fn build_order(&self, new: NewOrder, status: Status) -> Order {
        let now = Utc::now();
        Order {
            id: self.next_order_id.fetch_add(1, Ordering::SeqCst),
            owner_id: new.owner_id,
            sub_account_id: new.sub_account_id,
            market_id: new.market_id,
            order_type: new.order_type,
            side: new.side,
            amount: new.amount,
            price: new.price,
            stop: new.stop,
            stop_price: new.stop_price,
            take_profit_price: new.take_profit_price,
            stop_loss_price: new.stop_loss_price,
            trailing_stop: new.trailing_stop,
            parent_order_id: new.parent_order_id,
            filled_amount: Quantity::ZERO,
            status,
            created_at: now,
            updated_at: now,
            ui: new.ui,
            client_order_id: new.client_order_id,
        }
    }

    /// Quote a buy may spend: its limit, else its stop price, else what the
    /// book asks for the amount right now
    fn buy_cost(state: &MarketState, order: &Order) -> Price {
        let reference = if order.price.is_zero() {
            order.stop_price
        } else {
            order.price
        };
        if reference.is_zero() {
            state.book.market_buy_cost(order.amount)
        } else {
            order.amount * reference
        }
    }

    fn hold(&self, state: &MarketState, order: &Order) -> Result<()> {
        match &self.funds {
            Some(funds) => funds.hold(order, Self::buy_cost(state, order)),
            None => Ok(()),
        }
    }

    fn release(&self, order_id: OrderId) {
        if let Some(funds) = &self.funds {
            funds.release(order_id);
        }
    }

    fn store(&self, order: &Order, changed: &mut Vec<Order>) {
        self.orders.insert(order.id, order.clone());
        changed.push(order.clone());
    }

    /// Match an order against the book and rest or close what remains
    fn execute(&self, state: &mut MarketState, mut taker: Order, changed: &mut Vec<Order>) -> Order {
        let limit = if taker.order_type == OrderType::Market || taker.price.is_zero() {
            None
        } else {
            Some(taker.price)
        };

        loop {
            let remaining = taker.amount - taker.filled_amount;
            if remaining <= Quantity::ZERO {
                break;
            }
            let Some((maker_id, price, maker_remaining)) = state.book.best_match(taker.side, limit)
            else {
                break;
            };
            let mut qty = remaining.min(maker_remaining);
            // A buy spends no more than it holds
            if let (Some(funds), Side::Buy) = (&self.funds, taker.side) {
                if let Some(left) = funds.remaining(taker.id) {
                    qty = qty.min(left / price);
                }
            }
            if qty <= Quantity::ZERO {
                break;
            }
            state.book.reduce(maker_id, qty);

            if let Some(mut maker) = self.orders.get_mut(&maker_id) {
                maker.filled_amount += qty;
                maker.status = if maker.filled_amount >= maker.amount {
                    Status::Filled
                } else {
                    Status::PartiallyFilled
                };
                maker.updated_at = Utc::now();
                if let Some(funds) = &self.funds {
                    funds.fill(&maker, qty, price);
                    if maker.status == Status::Filled {
                        funds.release(maker.id);
                    }
                }
                changed.push(maker.clone());
            }
            taker.filled_amount += qty;
            if let Some(funds) = &self.funds {
                funds.fill(&taker, qty, price);
            }

            state.trades.push_front(Trade {
                id: self.next_trade_id.fetch_add(1, Ordering::SeqCst),
                market_id: taker.market_id.clone(),
                price,
                amount: qty,
                taker_side: taker.side,
                created_at: Utc::now(),
            });
            state.trades.truncate(TRADE_HISTORY);
            state.book.last_price = Some(price);
        }

        let remaining = taker.amount - taker.filled_amount;
        taker.status = if remaining <= Quantity::ZERO {
            Status::Filled
        } else if limit.is_none() {
            // Market orders never rest
            Status::Cancelled
        } else {
            state
                .book
                .add(taker.id, taker.side, taker.price, remaining);
            if taker.filled_amount.is_zero() {
                Status::Untouched
            } else {
                Status::PartiallyFilled
            }
        };
        taker.updated_at = Utc::now();
        if matches!(taker.status, Status::Filled | Status::Cancelled) {
            self.release(taker.id);
        }
        self.store(&taker, changed);
        taker
    }

    /// Activate children of filled parents, fire stops and cancel siblings of
    /// filled children until nothing changes
    fn settle(&self, state: &mut MarketState, changed: &mut Vec<Order>) {
        let mut cursor = 0;
        loop {
            while cursor < changed.len() {
                let order = changed[cursor].clone();
                cursor += 1;
                if order.status != Status::Filled {
                    continue;
                }
                if let Some(children) = state.dormant.remove(&order.id) {
                    for child_id in children {
                        self.activate(state, child_id, changed);
                    }
                }
                if let Some(parent_id) = order.parent_order_id {
                    self.cancel_siblings(state, parent_id, order.id, changed);
                }
            }

            let Some(last) = state.book.last_price else {
                return;
            };
            let triggered: Vec<OrderId> = state
                .stops
                .iter()
                .copied()
                .filter(|id| {
                    self.orders.get(id).map_or(false, |o| match o.side {
                        Side::Buy => last >= o.stop_price,
                        Side::Sell => last <= o.stop_price,
                    })
                })
                .collect();
            if triggered.is_empty() && cursor >= changed.len() {
                return;
            }
            state.stops.retain(|id| !triggered.contains(id));
            for id in triggered {
                if let Some(order) = self.orders.get(&id).map(|o| o.clone()) {
                    debug!(order_id = id, "stop triggered at {}", last);
                    self.execute(state, order, changed);
                }
            }
        }
    }

    fn activate(&self, state: &mut MarketState, child_id: OrderId, changed: &mut Vec<Order>) {
        let Some(child) = self.orders.get(&child_id).map(|o| o.clone()) else {
            return;
        };
        if child.status != Status::Pending {
            return;
        }
        if let Err(e) = self.hold(state, &child) {
            warn!(order_id = child_id, "child order cancelled: {}", e);
            if let Some(mut order) = self.orders.get_mut(&child_id) {
                order.status = Status::Cancelled;
                order.updated_at = Utc::now();
                changed.push(order.clone());
            }
            return;
        }
        if child.stop == StopKind::None {
            self.execute(state, child, changed);
        } else {
            state.stops.push(child_id);
        }
    }

    fn cancel_siblings(
        &self,
        state: &mut MarketState,
        parent_id: OrderId,
        filled_id: OrderId,
        changed: &mut Vec<Order>,
    ) {
        let siblings: Vec<OrderId> = self
            .orders
            .iter()
            .filter(|o| o.parent_order_id == Some(parent_id) && o.id != filled_id && o.is_open())
            .map(|o| o.id)
            .collect();
        for id in siblings {
            self.close(state, id, changed);
        }
    }

    /// Cancel an open order and its open children
    fn close(&self, state: &mut MarketState, id: OrderId, changed: &mut Vec<Order>) {
        state.book.remove(id);
        state.stops.retain(|s| *s != id);
        state.dormant.remove(&id);
        if let Some(mut order) = self.orders.get_mut(&id) {
            if order.is_open() {
                order.status = Status::Cancelled;
                order.updated_at = Utc::now();
                changed.push(order.clone());
            }
        }
        self.release(id);
        let children: Vec<OrderId> = self
            .orders
            .iter()
            .filter(|o| o.parent_order_id == Some(id) && o.is_open())
            .map(|o| o.id)
            .collect();
        for child in children {
            self.close(state, child, changed);
        }
    }

    fn place(&self, state: &mut MarketState, new: NewOrder, changed: &mut Vec<Order>) -> Result<Order> {
        let is_stop = new.order_type == OrderType::Stop || new.stop != StopKind::None;

        if new.order_type.is_composite() {
            let template = new.clone();
            let parent = self.build_order(new, Status::Pending);
            self.hold(state, &parent)?;
            let mut children = Vec::new();
            let exit_side = match template.side {
                Side::Buy => Side::Sell,
                Side::Sell => Side::Buy,
            };
            if let Some(tp) = template.take_profit_price {
                let child = self.build_order(
                    NewOrder {
                        order_type: OrderType::Limit,
                        side: exit_side,
                        price: tp,
                        stop: StopKind::None,
                        stop_price: Price::ZERO,
                        take_profit_price: None,
                        stop_loss_price: None,
                        parent_order_id: Some(parent.id),
                        client_order_id: None,
                        ..template.clone()
                    },
                    Status::Pending,
                );
                children.push(child);
            }
            if let Some(sl) = template.stop_loss_price {
                let child = self.build_order(
                    NewOrder {
                        order_type: OrderType::Stop,
                        side: exit_side,
                        price: Price::ZERO,
                        stop: StopKind::Loss,
                        stop_price: sl,
                        take_profit_price: None,
                        stop_loss_price: None,
                        parent_order_id: Some(parent.id),
                        client_order_id: None,
                        ..template.clone()
                    },
                    Status::Pending,
                );
                children.push(child);
            }
            for child in &children {
                self.store(child, changed);
            }
            state
                .dormant
                .insert(parent.id, children.iter().map(|c| c.id).collect());
            let placed = self.execute(state, parent, changed);
            self.settle(state, changed);
            return Ok(self.orders.get(&placed.id).map(|o| o.clone()).unwrap_or(placed));
        }

        if is_stop {
            let order = self.build_order(new, Status::Pending);
            self.hold(state, &order)?;
            self.store(&order, changed);
            state.stops.push(order.id);
            self.settle(state, changed);
            return Ok(self.orders.get(&order.id).map(|o| o.clone()).unwrap_or(order));
        }

        let order = self.build_order(new, Status::Pending);
        self.hold(state, &order)?;
        let placed = self.execute(state, order, changed);
        self.settle(state, changed);
        Ok(self.orders.get(&placed.id).map(|o| o.clone()).unwrap_or(placed))
    }
}

#[async_trait]
impl OrderEngine for InMemoryOrderEngine {
    fn subscribe(&self, sink: Arc<dyn OrderEventSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.push(sink);
    }

    async fn submit(&self, order: NewOrder) -> Result<Order> {
        let market = self.market(&order.market_id)?;
        let mut changed = Vec::new();
        let placed = {
            let mut state = market.lock().unwrap_or_else(|e| e.into_inner());
            self.place(&mut state, order, &mut changed)
        };
        self.publish(changed);
        let placed = placed?;
        debug!(order_id = placed.id, status = ?placed.status, "order placed");
        Ok(placed)
    }

    async fn cancel(&self, order_id: OrderId) -> Result<(CancelStatus, Order)> {
        let order = self
            .orders
            .get(&order_id)
            .map(|o| o.clone())
            .ok_or_else(|| Error::NotFound("Order not found".to_string()))?;
        match order.status {
            Status::Filled => return Ok((CancelStatus::AlreadyFilled, order)),
            Status::Cancelled => return Ok((CancelStatus::AlreadyCancelled, order)),
            _ => {}
        }

        let market = self.market(&order.market_id)?;
        let mut changed = Vec::new();
        let result = {
            let mut state = market.lock().unwrap_or_else(|e| e.into_inner());
            // Re-read under the lock; a fill may have landed meanwhile
            match self.orders.get(&order_id).map(|o| o.status) {
                Some(Status::Filled) => CancelStatus::AlreadyFilled,
                Some(Status::Cancelled) => CancelStatus::AlreadyCancelled,
                _ => {
                    self.close(&mut state, order_id, &mut changed);
                    CancelStatus::CancelledNow
                }
            }
        };
        self.publish(changed);
        let order = self.orders.get(&order_id).map(|o| o.clone()).unwrap_or(order);
        Ok((result, order))
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.get(&order_id).map(|o| o.clone()))
    }

    async fn replace_composite(&self, order_id: OrderId, order: NewOrder) -> Result<Order> {
        let market = self.market(&order.market_id)?;
        let mut changed = Vec::new();
        let placed = {
            let mut state = market.lock().unwrap_or_else(|e| e.into_inner());
            let current = self
                .orders
                .get(&order_id)
                .map(|o| o.clone())
                .ok_or_else(|| Error::NotFound("Order not found".to_string()))?;
            if !current.is_open() || !current.is_zero_filled() {
                return Err(Error::Conflict(
                    "Original order is not replaceable".to_string(),
                ));
            }
            self.close(&mut state, order_id, &mut changed);
            self.place(&mut state, order, &mut changed)
        };
        self.publish(changed);
        let placed = placed?;
        info!(order_id, new_order_id = placed.id, "composite order replaced");
        Ok(placed)
    }

    async fn depth(&self, market_id: &str, limit: usize) -> Result<Depth> {
        let market = self.market(market_id)?;
        let state = market.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Depth {
            market_id: market_id.to_string(),
            bids: state.book.levels(Side::Buy, limit),
            asks: state.book.levels(Side::Sell, limit),
        })
    }

    async fn recent_trades(&self, market_id: &str, limit: usize) -> Result<Vec<Trade>> {
        let market = self.market(market_id)?;
        let state = market.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.trades.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit(owner: UserId, side: Side, price: Price, amount: Quantity) -> NewOrder {
        NewOrder {
            owner_id: owner,
            sub_account_id: owner * 10,
            market_id: "btcusdt".to_string(),
            order_type: OrderType::Limit,
            side,
            amount,
            price,
            stop: StopKind::None,
            stop_price: Price::ZERO,
            take_profit_price: None,
            stop_loss_price: None,
            trailing_stop: None,
            parent_order_id: None,
            ui: UiSource::Web,
            client_order_id: None,
        }
    }

    fn engine() -> InMemoryOrderEngine {
        let engine = InMemoryOrderEngine::new();
        engine.register_market("btcusdt");
        engine
    }

    #[tokio::test]
    async fn crossing_orders_trade() {
        let engine = engine();
        let ask = engine.submit(limit(1, Side::Sell, dec!(100), dec!(2))).await.unwrap();
        assert_eq!(ask.status, Status::Untouched);

        let bid = engine.submit(limit(2, Side::Buy, dec!(101), dec!(0.5))).await.unwrap();
        assert_eq!(bid.status, Status::Filled);

        let ask = engine.get(ask.id).await.unwrap().unwrap();
        assert_eq!(ask.status, Status::PartiallyFilled);
        assert_eq!(ask.filled_amount, dec!(0.5));

        let trades = engine.recent_trades("btcusdt", 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, dec!(100));

        let depth = engine.depth("btcusdt", 50).await.unwrap();
        assert_eq!(depth.asks, vec![(dec!(100), dec!(1.5))]);
        assert!(depth.bids.is_empty());
    }

    #[tokio::test]
    async fn cancel_reports_final_states() {
        let engine = engine();
        let ask = engine.submit(limit(1, Side::Sell, dec!(100), dec!(1))).await.unwrap();
        let (status, order) = engine.cancel(ask.id).await.unwrap();
        assert_eq!(status, CancelStatus::CancelledNow);
        assert_eq!(order.status, Status::Cancelled);
        let (status, _) = engine.cancel(ask.id).await.unwrap();
        assert_eq!(status, CancelStatus::AlreadyCancelled);

        let ask = engine.submit(limit(1, Side::Sell, dec!(100), dec!(1))).await.unwrap();
        engine.submit(limit(2, Side::Buy, dec!(100), dec!(1))).await.unwrap();
        let (status, _) = engine.cancel(ask.id).await.unwrap();
        assert_eq!(status, CancelStatus::AlreadyFilled);

        assert!(engine.cancel(9999).await.is_err());
    }

    #[tokio::test]
    async fn stop_orders_wait_for_their_trigger() {
        let engine = engine();
        let mut stop = limit(1, Side::Sell, Price::ZERO, dec!(1));
        stop.order_type = OrderType::Stop;
        stop.stop = StopKind::Loss;
        stop.stop_price = dec!(95);
        let stop = engine.submit(stop).await.unwrap();
        assert_eq!(stop.status, Status::Pending);

        engine.submit(limit(2, Side::Buy, dec!(94), dec!(2))).await.unwrap();
        // Trade at 94 crosses the stop
        engine.submit(limit(3, Side::Sell, dec!(94), dec!(0.1))).await.unwrap();

        let stop = engine.get(stop.id).await.unwrap().unwrap();
        assert_eq!(stop.status, Status::Filled);
    }

    #[tokio::test]
    async fn composite_children_follow_the_parent() {
        let engine = engine();
        let mut oto = limit(1, Side::Buy, dec!(100), dec!(1));
        oto.order_type = OrderType::Oto;
        oto.take_profit_price = Some(dec!(120));
        oto.stop_loss_price = Some(dec!(90));
        let parent = engine.submit(oto).await.unwrap();

        let children: Vec<Order> = engine
            .orders
            .iter()
            .filter(|o| o.parent_order_id == Some(parent.id))
            .map(|o| o.clone())
            .collect();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.status == Status::Pending));

        // Parent fills, the take-profit rests in the book
        engine.submit(limit(2, Side::Sell, dec!(100), dec!(1))).await.unwrap();
        let depth = engine.depth("btcusdt", 50).await.unwrap();
        assert_eq!(depth.asks, vec![(dec!(120), dec!(1))]);

        // Take-profit fills, the stop-loss is cancelled
        engine.submit(limit(3, Side::Buy, dec!(120), dec!(1))).await.unwrap();
        for child in children {
            let child = engine.get(child.id).await.unwrap().unwrap();
            if child.stop == StopKind::Loss {
                assert_eq!(child.status, Status::Cancelled);
            } else {
                assert_eq!(child.status, Status::Filled);
            }
        }
    }

    async fn funded_engine() -> (InMemoryOrderEngine, Arc<InMemoryFundsEngine>) {
        use account_service::FundsEngine;
        let funds = Arc::new(InMemoryFundsEngine::new());
        funds.deposit(10, "btc", dec!(1)).await.unwrap();
        funds.deposit(20, "usdt", dec!(1000)).await.unwrap();
        let engine = InMemoryOrderEngine::new()
            .with_funds(funds.clone(), Arc::new(MarketCatalog::with_defaults()));
        engine.register_market("btcusdt");
        (engine, funds)
    }

    async fn entry(funds: &InMemoryFundsEngine, sub: SubAccountId, coin: &str) -> (Quantity, Quantity) {
        use account_service::FundsEngine;
        let e = funds.balance(sub, coin).await.unwrap();
        (e.available, e.in_orders)
    }

    #[tokio::test]
    async fn orders_hold_and_settle_funds() {
        let (engine, funds) = funded_engine().await;
        let ask = engine.submit(limit(1, Side::Sell, dec!(100), dec!(1))).await.unwrap();
        assert_eq!(entry(&funds, 10, "btc").await, (dec!(0), dec!(1)));

        // Bid at 110 trades at the resting 100; the 5 saved goes back
        engine.submit(limit(2, Side::Buy, dec!(110), dec!(0.5))).await.unwrap();
        assert_eq!(entry(&funds, 20, "usdt").await, (dec!(950), dec!(0)));
        assert_eq!(entry(&funds, 20, "btc").await, (dec!(0.5), dec!(0)));
        assert_eq!(entry(&funds, 10, "btc").await, (dec!(0), dec!(0.5)));
        assert_eq!(entry(&funds, 10, "usdt").await, (dec!(50), dec!(0)));

        engine.cancel(ask.id).await.unwrap();
        assert_eq!(entry(&funds, 10, "btc").await, (dec!(0.5), dec!(0)));
    }

    #[tokio::test]
    async fn uncovered_orders_are_refused() {
        let (engine, funds) = funded_engine().await;
        let err = engine
            .submit(limit(2, Side::Buy, dec!(30000), dec!(1)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Insufficient balance");
        assert!(engine.submit(limit(3, Side::Sell, dec!(100), dec!(1))).await.is_err());
        assert_eq!(entry(&funds, 20, "usdt").await, (dec!(1000), dec!(0)));
        assert!(engine.orders.is_empty());
    }

    #[tokio::test]
    async fn market_buys_hold_what_the_book_asks() {
        let (engine, funds) = funded_engine().await;
        engine.submit(limit(1, Side::Sell, dec!(100), dec!(0.5))).await.unwrap();
        engine.submit(limit(1, Side::Sell, dec!(200), dec!(0.5))).await.unwrap();

        let mut buy = limit(2, Side::Buy, Price::ZERO, dec!(2));
        buy.order_type = OrderType::Market;
        let buy = engine.submit(buy).await.unwrap();
        // Half at 100, half at 200, the rest had no counterpart
        assert_eq!(buy.filled_amount, dec!(1));
        assert_eq!(buy.status, Status::Cancelled);
        assert_eq!(entry(&funds, 20, "usdt").await, (dec!(850), dec!(0)));
        assert_eq!(entry(&funds, 20, "btc").await, (dec!(1), dec!(0)));
    }
}
