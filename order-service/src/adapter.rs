//! Order adapter
//!
//! Validates client orders, applies replace semantics, and turns engine
//! answers into per-item results for the bulk endpoints.

use std::sync::Arc;

use account_service::SubAccountService;
use common::cache::DirtyBalances;
use common::decimal::{parse_strict, Decimal, Price};
use common::error::{Error, Result};
use common::features::{flags, FeatureFlags, FlagContext};
use common::model::market::Market;
use common::model::order::{
    Order, OrderType, Side, Status, StopKind, TrailingKind, TrailingStop, UiSource,
};
use common::model::{OrderId, Principal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{CancelStatus, NewOrder, OrderEngine};
use crate::index::{OpenOrderIndex, OrderPage, OrderQuery};
use crate::markets::MarketCatalog;

fn default_order_type() -> OrderType {
    OrderType::Limit
}

/// Trailing stop as sent by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopInput {
    pub activation_price: String,
    pub price: String,
    pub kind: TrailingKind,
}

/// A client order
///
/// `market` and `side` come from the path on the single-order endpoint and
/// from the body on the bulk one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(rename = "type", default = "default_order_type")]
    pub order_type: OrderType,
    pub amount: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub stop: StopKind,
    #[serde(default)]
    pub stop_price: Option<String>,
    #[serde(default)]
    pub take_profit_price: Option<String>,
    #[serde(default)]
    pub stop_loss_price: Option<String>,
    #[serde(default)]
    pub trailing_stop: Option<TrailingStopInput>,
    #[serde(default)]
    pub parent_order_id: Option<OrderId>,
    /// Account-group selector
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub ui: Option<String>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    /// Order to replace
    #[serde(default)]
    pub order_id: Option<OrderId>,
}

/// Result of a cancel
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
    /// HTTP status the caller reports
    pub code: u16,
    pub error: Option<String>,
    pub order: Order,
}

/// One item of a bulk cancel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelItem {
    pub market: String,
    pub order_id: OrderId,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

/// Per-index result of a bulk create
#[derive(Debug, Clone, Serialize)]
pub struct BulkCreateResult {
    pub index: usize,
    pub client_order_id: Option<String>,
    pub order: Option<Order>,
    pub error: Option<String>,
}

/// Per-index result of a bulk cancel
#[derive(Debug, Clone, Serialize)]
pub struct BulkCancelResult {
    pub index: usize,
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub cancelled: bool,
    pub code: u16,
    pub error: Option<String>,
}

fn not_found() -> Error {
    Error::NotFound("Order not found".to_string())
}

fn already_cancelled() -> Error {
    Error::Conflict("Original order is already cancelled, unable to replace".to_string())
}

fn already_filled() -> Error {
    Error::Conflict("Original order is already filled, unable to replace".to_string())
}

fn partially_filled() -> Error {
    Error::Conflict("Original order is partially filled, unable to replace".to_string())
}

fn cancel_failed() -> Error {
    Error::Conflict("Unable to cancel the original order".to_string())
}

/// Message a bulk item carries for a failure
fn item_error(e: &Error) -> String {
    if e.is_client_visible() {
        e.to_string()
    } else {
        "Internal error".to_string()
    }
}

/// Parse a client decimal that must fit `precision` decimal places
fn parse_scaled(field: &str, value: &str, precision: u32) -> Result<Decimal> {
    let parsed = parse_strict(value)?;
    if parsed.normalize().scale() > precision {
        return Err(Error::InvalidInput(format!(
            "{} accepts at most {} decimal places",
            field, precision
        )));
    }
    Ok(parsed)
}

fn parse_positive(field: &str, value: &str, precision: u32) -> Result<Decimal> {
    let parsed = parse_scaled(field, value, precision)?;
    if parsed <= Decimal::ZERO {
        return Err(Error::InvalidInput(format!("{} must be positive", field)));
    }
    Ok(parsed)
}

/// Order entry over the matching engine
pub struct OrderAdapter {
    engine: Arc<dyn OrderEngine>,
    markets: Arc<MarketCatalog>,
    subs: Arc<SubAccountService>,
    flags: Arc<dyn FeatureFlags>,
    index: Arc<OpenOrderIndex>,
    dirty: Arc<DirtyBalances>,
}

impl OrderAdapter {
    pub fn new(
        engine: Arc<dyn OrderEngine>,
        markets: Arc<MarketCatalog>,
        subs: Arc<SubAccountService>,
        flags: Arc<dyn FeatureFlags>,
        index: Arc<OpenOrderIndex>,
        dirty: Arc<DirtyBalances>,
    ) -> Self {
        Self {
            engine,
            markets,
            subs,
            flags,
            index,
            dirty,
        }
    }

    pub fn markets(&self) -> &Arc<MarketCatalog> {
        &self.markets
    }

    fn check_enabled(&self, principal: &Principal, market: &Market, order_type: OrderType, side: Side) -> Result<()> {
        let ctx = FlagContext {
            user_id: Some(principal.user_id),
            market: Some(market.id.clone()),
            order_type: Some(order_type),
            side: Some(side),
        };
        if !self.flags.is_enabled(&flags::order_type(order_type), &ctx)
            || !self
                .flags
                .is_enabled(&flags::market_order_type(&market.id, order_type, side), &ctx)
        {
            return Err(Error::InvalidInput(format!(
                "{} {} orders are disabled on {}",
                order_type,
                side.as_str(),
                market.id
            )));
        }
        Ok(())
    }

    fn ui_source(principal: &Principal, ui: Option<&str>) -> Result<UiSource> {
        if principal.is_api_key() {
            return Ok(UiSource::Api);
        }
        match ui {
            Some(ui) if !ui.is_empty() => ui.parse(),
            _ => Ok(UiSource::default()),
        }
    }

    /// Validate a request into an engine order
    async fn prepare(&self, principal: &Principal, market_id: &str, side: Side, req: &CreateOrderRequest) -> Result<NewOrder> {
        let market = self.markets.active(market_id)?;
        self.check_enabled(principal, &market, req.order_type, side)?;

        let amount = parse_positive("amount", &req.amount, market.amount_precision)?;
        if amount < market.min_amount {
            return Err(Error::InvalidInput(format!(
                "Minimum amount is {} {}",
                market.min_amount, market.base_coin
            )));
        }

        let price_field = |name: &str, value: &Option<String>| -> Result<Option<Price>> {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(|v| {
                    let parsed = parse_scaled(name, v, market.price_precision)?;
                    if parsed.is_sign_negative() {
                        return Err(Error::InvalidInput(format!("{} must not be negative", name)));
                    }
                    Ok(parsed)
                })
                .transpose()
        };

        let price = price_field("price", &req.price)?.unwrap_or(Price::ZERO);
        let stop_price = price_field("stop_price", &req.stop_price)?.unwrap_or(Price::ZERO);
        let take_profit_price = price_field("take_profit_price", &req.take_profit_price)?;
        let stop_loss_price = price_field("stop_loss_price", &req.stop_loss_price)?;

        let stop = if req.order_type == OrderType::Stop && req.stop == StopKind::None {
            StopKind::Loss
        } else {
            req.stop
        };

        match req.order_type {
            OrderType::Market => {
                if !price.is_zero() {
                    return Err(Error::InvalidInput("Market orders take no price".to_string()));
                }
            }
            OrderType::Limit | OrderType::Oco | OrderType::Oto => {
                if price <= Price::ZERO {
                    return Err(Error::InvalidInput("price must be positive".to_string()));
                }
            }
            OrderType::Stop => {}
        }
        if stop != StopKind::None && stop_price.is_zero() {
            return Err(Error::InvalidInput("stop_price is required for stop orders".to_string()));
        }
        if req.order_type.is_composite() && take_profit_price.is_none() && stop_loss_price.is_none() {
            return Err(Error::InvalidInput(format!(
                "{} orders need a take-profit or stop-loss price",
                req.order_type
            )));
        }

        let trailing_stop = req
            .trailing_stop
            .as_ref()
            .map(|t| -> Result<TrailingStop> {
                Ok(TrailingStop {
                    activation_price: parse_positive(
                        "trailing_stop.activation_price",
                        &t.activation_price,
                        market.price_precision,
                    )?,
                    price: parse_positive("trailing_stop.price", &t.price, market.price_precision)?,
                    kind: t.kind,
                })
            })
            .transpose()?;

        let ui = Self::ui_source(principal, req.ui.as_deref())?;
        let sub = self
            .subs
            .resolve(principal.user_id, req.account.as_deref())
            .await?;

        Ok(NewOrder {
            owner_id: principal.user_id,
            sub_account_id: sub.id,
            market_id: market.id,
            order_type: req.order_type,
            side,
            amount,
            price,
            stop,
            stop_price,
            take_profit_price,
            stop_loss_price,
            trailing_stop,
            parent_order_id: req.parent_order_id,
            ui,
            client_order_id: req.client_order_id.clone(),
        })
    }

    /// An order owned by the principal
    async fn owned(&self, principal: &Principal, order_id: OrderId) -> Result<Order> {
        match self.engine.get(order_id).await? {
            Some(order) if order.owner_id == principal.user_id => Ok(order),
            _ => Err(not_found()),
        }
    }

    /// Place an order, replacing `order_id` when given
    pub async fn create(
        &self,
        principal: &Principal,
        market_id: &str,
        side: Side,
        req: &CreateOrderRequest,
    ) -> Result<Order> {
        let new = self.prepare(principal, market_id, side, req).await?;

        let order = match req.order_id {
            Some(previous_id) => self.replace(principal, previous_id, new).await?,
            None => self.engine.submit(new).await?,
        };

        self.index.upsert(&order);
        self.dirty.mark((principal.user_id, order.sub_account_id));
        info!(
            user_id = principal.user_id,
            order_id = order.id,
            market = %order.market_id,
            "{} {} order placed",
            order.order_type,
            order.side.as_str()
        );
        Ok(order)
    }

    async fn replace(&self, principal: &Principal, previous_id: OrderId, new: NewOrder) -> Result<Order> {
        let previous = self.owned(principal, previous_id).await?;

        if previous.order_type.is_composite() {
            return self.engine.replace_composite(previous_id, new).await;
        }

        match previous.status {
            Status::Cancelled => return Err(already_cancelled()),
            Status::Filled => return Err(already_filled()),
            _ if !previous.is_zero_filled() => return Err(partially_filled()),
            _ => {}
        }

        let (status, cancelled) = self.engine.cancel(previous_id).await.map_err(|e| {
            warn!(order_id = previous_id, "cancel before replace failed: {}", e);
            cancel_failed()
        })?;
        self.index.upsert(&cancelled);
        match status {
            CancelStatus::CancelledNow => {}
            CancelStatus::AlreadyFilled => return Err(already_filled()),
            CancelStatus::AlreadyCancelled => return Err(already_cancelled()),
        }
        // A fill may have landed between the check and the cancel
        if !cancelled.is_zero_filled() {
            return Err(partially_filled());
        }

        debug!(order_id = previous_id, "replacing order");
        self.engine.submit(new).await
    }

    /// Cancel one order of the principal in `market_id`
    pub async fn cancel(&self, principal: &Principal, market_id: &str, order_id: OrderId) -> Result<CancelOutcome> {
        let order = self.owned(principal, order_id).await?;
        if !order.market_id.eq_ignore_ascii_case(market_id) {
            return Err(not_found());
        }

        let (status, order) = self.engine.cancel(order_id).await?;
        self.index.upsert(&order);
        self.dirty.mark((principal.user_id, order.sub_account_id));

        let ctx = FlagContext::user(principal.user_id);
        let outcome = match status {
            CancelStatus::CancelledNow => CancelOutcome {
                cancelled: true,
                code: 200,
                error: None,
                order,
            },
            CancelStatus::AlreadyFilled => {
                let report = self.flags.is_enabled(flags::CANCEL_FILLED_AS_202, &ctx);
                CancelOutcome {
                    cancelled: false,
                    code: if report { 202 } else { 200 },
                    error: report.then(|| "Order is already filled".to_string()),
                    order,
                }
            }
            CancelStatus::AlreadyCancelled => {
                let report = self.flags.is_enabled(flags::CANCEL_CANCELLED_AS_208, &ctx);
                CancelOutcome {
                    cancelled: false,
                    code: if report { 208 } else { 200 },
                    error: report.then(|| "Order is already cancelled".to_string()),
                    order,
                }
            }
        };
        debug!(order_id, code = outcome.code, "cancel handled");
        Ok(outcome)
    }

    /// Create every item; one failure does not stop the others
    pub async fn create_bulk(&self, principal: &Principal, items: &[CreateOrderRequest]) -> Vec<BulkCreateResult> {
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let placed = match (item.market.as_deref(), item.side) {
                (Some(market), Some(side)) => self.create(principal, market, side, item).await,
                _ => Err(Error::InvalidInput("market and side are required".to_string())),
            };
            let (order, error) = match placed {
                Ok(order) => (Some(order), None),
                Err(e) => (None, Some(item_error(&e))),
            };
            results.push(BulkCreateResult {
                index,
                client_order_id: item.client_order_id.clone(),
                order,
                error,
            });
        }
        results
    }

    /// Cancel every item; one failure does not stop the others
    pub async fn cancel_bulk(&self, principal: &Principal, items: &[CancelItem]) -> Vec<BulkCancelResult> {
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let result = match self.cancel(principal, &item.market, item.order_id).await {
                Ok(outcome) => BulkCancelResult {
                    index,
                    order_id: item.order_id,
                    client_order_id: item.client_order_id.clone(),
                    cancelled: outcome.cancelled,
                    code: outcome.code,
                    error: outcome.error,
                },
                Err(e) => BulkCancelResult {
                    index,
                    order_id: item.order_id,
                    client_order_id: item.client_order_id.clone(),
                    cancelled: false,
                    code: match e.kind() {
                        common::ErrorKind::NotFound => 404,
                        _ => 400,
                    },
                    error: Some(item_error(&e)),
                },
            };
            results.push(result);
        }
        results
    }

    /// Open orders of the principal
    pub fn list(&self, principal: &Principal, query: &OrderQuery) -> OrderPage {
        self.index.query(principal.user_id, query)
    }

    pub async fn get(&self, principal: &Principal, order_id: OrderId) -> Result<Order> {
        self.owned(principal, order_id).await
    }
}
