//! Order models and related types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::{Price, Quantity};
use crate::error::Error;
use crate::model::{OrderId, SubAccountId, UserId};
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(Error::InvalidInput(format!("Invalid side: {}", other))),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Limit order to be executed at specified price or better
    Limit,
    /// Market order to be executed immediately at the current market price
    Market,
    /// Order that enters the book once the stop price is reached
    Stop,
    /// One-cancels-other pair, owned by the matching engine
    Oco,
    /// One-triggers-other pair, owned by the matching engine
    Oto,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
            OrderType::Stop => "stop",
            OrderType::Oco => "oco",
            OrderType::Oto => "oto",
        }
    }

    /// OCO and OTO orders are replaced inside the engine
    pub fn is_composite(&self) -> bool {
        matches!(self, OrderType::Oco | OrderType::Oto)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stop trigger kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    #[default]
    None,
    Entry,
    Loss,
}

/// How a trailing stop distance is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum TrailingKind {
    Absolute,
    Percentage,
}

/// Trailing stop parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct TrailingStop {
    /// Price at which trailing starts
    pub activation_price: Price,
    /// Trailing distance (absolute or percent)
    pub price: Price,
    pub kind: TrailingKind,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepted by the engine, not yet in the book
    Pending,
    /// Resting in the book without fills
    Untouched,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// Where an order was placed from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum UiSource {
    #[default]
    Web,
    Android,
    Ios,
    Api,
}

impl FromStr for UiSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(UiSource::Web),
            "android" => Ok(UiSource::Android),
            "ios" => Ok(UiSource::Ios),
            "api" => Ok(UiSource::Api),
            other => Err(Error::InvalidInput(format!("Invalid ui: {}", other))),
        }
    }
}

/// Order model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct Order {
    /// Engine-assigned order ID
    pub id: OrderId,
    /// Owner
    pub owner_id: UserId,
    /// Sub-account the funds come from
    pub sub_account_id: SubAccountId,
    /// Market ID (e.g. "btcusdt")
    pub market_id: String,
    pub order_type: OrderType,
    pub side: Side,
    /// Original amount in base currency
    pub amount: Quantity,
    /// Limit price, zero for market orders
    pub price: Price,
    pub stop: StopKind,
    pub stop_price: Price,
    /// Take-profit child price
    pub take_profit_price: Option<Price>,
    /// Stop-loss child price
    pub stop_loss_price: Option<Price>,
    pub trailing_stop: Option<TrailingStop>,
    /// Set on child orders of composite orders
    pub parent_order_id: Option<OrderId>,
    /// Cumulative filled amount
    pub filled_amount: Quantity,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ui: UiSource,
    pub client_order_id: Option<String>,
}

impl Order {
    /// Check if the order is fully filled
    pub fn is_filled(&self) -> bool {
        self.status == Status::Filled
    }

    /// Check if the order is still open in the engine
    pub fn is_open(&self) -> bool {
        matches!(self.status, Status::Pending | Status::Untouched | Status::PartiallyFilled)
    }

    /// No fills at all
    pub fn is_zero_filled(&self) -> bool {
        self.filled_amount.is_zero()
    }

    /// Child orders are hidden from listings
    pub fn is_child(&self) -> bool {
        self.parent_order_id.is_some()
    }
}
