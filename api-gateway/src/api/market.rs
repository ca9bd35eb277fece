//! Public market data handlers

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use common::error::Error;
use common::model::market::Market;
use order_service::{Depth, Trade};
use serde::Deserialize;
use serde_json::json;
use utoipa::IntoParams;

use crate::api::response::{ApiListResponse, ApiResponse, MAX_LIMIT};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct DepthQuery {
    /// Price levels per side
    pub limit: Option<usize>,
}

fn known_market(state: &AppState, market: &str) -> Result<String, ApiError> {
    state
        .orders
        .markets
        .get(market)
        .map(|m| m.id)
        .ok_or_else(|| Error::NotFound(format!("Market {} not found", market)).into())
}

/// All markets
#[utoipa::path(
    get,
    path = "/markets",
    responses((status = 200, description = "Market list")),
    tag = "market"
)]
pub async fn list_markets(State(state): State<Arc<AppState>>) -> ApiListResponse<Market> {
    ApiListResponse::all(state.orders.adapter.markets().list(), json!({}))
}

/// Aggregated order book
#[utoipa::path(
    get,
    path = "/markets/{market}/depth",
    params(("market" = String, Path, description = "Market id"), DepthQuery),
    responses(
        (status = 200, description = "Bids and asks, best first"),
        (status = 404, description = "Market not found")
    ),
    tag = "market"
)]
pub async fn depth(
    State(state): State<Arc<AppState>>,
    Path(market): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<ApiResponse<Depth>, ApiError> {
    let market = known_market(&state, &market)?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_LIMIT);
    let depth = state.orders.engine.depth(&market, limit).await?;
    Ok(ApiResponse::new(depth))
}

/// Latest trades, newest first
#[utoipa::path(
    get,
    path = "/markets/{market}/trades",
    params(("market" = String, Path, description = "Market id"), DepthQuery),
    responses(
        (status = 200, description = "Recent trades"),
        (status = 404, description = "Market not found")
    ),
    tag = "market"
)]
pub async fn trades(
    State(state): State<Arc<AppState>>,
    Path(market): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<ApiListResponse<Trade>, ApiError> {
    let market = known_market(&state, &market)?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_LIMIT);
    let trades = state.orders.engine.recent_trades(&market, limit).await?;
    Ok(ApiListResponse::all(trades, json!({ "market": market })))
}
