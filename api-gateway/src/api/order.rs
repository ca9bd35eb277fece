//! Order API handlers

use std::sync::Arc;

use auth_service::perms;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use chrono::{DateTime, Utc};
use common::model::api_key::Capability;
use common::model::order::{Order, Side};
use common::model::{OrderId, Principal};
use order_service::{BulkCancelResult, BulkCreateResult, CancelItem, CreateOrderRequest, OrderQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::IntoParams;

use crate::api::response::{ApiListResponse, ApiResponse, Paging};
use crate::error::ApiError;
use crate::extract::Body;
use crate::state::AppState;

fn trading_gate(state: &AppState, principal: &Principal) -> Result<(), ApiError> {
    state.require(principal, perms::ORDERS_WRITE)?;
    principal.require_write()?;
    principal.require_capability(Capability::Trading)?;
    Ok(())
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListOrdersQuery {
    pub market: Option<String>,
    /// Sub-account selector
    pub account: Option<String>,
    /// Only orders created at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
    error: Option<String>,
    order: Order,
}

/// Place an order; `order_id` in the body replaces an open order
#[utoipa::path(
    post,
    path = "/orders/{market}/{side}",
    params(
        ("market" = String, Path, description = "Market id, e.g. btcusdt"),
        ("side" = String, Path, description = "buy or sell")
    ),
    responses(
        (status = 201, description = "Order accepted", body = Order),
        (status = 400, description = "Invalid order or insufficient balance"),
        (status = 403, description = "Trading not allowed for this key")
    ),
    security(("bearer" = [])),
    tag = "order"
)]
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((market, side)): Path<(String, String)>,
    Body(request): Body<CreateOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    trading_gate(&state, &principal)?;
    let side: Side = side.parse()?;
    let order = state
        .orders
        .adapter
        .create(&principal, &market, side, &request)
        .await?;
    Ok(ApiResponse::created(order))
}

/// Place several orders; every item reports its own result
#[utoipa::path(
    post,
    path = "/orders/bulk",
    responses((status = 200, description = "Per-item results in request order")),
    security(("bearer" = [])),
    tag = "order"
)]
pub async fn create_bulk(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(items): Body<Vec<CreateOrderRequest>>,
) -> Result<ApiListResponse<BulkCreateResult>, ApiError> {
    trading_gate(&state, &principal)?;
    let results = state.orders.adapter.create_bulk(&principal, &items).await;
    Ok(ApiListResponse::all(results, json!({})))
}

/// Cancel an order
///
/// An order that was already filled or cancelled answers 202 or 208 when
/// the matching flag is on, 200 otherwise.
#[utoipa::path(
    delete,
    path = "/orders/{market}/{id}",
    params(
        ("market" = String, Path, description = "Market id"),
        ("id" = i64, Path, description = "Order id")
    ),
    responses(
        (status = 200, description = "Cancelled"),
        (status = 202, description = "Already filled"),
        (status = 208, description = "Already cancelled"),
        (status = 404, description = "Order not found")
    ),
    security(("bearer" = [])),
    tag = "order"
)]
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((market, id)): Path<(String, OrderId)>,
) -> Result<Response, ApiError> {
    trading_gate(&state, &principal)?;
    let outcome = state.orders.adapter.cancel(&principal, &market, id).await?;
    let status = StatusCode::from_u16(outcome.code).unwrap_or(StatusCode::OK);
    let body = ApiResponse::new(CancelResponse {
        cancelled: outcome.cancelled,
        error: outcome.error,
        order: outcome.order,
    });
    Ok((status, body).into_response())
}

/// Cancel several orders
#[utoipa::path(
    delete,
    path = "/orders/bulk",
    responses((status = 200, description = "Per-item results in request order")),
    security(("bearer" = [])),
    tag = "order"
)]
pub async fn cancel_bulk(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(items): Body<Vec<CancelItem>>,
) -> Result<ApiListResponse<BulkCancelResult>, ApiError> {
    trading_gate(&state, &principal)?;
    let results = state.orders.adapter.cancel_bulk(&principal, &items).await;
    Ok(ApiListResponse::all(results, json!({})))
}

/// Open orders of the caller
#[utoipa::path(
    get,
    path = "/orders",
    params(ListOrdersQuery),
    responses((status = 200, description = "One page of open orders")),
    security(("bearer" = [])),
    tag = "order"
)]
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<ApiListResponse<Order>, ApiError> {
    state.require(&principal, perms::ORDERS_READ)?;

    let sub_account_id = match query.account.as_deref() {
        Some(selector) => Some(
            state
                .accounts
                .sub_accounts
                .resolve(principal.user_id, Some(selector))
                .await?
                .id,
        ),
        None => None,
    };
    let paging = Paging {
        page: query.page.unwrap_or(1),
        limit: query.limit.unwrap_or(50),
    }
    .clamped();

    let page = state.orders.adapter.list(
        &principal,
        &OrderQuery {
            market_id: query.market.clone(),
            sub_account_id,
            since: query.since,
            page: paging.page,
            limit: paging.limit,
        },
    );
    Ok(ApiListResponse::page(
        page.orders,
        page.page,
        page.limit,
        page.total,
        json!({
            "market": query.market,
            "account": query.account,
            "since": query.since,
        }),
    ))
}

/// One order of the caller
#[utoipa::path(
    get,
    path = "/orders/{id}",
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order", body = Order),
        (status = 404, description = "Order not found")
    ),
    security(("bearer" = [])),
    tag = "order"
)]
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<OrderId>,
) -> Result<ApiResponse<Order>, ApiError> {
    state.require(&principal, perms::ORDERS_READ)?;
    let order = state.orders.adapter.get(&principal, id).await?;
    Ok(ApiResponse::new(order))
}
