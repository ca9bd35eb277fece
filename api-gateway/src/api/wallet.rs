//! Withdrawal handlers: user requests, admin operations and the custody
//! callback

use std::sync::Arc;

use account_service::{CustodyOutcome, WithdrawInput};
use auth_service::perms;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Extension;
use common::error::Error;
use common::model::api_key::Capability;
use common::model::withdraw::{ExternalSystem, WithdrawRequest, WithdrawStatus};
use common::model::Principal;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::response::{ApiListResponse, ApiResponse};
use crate::error::ApiError;
use crate::extract::{header, Body};
use crate::state::AppState;

/// Header the custody service authenticates its callbacks with
pub const CUSTODY_TOKEN_HEADER: &str = "x-custody-token";

#[derive(Debug, Deserialize, ToSchema)]
pub struct WithdrawBody {
    /// Sub-account selector; the default sub-account when absent
    #[serde(default)]
    pub account: Option<String>,
    /// Gross amount, fee included
    pub amount: String,
    pub address: String,
    #[serde(default)]
    pub external_system: ExternalSystem,
    /// Required once the user has set one
    #[serde(default)]
    pub trade_password: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusQuery {
    pub status: Option<WithdrawStatus>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CustodyReport {
    #[schema(value_type = String, example = "completed")]
    pub status: CustodyOutcome,
}

async fn notify_status(state: &AppState, request: &WithdrawRequest) {
    state
        .notify(
            request.user_id,
            "Withdrawal",
            format!(
                "Withdrawal of {} {} is {:?}",
                request.amount, request.coin_symbol, request.status
            ),
        )
        .await;
}

/// Request a withdrawal; it waits for both emailed approvals
#[utoipa::path(
    post,
    path = "/wallets/withdraw/{coin}",
    params(("coin" = String, Path, description = "Coin symbol")),
    request_body = WithdrawBody,
    responses(
        (status = 201, description = "Withdrawal pending approval", body = WithdrawRequest),
        (status = 400, description = "Invalid amount, address, limit or balance"),
        (status = 403, description = "Withdrawals not allowed for this key")
    ),
    security(("bearer" = [])),
    tag = "wallet"
)]
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(coin): Path<String>,
    Body(body): Body<WithdrawBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&principal, perms::WITHDRAW)?;
    principal.require_write()?;
    principal.require_capability(Capability::Withdrawal)?;
    state
        .auth
        .service
        .verify_trade_password(principal.user_id, body.trade_password.as_deref())
        .await?;

    let user = state.auth.identity.get(principal.user_id).await?;
    let recipient = state.auth.service.recipient(&user).await?;
    let request = state
        .accounts
        .withdrawals
        .admit(
            &recipient,
            WithdrawInput {
                account: body.account,
                coin,
                amount: body.amount,
                address: body.address,
                external_system: body.external_system,
            },
        )
        .await?;

    notify_status(&state, &request).await;
    Ok(ApiResponse::created(request))
}

/// The caller's withdrawals, oldest first
#[utoipa::path(
    get,
    path = "/wallets/withdrawals",
    responses((status = 200, description = "Withdrawals")),
    security(("bearer" = [])),
    tag = "wallet"
)]
pub async fn list_withdrawals(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<ApiListResponse<WithdrawRequest>, ApiError> {
    state.require(&principal, perms::WALLETS_READ)?;
    let requests = state
        .accounts
        .withdrawals
        .list_for_user(principal.user_id)
        .await?;
    Ok(ApiListResponse::all(requests, json!({})))
}

/// Cancel a pending withdrawal and release its lock
#[utoipa::path(
    delete,
    path = "/wallets/withdrawals/{id}",
    params(("id" = Uuid, Path, description = "Withdrawal id")),
    responses(
        (status = 200, description = "Cancelled", body = WithdrawRequest),
        (status = 400, description = "No longer pending"),
        (status = 404, description = "Withdrawal not found")
    ),
    security(("bearer" = [])),
    tag = "wallet"
)]
pub async fn cancel_withdrawal(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<WithdrawRequest>, ApiError> {
    state.require(&principal, perms::WITHDRAW)?;
    principal.require_write()?;
    let request = state
        .accounts
        .withdrawals
        .cancel(principal.user_id, id)
        .await?;
    notify_status(&state, &request).await;
    Ok(ApiResponse::new(request))
}

/// Withdrawals in a status, for operators
#[utoipa::path(
    get,
    path = "/admin/withdrawals",
    params(StatusQuery),
    responses((status = 200, description = "Withdrawals")),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn admin_list(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<StatusQuery>,
) -> Result<ApiListResponse<WithdrawRequest>, ApiError> {
    state.require(&principal, perms::ADMIN_WITHDRAWALS)?;
    let status = query.status.unwrap_or(WithdrawStatus::Approved);
    let requests = state.accounts.withdrawals.list_by_status(status).await?;
    Ok(ApiListResponse::all(requests, json!({ "status": status })))
}

/// Cancel a pending or approved withdrawal
#[utoipa::path(
    post,
    path = "/admin/withdrawals/{id}/cancel",
    params(("id" = Uuid, Path, description = "Withdrawal id")),
    responses((status = 200, description = "Cancelled", body = WithdrawRequest)),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn admin_cancel(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<WithdrawRequest>, ApiError> {
    state.require(&principal, perms::ADMIN_WITHDRAWALS)?;
    let request = state.accounts.withdrawals.admin_cancel(id).await?;
    info!(admin = principal.user_id, withdraw_id = %id, "withdrawal cancelled by operator");
    notify_status(&state, &request).await;
    Ok(ApiResponse::new(request))
}

/// Relay an approved withdrawal to custody again
#[utoipa::path(
    post,
    path = "/admin/withdrawals/{id}/reprocess",
    params(("id" = Uuid, Path, description = "Withdrawal id")),
    responses(
        (status = 200, description = "Relayed", body = WithdrawRequest),
        (status = 502, description = "Custody unavailable")
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn admin_reprocess(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<WithdrawRequest>, ApiError> {
    state.require(&principal, perms::ADMIN_WITHDRAWALS)?;
    let request = state.accounts.withdrawals.reprocess(id).await?;
    info!(admin = principal.user_id, withdraw_id = %id, "withdrawal reprocessed");
    Ok(ApiResponse::new(request))
}

/// Final status reported by custody
#[utoipa::path(
    post,
    path = "/custody/withdrawals/{id}",
    params(("id" = Uuid, Path, description = "Withdrawal id")),
    request_body = CustodyReport,
    responses(
        (status = 200, description = "Recorded", body = WithdrawRequest),
        (status = 401, description = "Invalid custody token")
    ),
    tag = "custody"
)]
pub async fn custody_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Body(report): Body<CustodyReport>,
) -> Result<ApiResponse<WithdrawRequest>, ApiError> {
    let expected = state.config.custody_callback_secret.as_deref();
    let presented = header(&headers, CUSTODY_TOKEN_HEADER);
    match (expected, presented) {
        (Some(expected), Some(presented)) if expected == presented => {}
        _ => {
            warn!(withdraw_id = %id, "custody callback refused");
            return Err(Error::invalid_token().into());
        }
    }

    let request = state
        .accounts
        .withdrawals
        .custody_report(id, report.status)
        .await?;
    notify_status(&state, &request).await;
    Ok(ApiResponse::new(request))
}
