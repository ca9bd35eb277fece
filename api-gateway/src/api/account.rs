//! Sub-account and balance handlers
//!
//! Handles endpoints related to a user's funds partitions:
//! - List, create and edit sub-accounts
//! - Internal transfers between sub-accounts
//! - Balances of one or all sub-accounts

use std::sync::Arc;

use account_service::sub_accounts::SubAccountUpdate;
use auth_service::perms;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Extension;
use common::model::balance::Balances;
use common::model::sub_account::SubAccount;
use common::model::{Principal, SubAccountId};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::api::response::{ApiListResponse, ApiResponse};
use crate::error::ApiError;
use crate::extract::Body;
use crate::state::AppState;

/// Create sub-account request
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSubAccountRequest {
    pub title: String,
}

/// Fields left out keep their value
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateSubAccountRequest {
    pub title: Option<String>,
    pub deposit_allowed: Option<bool>,
    pub withdrawal_allowed: Option<bool>,
    pub transfer_allowed: Option<bool>,
}

/// Internal transfer request; `from` and `to` are account selectors
#[derive(Debug, Deserialize, ToSchema)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub coin: String,
    /// Decimal string
    pub amount: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct BalanceQuery {
    /// Sub-account id, title or `main`; every sub-account when absent
    pub account: Option<String>,
}

/// List the caller's sub-accounts
#[utoipa::path(
    get,
    path = "/sub-accounts",
    responses((status = 200, description = "Sub-accounts")),
    security(("bearer" = [])),
    tag = "account"
)]
pub async fn list_sub_accounts(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<ApiListResponse<SubAccount>, ApiError> {
    state.require(&principal, perms::SUB_ACCOUNTS)?;
    let subs = state.accounts.sub_accounts.list(principal.user_id).await?;
    Ok(ApiListResponse::all(subs, json!({})))
}

/// Create a sub-account
#[utoipa::path(
    post,
    path = "/sub-accounts",
    request_body = CreateSubAccountRequest,
    responses(
        (status = 201, description = "Sub-account created", body = SubAccount),
        (status = 400, description = "Duplicate title or limit reached")
    ),
    security(("bearer" = [])),
    tag = "account"
)]
pub async fn create_sub_account(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<CreateSubAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&principal, perms::SUB_ACCOUNTS)?;
    principal.require_write()?;
    let sub = state
        .accounts
        .sub_accounts
        .create(principal.user_id, &request.title)
        .await?;
    info!(user_id = principal.user_id, sub_account_id = sub.id, "sub-account created");
    Ok(ApiResponse::created(sub))
}

/// Edit a sub-account
#[utoipa::path(
    put,
    path = "/sub-accounts/{id}",
    params(("id" = i64, Path, description = "Sub-account id")),
    request_body = UpdateSubAccountRequest,
    responses(
        (status = 200, description = "Sub-account updated", body = SubAccount),
        (status = 400, description = "Invalid account")
    ),
    security(("bearer" = [])),
    tag = "account"
)]
pub async fn update_sub_account(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<SubAccountId>,
    Body(request): Body<UpdateSubAccountRequest>,
) -> Result<ApiResponse<SubAccount>, ApiError> {
    state.require(&principal, perms::SUB_ACCOUNTS)?;
    principal.require_write()?;
    let sub = state
        .accounts
        .sub_accounts
        .update(
            principal.user_id,
            id,
            SubAccountUpdate {
                title: request.title,
                deposit_allowed: request.deposit_allowed,
                withdrawal_allowed: request.withdrawal_allowed,
                transfer_allowed: request.transfer_allowed,
            },
        )
        .await?;
    Ok(ApiResponse::new(sub))
}

/// Move available funds between two sub-accounts
#[utoipa::path(
    post,
    path = "/sub-accounts/transfer",
    request_body = TransferRequest,
    responses(
        (status = 200, description = "Transferred"),
        (status = 400, description = "Invalid account, amount or insufficient balance")
    ),
    security(("bearer" = [])),
    tag = "account"
)]
pub async fn transfer(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<TransferRequest>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    state.require(&principal, perms::TRANSFER)?;
    principal.require_write()?;
    state
        .accounts
        .ledger
        .transfer(
            principal.user_id,
            &request.from,
            &request.to,
            &request.coin,
            &request.amount,
        )
        .await?;
    Ok(ApiResponse::new(json!({
        "from": request.from,
        "to": request.to,
        "coin": request.coin,
        "amount": request.amount,
    })))
}

/// Balances of one sub-account, or of all of them
#[utoipa::path(
    get,
    path = "/balances",
    params(BalanceQuery),
    responses(
        (status = 200, description = "Balances per sub-account"),
        (status = 400, description = "Invalid account")
    ),
    security(("bearer" = [])),
    tag = "account"
)]
pub async fn balances(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<BalanceQuery>,
) -> Result<ApiListResponse<Balances>, ApiError> {
    state.require(&principal, perms::WALLETS_READ)?;
    let ledger = &state.accounts.ledger;
    let balances = match query.account.as_deref() {
        Some(selector) => vec![ledger.balances(principal.user_id, Some(selector)).await?],
        None => ledger.all_balances(principal.user_id).await?,
    };
    Ok(ApiListResponse::all(
        balances,
        json!({ "account": query.account }),
    ))
}
