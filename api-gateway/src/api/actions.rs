//! Two-key email approval endpoint
//!
//! Both links of an approval email pair land here. The first key only marks
//! itself used; the second runs the action's effect.

use std::sync::Arc;

use auth_service::ApproveOutcome;
use axum::extract::{Path, Query, State};
use common::model::action::{Action, ActionStatus, ActionType};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::response::ApiResponse;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ApproveQuery {
    /// One of the two keys from the approval emails
    pub key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApproveResponse {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub message: String,
}

fn message(outcome: &ApproveOutcome) -> &'static str {
    match outcome {
        ApproveOutcome::AwaitingSecondKey => "Secondary approval is pending",
        ApproveOutcome::Approved => "Action approved",
        ApproveOutcome::AlreadyApproved => "Action was already approved",
    }
}

/// Present an approval key
#[utoipa::path(
    post,
    path = "/actions/{id}/approve",
    params(("id" = Uuid, Path, description = "Action id"), ApproveQuery),
    responses(
        (status = 200, description = "Key accepted", body = ApproveResponse),
        (status = 400, description = "Invalid action key"),
        (status = 404, description = "Unknown action")
    ),
    tag = "actions"
)]
pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ApproveQuery>,
) -> Result<ApiResponse<ApproveResponse>, ApiError> {
    let (action, outcome) = state.auth.actions.approve(id, &query.key).await?;
    if matches!(outcome, ApproveOutcome::Approved) {
        info!(action_id = %action.id, action_type = ?action.action_type, "approval completed");
        after_approval(&state, &action).await;
    }

    Ok(ApiResponse::new(ApproveResponse {
        action_id: action.id,
        action_type: action.action_type,
        status: action.status,
        message: message(&outcome).to_string(),
    }))
}

async fn after_approval(state: &AppState, action: &Action) {
    match action.action_type {
        ActionType::Withdraw => {
            let Some(withdraw_id) = action
                .data
                .get("withdraw_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                warn!(action_id = %action.id, "withdraw action without a request id");
                return;
            };
            match state.accounts.withdrawals.get(withdraw_id).await {
                Ok(request) => {
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
                Err(e) => warn!(%withdraw_id, "approved withdrawal not found: {}", e),
            }
        }
        ActionType::ApiKey | ActionType::ApiKeyV2 => {
            state
                .notify(action.user_id, "API key", "API key activated".to_string())
                .await;
        }
        ActionType::ConfirmIp => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_follow_the_outcome() {
        assert_eq!(
            message(&ApproveOutcome::AwaitingSecondKey),
            "Secondary approval is pending"
        );
        assert_eq!(message(&ApproveOutcome::Approved), "Action approved");
    }
}
