//! Notification inbox

use std::sync::Arc;

use auth_service::perms;
use axum::extract::{Path, Query, State};
use axum::Extension;
use common::model::notification::Notification;
use common::model::Principal;
use serde_json::json;
use uuid::Uuid;

use crate::api::response::{ApiListResponse, ApiResponse, Paging};
use crate::error::ApiError;
use crate::state::AppState;

/// Newest first
#[utoipa::path(
    get,
    path = "/notifications",
    params(
        ("page" = Option<usize>, Query, description = "1-based page"),
        ("limit" = Option<usize>, Query, description = "Page size")
    ),
    responses((status = 200, description = "One page of notifications")),
    security(("bearer" = [])),
    tag = "notifications"
)]
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(paging): Query<Paging>,
) -> Result<ApiListResponse<Notification>, ApiError> {
    state.require(&principal, perms::NOTIFICATIONS)?;
    let paging = paging.clamped();
    let (items, total) =
        state
            .realtime
            .notifications
            .list(principal.user_id, paging.page, paging.limit);
    Ok(ApiListResponse::page(
        items,
        paging.page,
        paging.limit,
        total,
        json!({}),
    ))
}

#[utoipa::path(
    get,
    path = "/notifications/unread",
    responses((status = 200, description = "Unread count")),
    security(("bearer" = [])),
    tag = "notifications"
)]
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    state.require(&principal, perms::NOTIFICATIONS)?;
    let count = state.realtime.notifications.unread_count(principal.user_id);
    Ok(ApiResponse::new(json!({ "unread": count })))
}

#[utoipa::path(
    post,
    path = "/notifications/{id}/read",
    params(("id" = Uuid, Path, description = "Notification id")),
    responses(
        (status = 200, description = "Marked read", body = Notification),
        (status = 404, description = "Notification not found")
    ),
    security(("bearer" = [])),
    tag = "notifications"
)]
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<Notification>, ApiError> {
    state.require(&principal, perms::NOTIFICATIONS)?;
    let notification = state.realtime.notifications.mark_read(principal.user_id, id)?;
    Ok(ApiResponse::new(notification))
}

#[utoipa::path(
    post,
    path = "/notifications/read-all",
    responses((status = 200, description = "Number of notifications marked")),
    security(("bearer" = [])),
    tag = "notifications"
)]
pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    state.require(&principal, perms::NOTIFICATIONS)?;
    let marked = state.realtime.notifications.mark_all_read(principal.user_id);
    Ok(ApiResponse::new(json!({ "marked": marked })))
}
