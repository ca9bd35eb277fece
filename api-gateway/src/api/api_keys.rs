//! API key management

use std::sync::Arc;

use auth_service::api_keys::NewApiKey;
use auth_service::perms;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Extension;
use common::model::api_key::{ApiKey, ApiKeyCapabilities, ApiKeyVersion};
use common::model::{ApiKeyId, Principal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::response::{ApiListResponse, ApiResponse};
use crate::api::session_only;
use crate::error::ApiError;
use crate::extract::Body;
use crate::state::AppState;

fn default_version() -> ApiKeyVersion {
    ApiKeyVersion::V2
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateApiKeyRequest {
    #[serde(default = "default_version")]
    pub version: ApiKeyVersion,
    #[serde(default)]
    pub capabilities: ApiKeyCapabilities,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedApiKeyResponse {
    pub key: ApiKey,
    /// Shown once; activate the key through the emailed approval links
    pub secret: String,
    pub action_id: Uuid,
}

fn gate(state: &AppState, principal: &Principal) -> Result<(), ApiError> {
    session_only(principal)?;
    state.require(principal, perms::API_KEYS)?;
    Ok(())
}

/// The caller's keys
#[utoipa::path(
    get,
    path = "/api-keys",
    responses((status = 200, description = "Keys, secrets omitted")),
    security(("bearer" = [])),
    tag = "api-keys"
)]
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<ApiListResponse<ApiKey>, ApiError> {
    gate(&state, &principal)?;
    let keys = state.auth.api_keys.list(principal.user_id).await?;
    Ok(ApiListResponse::all(keys, json!({})))
}

/// Create a pending key
#[utoipa::path(
    post,
    path = "/api-keys",
    request_body = CreateApiKeyRequest,
    responses(
        (status = 201, description = "Key created, approval emails sent", body = CreatedApiKeyResponse),
        (status = 400, description = "Invalid allow-list")
    ),
    security(("bearer" = [])),
    tag = "api-keys"
)]
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    gate(&state, &principal)?;
    let user = state.auth.identity.get(principal.user_id).await?;
    let recipient = state.auth.service.recipient(&user).await?;

    let created = state
        .auth
        .api_keys
        .create(
            &recipient,
            &principal.role,
            NewApiKey {
                version: request.version,
                capabilities: request.capabilities,
                allowed_ips: request.allowed_ips,
            },
        )
        .await?;

    info!(user_id = principal.user_id, key_id = created.key.id, "API key created");
    Ok(ApiResponse::created(CreatedApiKeyResponse {
        key: created.key,
        secret: created.secret,
        action_id: created.action.id,
    }))
}

/// Delete a key
#[utoipa::path(
    delete,
    path = "/api-keys/{id}",
    params(("id" = i64, Path, description = "Key id")),
    responses(
        (status = 200, description = "Key deleted"),
        (status = 404, description = "Not the caller's key")
    ),
    security(("bearer" = [])),
    tag = "api-keys"
)]
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<ApiKeyId>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    gate(&state, &principal)?;
    state.auth.api_keys.delete(principal.user_id, id).await?;
    Ok(ApiResponse::new(json!({ "deleted": id })))
}
