//! Profile, security settings and second-factor enrollment

use std::sync::Arc;

use auth_service::perms;
use auth_service::service::SettingsUpdate;
use axum::extract::State;
use axum::Extension;
use common::model::user::{TwoFactorMethod, User, UserSettings};
use common::model::Principal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::api::response::ApiResponse;
use crate::api::session_only;
use crate::error::ApiError;
use crate::extract::Body;
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct Profile {
    pub user: User,
    pub settings: UserSettings,
}

/// `null` clears, absence keeps
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SettingsRequest {
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>)]
    pub anti_phishing_code: Option<Option<String>>,
    #[serde(default)]
    pub detect_ip_change: Option<bool>,
    #[serde(default)]
    pub selected_layout: Option<String>,
    #[serde(default)]
    pub fees_paid_with_native: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TradePasswordRequest {
    pub password: String,
    pub trade_password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GoogleAuthRequest {
    pub secret: String,
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SmsDestination {
    pub destination: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SmsEnableRequest {
    pub destination: String,
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TwoFactorChange {
    pub method: TwoFactorMethod,
    pub code: String,
}

fn gate(state: &AppState, principal: &Principal) -> Result<(), ApiError> {
    session_only(principal)?;
    state.require(principal, perms::PROFILE)?;
    Ok(())
}

/// The caller's user record and settings
#[utoipa::path(
    get,
    path = "/profile",
    responses((status = 200, description = "Profile", body = Profile)),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<ApiResponse<Profile>, ApiError> {
    state.require(&principal, perms::PROFILE)?;
    let user = state.auth.identity.get(principal.user_id).await?;
    let settings = state.auth.identity.settings(principal.user_id).await?;
    Ok(ApiResponse::new(Profile { user, settings }))
}

/// Update anti-phishing, IP-change detection and UI settings
#[utoipa::path(
    put,
    path = "/profile/settings",
    request_body = SettingsRequest,
    responses((status = 200, description = "Updated settings", body = UserSettings)),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<SettingsRequest>,
) -> Result<ApiResponse<UserSettings>, ApiError> {
    gate(&state, &principal)?;
    let settings = state
        .auth
        .service
        .update_settings(
            principal.user_id,
            SettingsUpdate {
                anti_phishing_code: request.anti_phishing_code,
                detect_ip_change: request.detect_ip_change,
                selected_layout: request.selected_layout,
                fees_paid_with_native: request.fees_paid_with_native,
            },
        )
        .await?;
    Ok(ApiResponse::new(settings))
}

/// Set the trade password
#[utoipa::path(
    post,
    path = "/profile/trade-password",
    request_body = TradePasswordRequest,
    responses(
        (status = 200, description = "Trade password set"),
        (status = 400, description = "Wrong account password or weak trade password")
    ),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn set_trade_password(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<TradePasswordRequest>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    gate(&state, &principal)?;
    state
        .auth
        .service
        .set_trade_password(principal.user_id, &request.password, &request.trade_password)
        .await?;
    Ok(ApiResponse::new(json!({ "set": true })))
}

/// A fresh Google-auth secret to enroll
#[utoipa::path(
    get,
    path = "/profile/2fa/google/secret",
    responses((status = 200, description = "Base32 secret")),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn google_auth_secret(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    gate(&state, &principal)?;
    let secret = state.auth.service.new_google_auth_secret();
    Ok(ApiResponse::new(json!({ "secret": secret })))
}

/// Confirm a Google-auth secret with a valid code
#[utoipa::path(
    post,
    path = "/profile/2fa/google",
    request_body = GoogleAuthRequest,
    responses(
        (status = 200, description = "Google auth enabled", body = UserSettings),
        (status = 400, description = "Invalid code")
    ),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn enable_google_auth(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<GoogleAuthRequest>,
) -> Result<ApiResponse<UserSettings>, ApiError> {
    gate(&state, &principal)?;
    let settings = state
        .auth
        .service
        .enable_google_auth(principal.user_id, &request.secret, &request.code)
        .await?;
    Ok(ApiResponse::new(settings))
}

/// Send an enrollment code to a phone
#[utoipa::path(
    post,
    path = "/profile/2fa/sms/request",
    request_body = SmsDestination,
    responses(
        (status = 200, description = "Code sent"),
        (status = 429, description = "Asked too often")
    ),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn request_sms_enrollment(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<SmsDestination>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    gate(&state, &principal)?;
    state
        .auth
        .service
        .request_sms_enrollment(principal.user_id, &request.destination)
        .await?;
    Ok(ApiResponse::new(json!({ "sent": true })))
}

/// Confirm the phone with the code it received
#[utoipa::path(
    post,
    path = "/profile/2fa/sms",
    request_body = SmsEnableRequest,
    responses(
        (status = 200, description = "SMS enabled", body = UserSettings),
        (status = 400, description = "Invalid code")
    ),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn enable_sms(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<SmsEnableRequest>,
) -> Result<ApiResponse<UserSettings>, ApiError> {
    gate(&state, &principal)?;
    let settings = state
        .auth
        .service
        .enable_sms(principal.user_id, &request.destination, &request.code)
        .await?;
    Ok(ApiResponse::new(settings))
}

/// Switch the primary second factor
#[utoipa::path(
    post,
    path = "/profile/2fa/primary",
    request_body = TwoFactorChange,
    responses((status = 200, description = "Primary method changed", body = UserSettings)),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn set_primary_two_factor(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<TwoFactorChange>,
) -> Result<ApiResponse<UserSettings>, ApiError> {
    gate(&state, &principal)?;
    let settings = state
        .auth
        .service
        .set_primary_two_factor(principal.user_id, request.method, &request.code)
        .await?;
    Ok(ApiResponse::new(settings))
}

/// Remove a second factor
#[utoipa::path(
    post,
    path = "/profile/2fa/disable",
    request_body = TwoFactorChange,
    responses((status = 200, description = "Method removed", body = UserSettings)),
    security(("bearer" = [])),
    tag = "profile"
)]
pub async fn disable_two_factor(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<TwoFactorChange>,
) -> Result<ApiResponse<UserSettings>, ApiError> {
    gate(&state, &principal)?;
    let settings = state
        .auth
        .service
        .disable_two_factor(principal.user_id, request.method, &request.code)
        .await?;
    Ok(ApiResponse::new(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anti_phishing_null_clears_and_absence_keeps() {
        let cleared: SettingsRequest =
            serde_json::from_str(r#"{ "anti_phishing_code": null }"#).unwrap();
        assert_eq!(cleared.anti_phishing_code, Some(None));

        let kept: SettingsRequest = serde_json::from_str(r#"{ "detect_ip_change": true }"#).unwrap();
        assert_eq!(kept.anti_phishing_code, None);
        assert_eq!(kept.detect_ip_change, Some(true));

        let set: SettingsRequest =
            serde_json::from_str(r#"{ "anti_phishing_code": "owl" }"#).unwrap();
        assert_eq!(set.anti_phishing_code, Some(Some("owl".to_string())));
    }
}
