//! Registration, login and session handlers
//!
//! Login ends in one of three places: a session (200), an owed second
//! factor (423 with a partial token) or an unapproved IP (412 with a partial
//! token and an emailed confirm-ip action).

use std::sync::Arc;

use auth_service::token::IssuedToken;
use auth_service::{LoginOutcome, LoginRequest, SessionClaims};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use common::error::Error;
use common::model::user::User;
use common::model::{Principal, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use utoipa::ToSchema;

use crate::api::response::ApiResponse;
use crate::error::ApiError;
use crate::extract::{Body, ClientIp};
use crate::state::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub user: User,
    /// Partial token at the unapproved-email stage, also sent by email
    pub preauth_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

impl SessionResponse {
    fn from_issued(issued: IssuedToken) -> Result<Self, ApiError> {
        Ok(Self {
            user_id: issued.claims.user_id()?,
            token: issued.token,
            expires_at: issued.expires_at,
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TwoFactorLoginRequest {
    pub preauth_token: String,
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PreAuthRequest {
    pub preauth_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

fn outcome_response(outcome: LoginOutcome) -> Result<Response, ApiError> {
    let response = match outcome {
        LoginOutcome::Session(issued) => {
            ApiResponse::new(SessionResponse::from_issued(issued)?).into_response()
        }
        LoginOutcome::TwoFactorRequired {
            preauth_token,
            method,
        } => (
            StatusCode::LOCKED,
            Json(json!({
                "error": "OTP required",
                "preauth_token": preauth_token,
                "method": method,
            })),
        )
            .into_response(),
        LoginOutcome::IpConfirmationRequired {
            preauth_token,
            action_id,
        } => (
            StatusCode::PRECONDITION_FAILED,
            Json(json!({
                "error": "New IP address must be confirmed by email",
                "preauth_token": preauth_token,
                "action_id": action_id,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

/// Register a new user
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created, confirmation email sent"),
        (status = 400, description = "Invalid email or password")
    ),
    tag = "auth"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Body(request): Body<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let registration = state
        .auth
        .service
        .register(&request.email, &request.password, request.phone, &ip)
        .await?;
    state
        .accounts
        .sub_accounts
        .create_defaults(registration.user.id)
        .await?;

    info!(user_id = registration.user.id, "user registered");
    Ok(ApiResponse::created(RegisterResponse {
        user: registration.user,
        preauth_token: registration.confirmation_token,
    }))
}

/// Confirm an email address
#[utoipa::path(
    post,
    path = "/auth/email/confirm/{token}",
    params(("token" = String, Path, description = "Token from the confirmation email")),
    responses(
        (status = 200, description = "User is active", body = User),
        (status = 401, description = "Invalid token")
    ),
    tag = "auth"
)]
pub async fn confirm_email(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<ApiResponse<User>, ApiError> {
    let user = state.auth.service.confirm_email(&token).await?;
    Ok(ApiResponse::new(user))
}

/// Send the confirmation email again
#[utoipa::path(
    post,
    path = "/auth/email/resend",
    request_body = EmailRequest,
    responses((status = 200, description = "Sent when the user is still pending")),
    tag = "auth"
)]
pub async fn resend_confirmation(
    State(state): State<Arc<AppState>>,
    Body(request): Body<EmailRequest>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    state.auth.service.resend_confirmation(&request.email).await?;
    Ok(ApiResponse::new(json!({ "sent": true })))
}

/// Password login
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Session issued", body = SessionResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 412, description = "New IP, confirmation email sent"),
        (status = 423, description = "OTP required")
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Body(request): Body<LoginBody>,
) -> Result<Response, ApiError> {
    let outcome = state
        .auth
        .service
        .login(LoginRequest {
            email: request.email,
            password: request.password,
            ip,
            remember: request.remember,
        })
        .await?;
    outcome_response(outcome)
}

/// Exchange a partial token and an OTP for a session
#[utoipa::path(
    post,
    path = "/auth/2fa/login",
    request_body = TwoFactorLoginRequest,
    responses(
        (status = 200, description = "Session issued", body = SessionResponse),
        (status = 400, description = "Invalid code")
    ),
    tag = "auth"
)]
pub async fn complete_two_factor(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Body(request): Body<TwoFactorLoginRequest>,
) -> Result<ApiResponse<SessionResponse>, ApiError> {
    let issued = state
        .auth
        .service
        .complete_two_factor(&request.preauth_token, &request.code, &ip)
        .await?;
    Ok(ApiResponse::new(SessionResponse::from_issued(issued)?))
}

/// Send a new login SMS code
#[utoipa::path(
    post,
    path = "/auth/2fa/sms/resend",
    request_body = PreAuthRequest,
    responses(
        (status = 200, description = "Code sent"),
        (status = 429, description = "Asked too often")
    ),
    tag = "auth"
)]
pub async fn resend_login_sms(
    State(state): State<Arc<AppState>>,
    Body(request): Body<PreAuthRequest>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    state
        .auth
        .service
        .resend_login_sms(&request.preauth_token)
        .await?;
    Ok(ApiResponse::new(json!({ "sent": true })))
}

/// Continue a login once the new IP was confirmed
#[utoipa::path(
    post,
    path = "/auth/ip/resume",
    request_body = PreAuthRequest,
    responses(
        (status = 200, description = "Session issued", body = SessionResponse),
        (status = 412, description = "IP still unconfirmed"),
        (status = 423, description = "OTP required")
    ),
    tag = "auth"
)]
pub async fn resume_after_ip_confirmation(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Body(request): Body<PreAuthRequest>,
) -> Result<Response, ApiError> {
    let outcome = state
        .auth
        .service
        .resume_after_ip_confirmation(&request.preauth_token, &ip)
        .await?;
    outcome_response(outcome)
}

/// Revoke the current session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses((status = 200, description = "Session revoked")),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    State(state): State<Arc<AppState>>,
    claims: Option<Extension<SessionClaims>>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    let Some(Extension(claims)) = claims else {
        return Err(Error::InvalidInput("Only sessions can log out".to_string()).into());
    };
    state.auth.service.logout(&claims).await?;
    Ok(ApiResponse::new(json!({ "logged_out": true })))
}

/// Change the password; every session of the user is revoked
#[utoipa::path(
    post,
    path = "/auth/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed"),
        (status = 400, description = "Wrong current password or weak new one")
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Body(request): Body<ChangePasswordRequest>,
) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    crate::api::session_only(&principal)?;
    state
        .auth
        .service
        .change_password(
            principal.user_id,
            &request.current_password,
            &request.new_password,
        )
        .await?;
    Ok(ApiResponse::new(json!({ "changed": true })))
}

