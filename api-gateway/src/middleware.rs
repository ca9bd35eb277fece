//! Request gates layered in front of handlers

use std::sync::Arc;

use auth_service::token::{PreAuthClaims, TokenKind};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use common::error::Error;
use common::features::{flags, FlagContext};
use tracing::debug;

use crate::captcha::CaptchaVersion;
use crate::error::ApiError;
use crate::extract::{client_ip, header};
use crate::state::AppState;

pub const CAPTCHA_TOKEN_HEADER: &str = "x-captcha-token";
pub const CAPTCHA_VERSION_HEADER: &str = "x-captcha-version";
/// A valid partial token lets the client skip the captcha
pub const PREAUTH_HEADER: &str = "x-preauth-token";

/// Authenticate the caller and attach the [`common::model::Principal`]
/// (and the session claims on the bearer path) to the request
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(req.headers(), req.extensions());
    // The request body is not Sync, so nothing borrowed from it crosses an await
    let headers = req.headers().clone();
    let authenticated = state.authenticate(&headers, &ip).await?;

    state.activity.touch(authenticated.principal.user_id);
    debug!(
        user_id = authenticated.principal.user_id,
        api_key = authenticated.principal.is_api_key(),
        "request authenticated"
    );

    req.extensions_mut().insert(authenticated.principal);
    if let Some(claims) = authenticated.session {
        req.extensions_mut().insert(claims);
    }
    Ok(next.run(req).await)
}

/// Validate the captcha unless disabled or bypassed by a partial token
pub async fn require_captcha(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state
        .flags
        .is_enabled(flags::CAPTCHA_DISABLED, &FlagContext::default())
    {
        return Ok(next.run(req).await);
    }

    let (preauth_valid, token, version, ip) = {
        let headers = req.headers();
        let preauth_valid = header(headers, PREAUTH_HEADER)
            .map(|token| {
                state
                    .auth
                    .tokens
                    .parse::<PreAuthClaims>(token, TokenKind::PreAuth)
                    .is_ok()
            })
            .unwrap_or(false);
        (
            preauth_valid,
            header(headers, CAPTCHA_TOKEN_HEADER).map(str::to_string),
            header(headers, CAPTCHA_VERSION_HEADER).map(str::to_string),
            client_ip(headers, req.extensions()),
        )
    };
    if preauth_valid {
        debug!("captcha bypassed by partial token");
        return Ok(next.run(req).await);
    }

    let token = token.ok_or_else(|| Error::InvalidInput("Captcha is required".to_string()))?;
    let version = CaptchaVersion::parse(version.as_deref())?;
    if !state.captcha.verify(version, &token, &ip).await? {
        return Err(Error::InvalidInput("Captcha verification failed".to_string()).into());
    }
    Ok(next.run(req).await)
}
