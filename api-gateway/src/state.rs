//! Shared handler state and request authentication

use std::sync::Arc;

use account_service::AccountModule;
use auth_service::{AuthModule, SessionClaims};
use axum::http::HeaderMap;
use common::cache::ActivityTracker;
use common::error::{Error, Result};
use common::features::{flags, FeatureFlags, FlagContext};
use common::model::api_key::ApiKeyVersion;
use common::model::{Principal, UserId};
use order_service::OrderModule;
use realtime::{NewNotification, RealtimeModule};
use tracing::{debug, warn};

use crate::captcha::CaptchaVerifier;
use crate::config::GatewayConfig;
use crate::extract::{bearer, header};

/// Header carrying a v2 key (public or private part)
pub const API_KEY_V2_HEADER: &str = "x-api-key-v2";
/// Header carrying a v1 key secret
pub const API_KEY_V1_HEADER: &str = "x-api-key";

/// App state shared across handlers
pub struct AppState {
    pub config: GatewayConfig,
    pub auth: Arc<AuthModule>,
    pub accounts: Arc<AccountModule>,
    pub orders: Arc<OrderModule>,
    pub realtime: Arc<RealtimeModule>,
    pub flags: Arc<dyn FeatureFlags>,
    /// Coarse per-user liveness, touched on every authenticated request
    pub activity: Arc<ActivityTracker>,
    pub captcha: Arc<dyn CaptchaVerifier>,
}

/// Result of authenticating a request
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    /// Set on the bearer path
    pub session: Option<SessionClaims>,
}

impl AppState {
    /// Resolve the caller from the API-key-v2, API-key-v1 or bearer header,
    /// in that order
    pub async fn authenticate(&self, headers: &HeaderMap, ip: &str) -> Result<Authenticated> {
        if let Some(presented) = header(headers, API_KEY_V2_HEADER) {
            return self.authenticate_key(ApiKeyVersion::V2, presented, ip).await;
        }
        if let Some(presented) = header(headers, API_KEY_V1_HEADER) {
            return self.authenticate_key(ApiKeyVersion::V1, presented, ip).await;
        }
        let Some(token) = bearer(headers) else {
            return Err(Error::Unauthorized("Authorization required".to_string()));
        };

        let claims = self.auth.service.authenticate(token, ip)?;
        let user_id = claims.user_id()?;
        // Role and status as stored now, not as issued
        let user = self.auth.identity.get_active(user_id).await?;
        if !self.admits_role(&user.role, user_id) {
            warn!(user_id, role = %user.role, "non-UI role refused");
            return Err(Error::AccessDenied(
                "Role is not allowed to use this interface".to_string(),
            ));
        }

        Ok(Authenticated {
            principal: Principal::session(user_id, user.role),
            session: Some(claims),
        })
    }

    async fn authenticate_key(
        &self,
        version: ApiKeyVersion,
        presented: &str,
        ip: &str,
    ) -> Result<Authenticated> {
        let authenticated = self.auth.api_keys.authenticate(version, presented, ip).await?;
        let user = self.auth.identity.get_active(authenticated.key.user_id).await?;
        debug!(
            user_id = authenticated.key.user_id,
            key_id = authenticated.key.id,
            access = ?authenticated.grant.access,
            "API key accepted"
        );
        Ok(Authenticated {
            principal: Principal {
                user_id: user.id,
                role: user.role,
                api_key: Some(authenticated.grant),
            },
            session: None,
        })
    }

    fn admits_role(&self, role: &str, user_id: UserId) -> bool {
        self.auth.permissions.is_ui_role(role)
            || self.config.is_ui_role(role)
            || self.config.allow_non_ui_roles
            || self
                .flags
                .is_enabled(flags::NON_UI_ROLES_ALLOWED, &FlagContext::user(user_id))
    }

    /// Per-endpoint permission gate
    pub fn require(&self, principal: &Principal, permission: &str) -> Result<()> {
        self.auth.permissions.check(&principal.role, permission)
    }

    /// Queue a notification; delivery problems never fail the request
    pub async fn notify(&self, user_id: UserId, title: &str, body: String) {
        if let Err(e) = self
            .realtime
            .notifier
            .submit(NewNotification::new(user_id, title, body))
            .await
        {
            warn!(user_id, "notification not queued: {}", e);
        }
    }
}
