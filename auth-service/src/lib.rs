//! Auth service: identity, tokens, second factors, API keys, permissions and
//! two-key email actions

pub mod activity;
pub mod actions;
pub mod api_keys;
pub mod config;
pub mod identity;
pub mod password;
pub mod permissions;
pub mod repository;
pub mod service;
pub mod token;
pub mod two_factor;

use std::sync::Arc;

use common::error::Result;
use common::features::FeatureFlags;
use common::mail::MailDispatcher;
use common::model::action::ActionType;

pub use actions::{ActionEffect, ActionRepository, ActionService, ApproveOutcome, InMemoryActionRepository, Recipient};
pub use activity::{ActivityKind, ActivityLog, ActivitySink};
pub use api_keys::{ApiKeyRepository, ApiKeyService, InMemoryApiKeyRepository};
pub use config::AuthConfig;
pub use identity::IdentityService;
pub use permissions::{perms, PermissionCache, RoleSource, StaticRoleSource};
pub use repository::{InMemoryUserRepository, PostgresUserRepository, UserRepository};
pub use service::{AuthService, LoginOutcome, LoginRequest};
pub use token::{SessionClaims, TokenService};
pub use two_factor::{MemorySmsProvider, SmsProvider, TwoFactorVerifier};

/// Storage backends of the auth module
pub struct AuthStores {
    pub users: Arc<dyn UserRepository>,
    pub actions: Arc<dyn ActionRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
}

impl AuthStores {
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(InMemoryUserRepository::new()),
            actions: Arc::new(InMemoryActionRepository::new()),
            api_keys: Arc::new(InMemoryApiKeyRepository::new()),
        }
    }
}

/// Every auth component, wired together
pub struct AuthModule {
    pub config: Arc<AuthConfig>,
    pub users: Arc<dyn UserRepository>,
    pub tokens: Arc<TokenService>,
    pub identity: Arc<IdentityService>,
    pub two_factor: Arc<TwoFactorVerifier>,
    pub actions: Arc<ActionService>,
    pub api_keys: Arc<ApiKeyService>,
    pub permissions: Arc<PermissionCache>,
    pub service: Arc<AuthService>,
}

impl AuthModule {
    /// Wire the module and load the permission cache
    ///
    /// Effects for IP confirmation and API key activation are registered
    /// here; other crates register theirs on `actions`.
    pub async fn build(
        config: AuthConfig,
        stores: AuthStores,
        sms: Arc<dyn SmsProvider>,
        flags: Arc<dyn FeatureFlags>,
        mail: MailDispatcher,
        activity: ActivityLog,
        roles: &dyn RoleSource,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let tokens = Arc::new(TokenService::new(config.clone(), flags));
        let identity = Arc::new(IdentityService::new(stores.users.clone(), tokens.clone()));
        let two_factor = Arc::new(TwoFactorVerifier::new(
            sms,
            config.sms_challenge_interval_secs,
            config.totp_skew,
        ));
        let actions = Arc::new(ActionService::new(stores.actions, mail.clone(), &config.public_url));
        let api_keys = Arc::new(ApiKeyService::new(stores.api_keys.clone(), actions.clone()));

        actions.register_effect(
            ActionType::ConfirmIp,
            Arc::new(service::IpConfirmation::new(stores.users.clone())),
        );
        let activation = Arc::new(api_keys::ApiKeyActivation::new(stores.api_keys));
        actions.register_effect(ActionType::ApiKey, activation.clone());
        actions.register_effect(ActionType::ApiKeyV2, activation);

        let permissions = Arc::new(PermissionCache::new());
        permissions.load(roles).await?;

        let service = Arc::new(AuthService::new(
            identity.clone(),
            tokens.clone(),
            two_factor.clone(),
            actions.clone(),
            mail,
            activity,
            config.clone(),
        ));

        Ok(Self {
            config,
            users: stores.users,
            tokens,
            identity,
            two_factor,
            actions,
            api_keys,
            permissions,
            service,
        })
    }
}
