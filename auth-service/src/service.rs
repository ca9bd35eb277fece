//! Auth service: registration, login, second factors and security settings

use std::sync::Arc;

use async_trait::async_trait;
use common::error::{Error, ErrorExt, Result};
use common::mail::{EmailMessage, MailDispatcher};
use common::model::action::{Action, ActionType};
use common::model::user::{roles, IpStatus, TwoFactorMethod, User, UserSettings, UserStatus};
use common::model::UserId;
use tracing::{debug, info, warn};

use crate::actions::{ActionEffect, ActionService, Recipient};
use crate::activity::{ActivityKind, ActivityLog};
use crate::config::AuthConfig;
use crate::identity::{self, CreateUser, IdentityService};
use crate::password;
use crate::repository::UserRepository;
use crate::token::{IssuedToken, PreAuthStage, SessionClaims, TokenService};
use crate::two_factor::{totp, TwoFactorVerifier};

/// Login attempt
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub ip: String,
    pub remember: bool,
}

/// Where a login attempt ended up
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Fully authenticated
    Session(IssuedToken),
    /// A second factor is owed; exchange the token and a code for a session
    TwoFactorRequired {
        preauth_token: String,
        method: TwoFactorMethod,
    },
    /// The IP must be approved by email first
    IpConfirmationRequired {
        preauth_token: String,
        action_id: uuid::Uuid,
    },
}

/// A new user and the token that confirms its email
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    pub confirmation_token: String,
}

/// Partial update of security and UI settings
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    /// `Some(None)` clears the code
    pub anti_phishing_code: Option<Option<String>>,
    pub detect_ip_change: Option<bool>,
    pub selected_layout: Option<String>,
    pub fees_paid_with_native: Option<bool>,
}

/// Auth service handling every identity flow
pub struct AuthService {
    identity: Arc<IdentityService>,
    tokens: Arc<TokenService>,
    two_factor: Arc<TwoFactorVerifier>,
    actions: Arc<ActionService>,
    mail: MailDispatcher,
    activity: ActivityLog,
    config: Arc<AuthConfig>,
}

impl AuthService {
    pub fn new(
        identity: Arc<IdentityService>,
        tokens: Arc<TokenService>,
        two_factor: Arc<TwoFactorVerifier>,
        actions: Arc<ActionService>,
        mail: MailDispatcher,
        activity: ActivityLog,
        config: Arc<AuthConfig>,
    ) -> Self {
        Self {
            identity,
            tokens,
            two_factor,
            actions,
            mail,
            activity,
            config,
        }
    }

    pub fn identity(&self) -> &Arc<IdentityService> {
        &self.identity
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    fn repo(&self) -> &Arc<dyn UserRepository> {
        self.identity.repository()
    }

    /// Build the email recipient for a user
    pub async fn recipient(&self, user: &User) -> Result<Recipient> {
        let settings = self.identity.settings(user.id).await?;
        Ok(Recipient {
            user_id: user.id,
            email: user.email.clone(),
            anti_phishing_code: settings.anti_phishing_code,
        })
    }

    /// Create a pending member and send the confirmation email
    ///
    /// The registration IP is trusted.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        phone: Option<String>,
        ip: &str,
    ) -> Result<Registration> {
        let user = self
            .identity
            .create(CreateUser {
                email: email.to_string(),
                phone,
                password: password.to_string(),
                role: roles::MEMBER.to_string(),
            })
            .await?;
        self.repo().trust_ip(user.id, ip).await?;

        let confirmation_token = self.send_confirmation(&user).await?;
        self.activity
            .record(user.id, ActivityKind::Registered, Some(ip))
            .await;

        Ok(Registration {
            user,
            confirmation_token,
        })
    }

    async fn send_confirmation(&self, user: &User) -> Result<String> {
        let token = self
            .tokens
            .issue_preauth(user.id, PreAuthStage::UnapprovedEmail, false)?;
        let message = EmailMessage {
            to: user.email.clone(),
            subject: "Confirm your email".to_string(),
            body: format!(
                "Confirm your email: {}/auth/email/confirm/{}\n",
                self.config.public_url, token
            ),
        };
        self.mail
            .enqueue(message)
            .await
            .with_context(|| "queueing confirmation email")?;
        Ok(token)
    }

    /// Send a new confirmation email to a pending user; unknown emails are ignored
    pub async fn resend_confirmation(&self, email: &str) -> Result<()> {
        match self.identity.lookup_by_email(email).await? {
            Some(user) if user.status == UserStatus::Pending => {
                self.send_confirmation(&user).await?;
            }
            _ => debug!("confirmation resend ignored"),
        }
        Ok(())
    }

    /// Activate a pending user from the confirmation token
    pub async fn confirm_email(&self, token: &str) -> Result<User> {
        let claims = self
            .tokens
            .parse_preauth(token, PreAuthStage::UnapprovedEmail)?;
        let user = self.identity.get(claims.user_id()?).await?;
        if user.status == UserStatus::Pending {
            self.identity
                .update_status(user.id, UserStatus::Active)
                .await?;
            info!("Email confirmed for user {}", user.id);
        }
        self.identity.get(user.id).await
    }

    /// Password login
    pub async fn login(&self, request: LoginRequest) -> Result<LoginOutcome> {
        let user = match self
            .identity
            .verify_credentials(&request.email, &request.password)
            .await
        {
            Ok(user) => user,
            Err(e) => {
                if let Ok(Some(user)) = self.identity.lookup_by_email(&request.email).await {
                    self.activity
                        .record(user.id, ActivityKind::LoginFailed, Some(&request.ip))
                        .await;
                }
                return Err(e);
            }
        };
        Self::check_status(&user)?;

        let settings = self.identity.settings(user.id).await?;
        if settings.detect_ip_change {
            let status = self.repo().ip_status(user.id, &request.ip).await?;
            if status != Some(IpStatus::Approved) {
                return self.require_ip_confirmation(&user, &request).await;
            }
        }

        self.after_first_factor(&user, &settings, &request.ip, request.remember)
            .await
    }

    fn check_status(user: &User) -> Result<()> {
        identity::ensure_active(user)
    }

    async fn require_ip_confirmation(
        &self,
        user: &User,
        request: &LoginRequest,
    ) -> Result<LoginOutcome> {
        self.repo().add_pending_ip(user.id, &request.ip).await?;
        let recipient = self.recipient(user).await?;
        let action = self
            .actions
            .create(
                &recipient,
                ActionType::ConfirmIp,
                serde_json::json!({ "ip": request.ip }),
                &[("IP address", request.ip.clone())],
            )
            .await?;
        let preauth_token =
            self.tokens
                .issue_preauth(user.id, PreAuthStage::UnapprovedIp, request.remember)?;
        info!("Login from unconfirmed IP for user {}", user.id);
        Ok(LoginOutcome::IpConfirmationRequired {
            preauth_token,
            action_id: action.id,
        })
    }

    async fn after_first_factor(
        &self,
        user: &User,
        settings: &UserSettings,
        ip: &str,
        remember: bool,
    ) -> Result<LoginOutcome> {
        if let Some(method) = settings.primary_two_factor {
            if method == TwoFactorMethod::Sms {
                if let Some(destination) = &settings.sms_auth_destination {
                    if let Err(e) = self.two_factor.request_sms_challenge(user.id, destination).await {
                        warn!("SMS challenge for user {} not sent: {}", user.id, e);
                    }
                }
            }
            let preauth_token =
                self.tokens
                    .issue_preauth(user.id, PreAuthStage::AwaitingTwoFactor, remember)?;
            return Ok(LoginOutcome::TwoFactorRequired {
                preauth_token,
                method,
            });
        }

        Ok(LoginOutcome::Session(
            self.start_session(user, settings, ip, remember).await?,
        ))
    }

    async fn start_session(
        &self,
        user: &User,
        settings: &UserSettings,
        ip: &str,
        remember: bool,
    ) -> Result<IssuedToken> {
        let bind_ip = settings.detect_ip_change.then_some(ip);
        let issued = self
            .tokens
            .issue_session(user.id, &user.role, remember, bind_ip)?;
        self.repo().trust_ip(user.id, ip).await?;
        self.activity
            .record(user.id, ActivityKind::Login, Some(ip))
            .await;
        info!("User {} logged in", user.id);
        Ok(issued)
    }

    /// Exchange a 2FA pre-auth token and a code for a session
    pub async fn complete_two_factor(
        &self,
        preauth_token: &str,
        code: &str,
        ip: &str,
    ) -> Result<IssuedToken> {
        let claims = self
            .tokens
            .parse_preauth(preauth_token, PreAuthStage::AwaitingTwoFactor)?;
        let user = self.identity.get(claims.user_id()?).await?;
        Self::check_status(&user)?;
        let settings = self.identity.settings(user.id).await?;
        self.two_factor.verify_primary(&settings, code).await?;
        self.start_session(&user, &settings, ip, claims.remember)
            .await
    }

    /// Continue a login once the IP confirmation action was approved
    pub async fn resume_after_ip_confirmation(
        &self,
        preauth_token: &str,
        ip: &str,
    ) -> Result<LoginOutcome> {
        let claims = self
            .tokens
            .parse_preauth(preauth_token, PreAuthStage::UnapprovedIp)?;
        let user = self.identity.get(claims.user_id()?).await?;
        Self::check_status(&user)?;
        if self.repo().ip_status(user.id, ip).await? != Some(IpStatus::Approved) {
            return Err(Error::PreconditionRequired(
                "IP address is not confirmed".to_string(),
            ));
        }
        let settings = self.identity.settings(user.id).await?;
        self.after_first_factor(&user, &settings, ip, claims.remember)
            .await
    }

    /// Authenticate a bearer token: signature, expiry, revocation and IP pin
    pub fn authenticate(&self, token: &str, ip: &str) -> Result<SessionClaims> {
        let claims = self.tokens.authenticate_session(token)?;
        if let Some(pinned) = &claims.ip {
            if pinned != ip {
                return Err(Error::invalid_token());
            }
        }
        Ok(claims)
    }

    pub async fn logout(&self, claims: &SessionClaims) -> Result<()> {
        self.tokens.revoke(claims);
        let user_id = claims.user_id()?;
        self.activity
            .record(user_id, ActivityKind::Logout, claims.ip.as_deref())
            .await;
        Ok(())
    }

    /// Change the password; every session of the user is revoked
    pub async fn change_password(
        &self,
        user_id: UserId,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        self.identity
            .change_password(user_id, current_password, new_password)
            .await?;
        self.activity
            .record(user_id, ActivityKind::PasswordChanged, None)
            .await;
        Ok(())
    }

    /// A fresh TOTP secret for the user to scan; nothing is stored yet
    pub fn new_google_auth_secret(&self) -> String {
        totp::generate_secret()
    }

    /// Store a TOTP secret once the user proved they can generate codes for it
    pub async fn enable_google_auth(
        &self,
        user_id: UserId,
        secret: &str,
        code: &str,
    ) -> Result<UserSettings> {
        if totp::decode_base32(secret).map(|s| s.is_empty()).unwrap_or(true) {
            return Err(Error::InvalidInput("Invalid secret".to_string()));
        }
        self.two_factor.verify_totp(secret, code)?;

        let mut settings = self.identity.settings(user_id).await?;
        settings.google_auth_secret = Some(secret.to_string());
        if settings.primary_two_factor.is_none() {
            settings.primary_two_factor = Some(TwoFactorMethod::GoogleAuth);
        }
        self.identity.save_settings(&settings).await?;
        self.activity
            .record(user_id, ActivityKind::TwoFactorChanged, None)
            .await;
        Ok(settings)
    }

    /// Send an enrollment code to a phone number
    pub async fn request_sms_enrollment(&self, user_id: UserId, destination: &str) -> Result<()> {
        self.two_factor
            .request_sms_challenge(user_id, destination)
            .await
    }

    /// Request the login SMS again for a pending 2FA login
    pub async fn resend_login_sms(&self, preauth_token: &str) -> Result<()> {
        let claims = self
            .tokens
            .parse_preauth(preauth_token, PreAuthStage::AwaitingTwoFactor)?;
        let user_id = claims.user_id()?;
        let settings = self.identity.settings(user_id).await?;
        let destination = settings
            .sms_auth_destination
            .ok_or_else(|| Error::InvalidInput("SMS auth is not configured".to_string()))?;
        self.two_factor
            .request_sms_challenge(user_id, &destination)
            .await
    }

    /// Store a phone number once the user echoed the code sent to it
    pub async fn enable_sms(
        &self,
        user_id: UserId,
        destination: &str,
        code: &str,
    ) -> Result<UserSettings> {
        self.two_factor.verify_sms(destination, code).await?;

        let mut settings = self.identity.settings(user_id).await?;
        settings.sms_auth_destination = Some(destination.to_string());
        if settings.primary_two_factor.is_none() {
            settings.primary_two_factor = Some(TwoFactorMethod::Sms);
        }
        self.identity.save_settings(&settings).await?;
        self.activity
            .record(user_id, ActivityKind::TwoFactorChanged, None)
            .await;
        Ok(settings)
    }

    /// Choose which configured method is challenged at login
    pub async fn set_primary_two_factor(
        &self,
        user_id: UserId,
        method: TwoFactorMethod,
        code: &str,
    ) -> Result<UserSettings> {
        let mut settings = self.identity.settings(user_id).await?;
        self.two_factor.verify(&settings, method, code).await?;
        settings.set_primary(method)?;
        self.identity.save_settings(&settings).await?;
        Ok(settings)
    }

    /// Remove a method after checking a code for it
    pub async fn disable_two_factor(
        &self,
        user_id: UserId,
        method: TwoFactorMethod,
        code: &str,
    ) -> Result<UserSettings> {
        let mut settings = self.identity.settings(user_id).await?;
        self.two_factor.verify(&settings, method, code).await?;

        match method {
            TwoFactorMethod::GoogleAuth => settings.google_auth_secret = None,
            TwoFactorMethod::Sms => settings.sms_auth_destination = None,
        }
        if settings.primary_two_factor == Some(method) {
            let other = match method {
                TwoFactorMethod::GoogleAuth => TwoFactorMethod::Sms,
                TwoFactorMethod::Sms => TwoFactorMethod::GoogleAuth,
            };
            settings.primary_two_factor = settings.is_configured(other).then_some(other);
        }
        self.identity.save_settings(&settings).await?;
        self.activity
            .record(user_id, ActivityKind::TwoFactorChanged, None)
            .await;
        Ok(settings)
    }

    /// Apply a partial settings update
    pub async fn update_settings(
        &self,
        user_id: UserId,
        update: SettingsUpdate,
    ) -> Result<UserSettings> {
        let mut settings = self.identity.settings(user_id).await?;

        if let Some(code) = update.anti_phishing_code {
            if let Some(code) = &code {
                let valid = (4..=20).contains(&code.chars().count())
                    && code.chars().all(|c| c.is_ascii_alphanumeric());
                if !valid {
                    return Err(Error::InvalidInput(
                        "Anti-phishing code must be 4 to 20 letters or digits".to_string(),
                    ));
                }
            }
            settings.anti_phishing_code = code;
        }
        if let Some(detect) = update.detect_ip_change {
            settings.detect_ip_change = detect;
        }
        if let Some(layout) = update.selected_layout {
            settings.selected_layout = Some(layout);
        }
        if let Some(native) = update.fees_paid_with_native {
            settings.fees_paid_with_native = native;
        }

        self.identity.save_settings(&settings).await?;
        Ok(settings)
    }

    /// Set the trade password, authorized by the account password
    pub async fn set_trade_password(
        &self,
        user_id: UserId,
        account_password: &str,
        trade_password: &str,
    ) -> Result<()> {
        let user = self.identity.get(user_id).await?;
        if !password::verify_password(&user.password_hash, account_password) {
            return Err(Error::InvalidInput("Current password is incorrect".to_string()));
        }
        password::check_policy(trade_password)?;

        let mut settings = self.identity.settings(user_id).await?;
        settings.trade_password_hash = Some(password::hash_password(trade_password)?);
        self.identity.save_settings(&settings).await?;
        Ok(())
    }

    /// Check the trade password; users without one pass
    pub async fn verify_trade_password(
        &self,
        user_id: UserId,
        trade_password: Option<&str>,
    ) -> Result<()> {
        let settings = self.identity.settings(user_id).await?;
        let Some(hash) = settings.trade_password_hash else {
            return Ok(());
        };
        match trade_password {
            Some(candidate) if password::verify_password(&hash, candidate) => Ok(()),
            _ => Err(Error::AccessDenied("Invalid trade password".to_string())),
        }
    }
}

/// Approves the IP referenced by a confirm-ip action
pub struct IpConfirmation {
    repo: Arc<dyn UserRepository>,
}

impl IpConfirmation {
    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ActionEffect for IpConfirmation {
    async fn apply(&self, action: &Action) -> Result<()> {
        let ip = action
            .data
            .get("ip")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Internal("action has no ip".to_string()))?;
        if !self.repo.approve_ip(action.user_id, ip).await? {
            return Err(Error::NotFound("IP address not found".to_string()));
        }
        info!("IP {} approved for user {}", ip, action.user_id);
        Ok(())
    }
}
