//! User identity, settings and IP approvals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::UserId;
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// Well-known role aliases
pub mod roles {
    /// Regular exchange user
    pub const MEMBER: &str = "member";
    /// Back-office administrator
    pub const ADMIN: &str = "admin";
    /// Internal system user (market makers, bots); not allowed in the user UI
    pub const SYSTEM: &str = "system";
}

/// Lifecycle of a user record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// Registered, email not confirmed yet
    Pending,
    Active,
    Blocked,
    /// Soft-deleted; users are never physically removed
    Removed,
}

impl UserStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Active => "active",
            UserStatus::Blocked => "blocked",
            UserStatus::Removed => "removed",
        }
    }

    /// Parse the database representation
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(UserStatus::Pending),
            "active" => Ok(UserStatus::Active),
            "blocked" => Ok(UserStatus::Blocked),
            "removed" => Ok(UserStatus::Removed),
            other => Err(Error::Internal(format!("Unknown user status: {}", other))),
        }
    }
}

/// User model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct User {
    /// Unique user ID
    pub id: UserId,
    /// Login email (unique)
    pub email: String,
    /// Optional phone number
    pub phone: Option<String>,
    /// Salted slow hash of the password
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// Role alias used for permission lookups
    pub role: String,
    /// Current status
    pub status: UserStatus,
    /// Whether the exchange may send email to this user
    pub email_send_allowed: bool,
    /// Reference at the KYC provider
    pub kyc_reference: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Second-factor method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorMethod {
    GoogleAuth,
    Sms,
}

/// Per-user mutable options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct UserSettings {
    /// Owner
    pub user_id: UserId,
    /// Base32 TOTP secret
    #[serde(skip_serializing, default)]
    pub google_auth_secret: Option<String>,
    /// Phone number codes are sent to
    pub sms_auth_destination: Option<String>,
    /// The 2FA method challenged at login; both may be configured but only one is primary
    pub primary_two_factor: Option<TwoFactorMethod>,
    /// Code included in every email so users can spot phishing
    pub anti_phishing_code: Option<String>,
    /// Require confirmation when logging in from an unseen IP
    pub detect_ip_change: bool,
    /// Hash of the trade password
    #[serde(skip_serializing, default)]
    pub trade_password_hash: Option<String>,
    /// Selected UI layout
    pub selected_layout: Option<String>,
    /// Pay trading fees with the native token
    pub fees_paid_with_native: bool,
}

impl UserSettings {
    /// Default settings for a new user
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    /// Whether the given method has its material configured
    pub fn is_configured(&self, method: TwoFactorMethod) -> bool {
        match method {
            TwoFactorMethod::GoogleAuth => self.google_auth_secret.is_some(),
            TwoFactorMethod::Sms => self.sms_auth_destination.is_some(),
        }
    }

    /// Make a configured method the primary one
    pub fn set_primary(&mut self, method: TwoFactorMethod) -> Result<()> {
        if !self.is_configured(method) {
            return Err(Error::InvalidInput(format!("{:?} is not configured", method)));
        }
        self.primary_two_factor = Some(method);
        Ok(())
    }
}

/// Status of an (user, ip) tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStatus {
    Pending,
    Approved,
}

/// An IP address seen for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpApproval {
    pub user_id: UserId,
    pub ip: String,
    pub status: IpStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_requires_configuration() {
        let mut settings = UserSettings::new(1);
        assert!(settings.set_primary(TwoFactorMethod::GoogleAuth).is_err());

        settings.google_auth_secret = Some("JBSWY3DPEHPK3PXP".to_string());
        settings.sms_auth_destination = Some("+100000000".to_string());
        settings.set_primary(TwoFactorMethod::GoogleAuth).unwrap();
        settings.set_primary(TwoFactorMethod::Sms).unwrap();
        assert_eq!(settings.primary_two_factor, Some(TwoFactorMethod::Sms));
    }
}
