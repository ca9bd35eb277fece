//! API key models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ApiKeyId, UserId};
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// Key generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyVersion {
    /// Single secret, full access of the owner's role
    V1,
    /// Public/private pair with capability flags and IP allow-list
    V2,
}

/// Key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    /// Waiting for email approval
    Pending,
    Active,
    Disabled,
}

/// Capability flags of a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct ApiKeyCapabilities {
    #[serde(default)]
    pub trading: bool,
    #[serde(default)]
    pub withdrawal: bool,
    #[serde(default)]
    pub margin: bool,
    #[serde(default)]
    pub future: bool,
}

impl ApiKeyCapabilities {
    /// All capabilities enabled (v1 keys)
    pub fn all() -> Self {
        Self {
            trading: true,
            withdrawal: true,
            margin: true,
            future: true,
        }
    }

    /// Look up a capability by its endpoint marker
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Trading => self.trading,
            Capability::Withdrawal => self.withdrawal,
            Capability::Margin => self.margin,
            Capability::Future => self.future,
        }
    }
}

/// Endpoint capability markers (`trading_allowed`, `withdrawal_allowed`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Trading,
    Withdrawal,
    Margin,
    Future,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Trading => "trading",
            Capability::Withdrawal => "withdrawal",
            Capability::Margin => "margin",
            Capability::Future => "future",
        }
    }
}

/// API key record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub user_id: UserId,
    pub version: ApiKeyVersion,
    /// Public part, shown in listings
    pub public_key: String,
    /// SHA-256 of the private part
    #[serde(skip_serializing, default)]
    pub private_key_hash: String,
    /// Role alias the key acts with
    pub role: String,
    pub capabilities: ApiKeyCapabilities,
    /// Empty means any IP is accepted
    pub allowed_ips: Vec<String>,
    pub status: ApiKeyStatus,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Whether a request from `ip` may use this key
    pub fn ip_allowed(&self, ip: &str) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|allowed| allowed == ip)
    }
}
