//! Sub-account models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{SubAccountId, UserId};
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// Title of the sub-account created for every user
pub const MAIN_TITLE: &str = "main";

/// Title of the first user-facing sub-account created at registration
pub const FIRST_TITLE: &str = "first";

/// Account group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum AccountGroup {
    Main,
}

/// Market type a sub-account trades in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
}

/// Sub-account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SubAccountStatus {
    Active,
    Disabled,
}

/// A labelled partition of a user's funds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct SubAccount {
    pub id: SubAccountId,
    pub user_id: UserId,
    pub account_group: AccountGroup,
    pub market_type: MarketType,
    pub title: String,
    pub deposit_allowed: bool,
    pub withdrawal_allowed: bool,
    pub transfer_allowed: bool,
    pub is_default: bool,
    pub is_main: bool,
    pub status: SubAccountStatus,
    pub created_at: DateTime<Utc>,
}

impl SubAccount {
    /// Whether the sub-account can be used at all
    pub fn is_active(&self) -> bool {
        self.status == SubAccountStatus::Active
    }
}
