//! Withdrawal request models

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Quantity;
use crate::error::Error;
use crate::model::{SubAccountId, UserId};
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// Downstream rail a withdrawal is sent through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ExternalSystem {
    /// On-chain custody signer
    #[default]
    InternalCustody,
    /// Fiat provider A
    ProviderA,
    /// Fiat provider B
    ProviderB,
}

impl ExternalSystem {
    /// Destination addresses are only validated for on-chain withdrawals
    pub fn is_on_chain(&self) -> bool {
        matches!(self, ExternalSystem::InternalCustody)
    }
}

impl FromStr for ExternalSystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal_custody" | "custody" => Ok(ExternalSystem::InternalCustody),
            "provider_a" => Ok(ExternalSystem::ProviderA),
            "provider_b" => Ok(ExternalSystem::ProviderB),
            other => Err(Error::InvalidInput(format!("Invalid external system: {}", other))),
        }
    }
}

/// Withdrawal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum WithdrawStatus {
    Pending,
    Approved,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WithdrawStatus {
    /// Amount + fee stays locked in these states
    pub fn holds_lock(&self) -> bool {
        matches!(
            self,
            WithdrawStatus::Pending | WithdrawStatus::Approved | WithdrawStatus::Processing
        )
    }

    /// Counts toward the rolling 24h limit
    pub fn counts_toward_limit(&self) -> bool {
        !matches!(self, WithdrawStatus::Cancelled | WithdrawStatus::Failed)
    }
}

/// A withdrawal request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
pub struct WithdrawRequest {
    pub id: Uuid,
    pub user_id: UserId,
    pub sub_account_id: SubAccountId,
    pub coin_symbol: String,
    /// Gross amount debited from the balance, fee included
    pub amount: Quantity,
    pub fee_amount: Quantity,
    pub destination: String,
    pub external_system: ExternalSystem,
    pub status: WithdrawStatus,
    /// Approval action guarding this request
    pub action_id: Option<Uuid>,
    /// Reference returned by the custody relay
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawRequest {
    /// Amount the destination receives
    pub fn net_amount(&self) -> Quantity {
        self.amount - self.fee_amount
    }
}
