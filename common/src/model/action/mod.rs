//! Two-key email approvals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::UserId;
#[cfg(feature = "utoipa")]
use crate::utoipa::ToSchema;

/// What an action approves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    ConfirmIp,
    ApiKey,
    ApiKeyV2,
    Withdraw,
}

impl ActionType {
    /// Human label used in email subjects
    pub fn label(&self) -> &'static str {
        match self {
            ActionType::ConfirmIp => "New IP address confirmation",
            ActionType::ApiKey | ActionType::ApiKeyV2 => "API key activation",
            ActionType::Withdraw => "Withdrawal confirmation",
        }
    }
}

/// Action status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
}

/// Which of the two approval keys was presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalKey {
    A,
    B,
}

/// A pending two-stage approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub user_id: UserId,
    pub action_type: ActionType,
    /// Type-specific payload (ip, api key id, withdraw request id)
    pub data: serde_json::Value,
    pub status: ActionStatus,
    #[serde(skip_serializing, default)]
    pub key_a: String,
    #[serde(skip_serializing, default)]
    pub key_b: String,
    pub key_a_used: bool,
    pub key_b_used: bool,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Action {
    /// Match a presented key against this action's keys
    pub fn which_key(&self, presented: &str) -> Option<ApprovalKey> {
        if constant_time_eq(self.key_a.as_bytes(), presented.as_bytes()) {
            Some(ApprovalKey::A)
        } else if constant_time_eq(self.key_b.as_bytes(), presented.as_bytes()) {
            Some(ApprovalKey::B)
        } else {
            None
        }
    }

    /// Both keys consumed
    pub fn both_keys_used(&self) -> bool {
        self.key_a_used && self.key_b_used
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
