//! Authenticated principal attached to every request

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::api_key::{ApiKeyCapabilities, Capability};
use crate::model::{ApiKeyId, UserId};

/// Access level granted by the key material that was presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAccess {
    ReadOnly,
    Write,
}

/// API key details for principals authenticated by key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyGrant {
    pub key_id: ApiKeyId,
    pub access: KeyAccess,
    pub capabilities: ApiKeyCapabilities,
}

/// Who is making the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub role: String,
    /// Set when authenticated by API key rather than bearer token
    pub api_key: Option<ApiKeyGrant>,
}

impl Principal {
    /// Principal authenticated with a session token
    pub fn session(user_id: UserId, role: impl Into<String>) -> Self {
        Self {
            user_id,
            role: role.into(),
            api_key: None,
        }
    }

    pub fn is_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Reject read-only keys on mutating endpoints
    pub fn require_write(&self) -> Result<()> {
        match &self.api_key {
            Some(grant) if grant.access == KeyAccess::ReadOnly => Err(Error::AccessDenied(
                "API key is read-only".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Enforce an endpoint capability marker; session principals always pass
    pub fn require_capability(&self, capability: Capability) -> Result<()> {
        match &self.api_key {
            Some(grant) if !grant.capabilities.allows(capability) => Err(Error::AccessDenied(
                format!("API key does not allow {}", capability.as_str()),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_keys_cannot_write() {
        let principal = Principal {
            user_id: 1,
            role: "member".to_string(),
            api_key: Some(ApiKeyGrant {
                key_id: 1,
                access: KeyAccess::ReadOnly,
                capabilities: ApiKeyCapabilities::all(),
            }),
        };
        assert!(principal.require_write().is_err());
        assert!(Principal::session(1, "member").require_write().is_ok());
    }

    #[test]
    fn capability_flags_are_enforced_for_keys_only() {
        let principal = Principal {
            user_id: 1,
            role: "member".to_string(),
            api_key: Some(ApiKeyGrant {
                key_id: 1,
                access: KeyAccess::Write,
                capabilities: ApiKeyCapabilities {
                    trading: true,
                    ..Default::default()
                },
            }),
        };
        assert!(principal.require_capability(Capability::Trading).is_ok());
        assert!(principal.require_capability(Capability::Withdrawal).is_err());
        assert!(Principal::session(1, "member")
            .require_capability(Capability::Withdrawal)
            .is_ok());
    }
}
