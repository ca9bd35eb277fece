//! Role permissions
//!
//! Roles are loaded once at startup into a [`PermissionCache`]; every gated
//! operation checks `(role, permission)` against it.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use common::error::{Error, Result};
use common::model::user::roles;
use tracing::info;

/// Permission aliases checked by endpoints
pub mod perms {
    pub const PROFILE: &str = "profile";
    pub const ORDERS_READ: &str = "orders.read";
    pub const ORDERS_WRITE: &str = "orders.write";
    pub const WALLETS_READ: &str = "wallets.read";
    pub const WITHDRAW: &str = "wallets.withdraw";
    pub const TRANSFER: &str = "wallets.transfer";
    pub const API_KEYS: &str = "api_keys.manage";
    pub const SUB_ACCOUNTS: &str = "sub_accounts.manage";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const ADMIN_WITHDRAWALS: &str = "admin.withdrawals";

    /// Everything a regular member can do
    pub const MEMBER: &[&str] = &[
        PROFILE,
        ORDERS_READ,
        ORDERS_WRITE,
        WALLETS_READ,
        WITHDRAW,
        TRANSFER,
        API_KEYS,
        SUB_ACCOUNTS,
        NOTIFICATIONS,
    ];
}

/// A role and what it may do
#[derive(Debug, Clone)]
pub struct Role {
    pub alias: String,
    /// Whether users with this role may log into the user UI
    pub ui_facing: bool,
    pub permissions: HashSet<String>,
}

impl Role {
    pub fn new(alias: &str, ui_facing: bool, permissions: &[&str]) -> Self {
        Self {
            alias: alias.to_string(),
            ui_facing,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Where role definitions come from
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn load_roles(&self) -> Result<Vec<Role>>;
}

/// Fixed role table
pub struct StaticRoleSource {
    roles: Vec<Role>,
}

impl StaticRoleSource {
    pub fn new(roles: Vec<Role>) -> Self {
        Self { roles }
    }

    /// member, admin and system roles
    pub fn defaults() -> Self {
        let mut admin: Vec<&str> = perms::MEMBER.to_vec();
        admin.push(perms::ADMIN_WITHDRAWALS);
        Self::new(vec![
            Role::new(roles::MEMBER, true, perms::MEMBER),
            Role::new(roles::ADMIN, true, &admin),
            Role::new(
                roles::SYSTEM,
                false,
                &[perms::PROFILE, perms::ORDERS_READ, perms::ORDERS_WRITE, perms::WALLETS_READ],
            ),
        ])
    }
}

#[async_trait]
impl RoleSource for StaticRoleSource {
    async fn load_roles(&self) -> Result<Vec<Role>> {
        Ok(self.roles.clone())
    }
}

/// Role permissions, loaded once and read on every request
#[derive(Debug, Default)]
pub struct PermissionCache {
    roles: RwLock<HashMap<String, Role>>,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache contents from a source
    pub async fn load(&self, source: &dyn RoleSource) -> Result<usize> {
        let loaded = source.load_roles().await?;
        let count = loaded.len();
        let mut roles = self.roles.write().unwrap_or_else(|e| e.into_inner());
        *roles = loaded.into_iter().map(|r| (r.alias.clone(), r)).collect();
        info!("Loaded {} roles into the permission cache", count);
        Ok(count)
    }

    /// Allow or deny `permission` for `role`
    pub fn check(&self, role: &str, permission: &str) -> Result<()> {
        let roles = self.roles.read().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = roles.get(role) else {
            return Err(Error::AccessDenied(format!("Unknown role: {}", role)));
        };
        if entry.permissions.contains(permission) {
            Ok(())
        } else {
            Err(Error::AccessDenied("Access denied".to_string()))
        }
    }

    /// Whether a role may use the user UI; unknown roles may not
    pub fn is_ui_role(&self, role: &str) -> bool {
        let roles = self.roles.read().unwrap_or_else(|e| e.into_inner());
        roles.get(role).map(|r| r.ui_facing).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_roles() {
        let cache = PermissionCache::new();
        cache.load(&StaticRoleSource::defaults()).await.unwrap();

        assert!(cache.check(roles::MEMBER, perms::WITHDRAW).is_ok());
        assert!(cache.check(roles::MEMBER, perms::ADMIN_WITHDRAWALS).is_err());
        assert!(cache.check(roles::ADMIN, perms::ADMIN_WITHDRAWALS).is_ok());
        assert!(cache.check(roles::SYSTEM, perms::WITHDRAW).is_err());

        let err = cache.check("ghost", perms::PROFILE).unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::AccessDenied);

        assert!(cache.is_ui_role(roles::MEMBER));
        assert!(!cache.is_ui_role(roles::SYSTEM));
    }
}
