//! Feature-flag port
//!
//! Toggles are read through [`FeatureFlags`] so the core never reaches for
//! global state. The name-space is flat; contexts allow per-user overrides.

use dashmap::DashMap;

use crate::model::order::{OrderType, Side};
use crate::model::UserId;

/// Well-known flag names
pub mod flags {
    /// Captcha validation is skipped entirely
    pub const CAPTCHA_DISABLED: &str = "captcha.disabled";
    /// Session tokens are accepted on signature alone, without the revocation lookup
    pub const SESSION_CHECK_DISABLED: &str = "auth.session_check.disabled";
    /// Non UI-facing roles may use the user UI
    pub const NON_UI_ROLES_ALLOWED: &str = "auth.non_ui_roles.allowed";
    /// Report already-filled cancels as 202 instead of success
    pub const CANCEL_FILLED_AS_202: &str = "orders.cancel.filled_as_202";
    /// Report already-cancelled cancels as 208 instead of success
    pub const CANCEL_CANCELLED_AS_208: &str = "orders.cancel.cancelled_as_208";
    /// Prefix of order-type flags; these default to enabled
    pub const ORDER_TYPE_PREFIX: &str = "order_type.";

    use crate::model::order::{OrderType, Side};

    /// Global toggle for an order type
    pub fn order_type(order_type: OrderType) -> String {
        format!("{}{}", ORDER_TYPE_PREFIX, order_type)
    }

    /// Toggle for (market, type, side)
    pub fn market_order_type(market: &str, order_type: OrderType, side: Side) -> String {
        format!("{}{}.{}.{}", ORDER_TYPE_PREFIX, market, order_type, side.as_str())
    }
}

/// Evaluation context for a flag
#[derive(Debug, Clone, Default)]
pub struct FlagContext {
    pub user_id: Option<UserId>,
    pub market: Option<String>,
    pub order_type: Option<OrderType>,
    pub side: Option<Side>,
}

impl FlagContext {
    /// Context scoped to a user
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }
}

/// Feature-flag predicate
pub trait FeatureFlags: Send + Sync {
    /// Whether `name` is enabled in `ctx`
    fn is_enabled(&self, name: &str, ctx: &FlagContext) -> bool;
}

/// Flags held in memory, seeded at startup and changeable at runtime
#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    values: DashMap<String, bool>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a flag globally
    pub fn set(&self, name: &str, enabled: bool) {
        self.values.insert(name.to_string(), enabled);
    }

    /// Override a flag for a single user
    pub fn set_for_user(&self, name: &str, user_id: UserId, enabled: bool) {
        self.values.insert(user_key(name, user_id), enabled);
    }

    fn default_for(name: &str) -> bool {
        name.starts_with(flags::ORDER_TYPE_PREFIX)
    }
}

fn user_key(name: &str, user_id: UserId) -> String {
    format!("{}#{}", name, user_id)
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled(&self, name: &str, ctx: &FlagContext) -> bool {
        if let Some(user_id) = ctx.user_id {
            if let Some(value) = self.values.get(&user_key(name, user_id)) {
                return *value;
            }
        }
        self.values
            .get(name)
            .map(|v| *v)
            .unwrap_or_else(|| Self::default_for(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_type_flags_default_on_others_off() {
        let f = StaticFeatureFlags::new();
        let ctx = FlagContext::default();
        assert!(f.is_enabled(&flags::order_type(OrderType::Oco), &ctx));
        assert!(!f.is_enabled(flags::CAPTCHA_DISABLED, &ctx));
    }

    #[test]
    fn user_override_wins() {
        let f = StaticFeatureFlags::new();
        f.set(flags::CAPTCHA_DISABLED, false);
        f.set_for_user(flags::CAPTCHA_DISABLED, 7, true);
        assert!(f.is_enabled(flags::CAPTCHA_DISABLED, &FlagContext::user(7)));
        assert!(!f.is_enabled(flags::CAPTCHA_DISABLED, &FlagContext::user(8)));
    }
}
