//! Configuration for the account service

use std::collections::HashMap;
use std::env;

use common::decimal::Decimal;
use common::model::withdraw::ExternalSystem;
use rust_decimal_macros::dec;

/// Configuration for the account service
#[derive(Debug, Clone)]
pub struct AccountServiceConfig {
    /// Database URL; in-memory storage is used when unset
    pub database_url: Option<String>,
    /// Database connection pool size
    pub db_pool_size: u32,
    /// How long a pending withdrawal may wait for its approval keys
    pub approval_window_minutes: i64,
    /// Rolling 24h withdrawal limit per external system, in BTC
    pub withdraw_limits_btc: HashMap<ExternalSystem, Decimal>,
    /// Sub-accounts a user may create besides the main one
    pub max_user_sub_accounts: usize,
    /// Custody signer endpoint; an in-memory signer is used when unset
    pub custody_url: Option<String>,
}

impl Default for AccountServiceConfig {
    fn default() -> Self {
        let mut withdraw_limits_btc = HashMap::new();
        withdraw_limits_btc.insert(
            ExternalSystem::InternalCustody,
            env_decimal("WITHDRAW_LIMIT_BTC_CUSTODY", dec!(2)),
        );
        withdraw_limits_btc.insert(
            ExternalSystem::ProviderA,
            env_decimal("WITHDRAW_LIMIT_BTC_PROVIDER_A", dec!(1)),
        );
        withdraw_limits_btc.insert(
            ExternalSystem::ProviderB,
            env_decimal("WITHDRAW_LIMIT_BTC_PROVIDER_B", dec!(1)),
        );

        Self {
            database_url: env::var("DATABASE_URL").ok(),
            db_pool_size: env::var("DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            approval_window_minutes: env::var("WITHDRAW_APPROVAL_WINDOW_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            withdraw_limits_btc,
            max_user_sub_accounts: env::var("MAX_USER_SUB_ACCOUNTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            custody_url: env::var("CUSTODY_URL").ok(),
        }
    }
}

impl AccountServiceConfig {
    /// Create a new configuration using environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// The 24h limit for a system; systems without one are unlimited
    pub fn limit_for(&self, system: ExternalSystem) -> Option<Decimal> {
        self.withdraw_limits_btc.get(&system).copied()
    }
}

fn env_decimal(name: &str, default: Decimal) -> Decimal {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
