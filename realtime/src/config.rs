//! Configuration for the realtime fan-out

use std::env;
use std::time::Duration;

/// Tick intervals and limits of the publishers and dispatchers
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub balance_tick: Duration,
    pub order_update_tick: Duration,
    pub prune_tick: Duration,
    pub ticker_tick: Duration,
    pub depth_tick: Duration,
    pub trades_tick: Duration,
    pub coins_tick: Duration,
    /// Levels per side on depth channels
    pub depth_limit: usize,
    /// Trades per message on trade channels
    pub trades_limit: usize,
    /// Users not seen for this long are dropped from the liveness map
    pub liveness_window: Duration,
    /// Messages buffered per subscriber before new ones are dropped
    pub subscriber_queue: usize,
    /// A subscription must be renewed within this period
    pub subscription_lifetime: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            balance_tick: env_millis("REALTIME_BALANCE_TICK_MS", 300),
            order_update_tick: env_millis("REALTIME_ORDER_TICK_MS", 500),
            prune_tick: env_millis("REALTIME_PRUNE_TICK_MS", 1_000),
            ticker_tick: env_millis("REALTIME_TICKER_TICK_MS", 3_000),
            depth_tick: env_millis("REALTIME_DEPTH_TICK_MS", 1_000),
            trades_tick: env_millis("REALTIME_TRADES_TICK_MS", 1_000),
            coins_tick: env_millis("REALTIME_COINS_TICK_MS", 1_000),
            depth_limit: env_usize("REALTIME_DEPTH_LIMIT", 50),
            trades_limit: env_usize("REALTIME_TRADES_LIMIT", 50),
            liveness_window: env_millis("REALTIME_LIVENESS_WINDOW_MS", 15_000),
            subscriber_queue: env_usize("REALTIME_SUBSCRIBER_QUEUE", 256),
            subscription_lifetime: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RealtimeConfig {
    /// Create a new configuration using environment variables
    pub fn from_env() -> Self {
        Self::default()
    }
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(
        env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
