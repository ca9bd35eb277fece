//! Realtime fan-out: channel names, the subscription hub, public market
//! publishers, the notification center and the background dispatchers

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod hub;
pub mod notifications;
pub mod pollers;
pub mod stats;

use std::sync::Arc;

use account_service::{LedgerService, RateSource};
use auth_service::TokenService;
use chrono::Duration;
use common::cache::{ActivityTracker, DirtyBalances};
use order_service::{OrderEngine, OrderUpdateCache};

pub use channel::{Channel, ChannelKind, KindTag, Scope};
pub use config::RealtimeConfig;
pub use dispatch::{
    spawn_all, ActivityPruner, BalanceCoalescer, DispatcherHandle, OrderUpdateCoalescer, Periodic,
};
pub use hub::{Hub, Push, SubscriberAuth, SubscriberId};
pub use notifications::{NewNotification, NotificationCenter, NotificationDispatcher};
pub use pollers::{CoinsValuePoller, DepthPoller, TickerPoller, TradesPoller};
pub use stats::{EngineMarketStats, MarketStats, MarketSummary, Tick};

/// What the publishers read from
pub struct RealtimeSources {
    pub ledger: Arc<LedgerService>,
    pub dirty: Arc<DirtyBalances>,
    pub activity: Arc<ActivityTracker>,
    pub engine: Arc<dyn OrderEngine>,
    pub updates: Arc<OrderUpdateCache>,
    pub rates: Arc<dyn RateSource>,
    pub stats: Arc<dyn MarketStats>,
    /// Session cache pruned alongside liveness
    pub tokens: Arc<TokenService>,
}

/// Every realtime component, wired together
pub struct RealtimeModule {
    pub config: RealtimeConfig,
    pub hub: Arc<Hub>,
    pub notifications: Arc<NotificationCenter>,
    pub notifier: NotificationDispatcher,
    sources: RealtimeSources,
}

impl RealtimeModule {
    /// Wire the hub and spawn the notification pool on the current runtime
    pub fn build(config: RealtimeConfig, auth: Arc<dyn SubscriberAuth>, sources: RealtimeSources) -> Self {
        let lifetime = Duration::from_std(config.subscription_lifetime)
            .unwrap_or_else(|_| Duration::hours(24));
        let hub = Arc::new(Hub::new(
            auth,
            sources.ledger.clone(),
            lifetime,
            config.subscriber_queue,
        ));
        let notifications = Arc::new(NotificationCenter::new(hub.clone()));
        let notifier = notifications.dispatcher(2, 1024);

        Self {
            config,
            hub,
            notifications,
            notifier,
            sources,
        }
    }

    /// Start the dispatchers and public publishers
    pub fn start(&self) -> DispatcherHandle {
        let c = &self.config;
        let s = &self.sources;
        let hub = &self.hub;
        let jobs: Vec<(Arc<dyn Periodic>, std::time::Duration)> = vec![
            (
                Arc::new(BalanceCoalescer::new(s.dirty.clone(), s.ledger.clone(), hub.clone())),
                c.balance_tick,
            ),
            (
                Arc::new(OrderUpdateCoalescer::new(s.updates.clone(), hub.clone())),
                c.order_update_tick,
            ),
            (
                Arc::new(
                    ActivityPruner::new(s.activity.clone(), hub.clone(), c.liveness_window)
                        .with_sessions(s.tokens.clone()),
                ),
                c.prune_tick,
            ),
            (
                Arc::new(TickerPoller::new(s.stats.clone(), hub.clone())),
                c.ticker_tick,
            ),
            (
                Arc::new(DepthPoller::new(s.engine.clone(), hub.clone(), c.depth_limit)),
                c.depth_tick,
            ),
            (
                Arc::new(TradesPoller::new(s.engine.clone(), hub.clone(), c.trades_limit)),
                c.trades_tick,
            ),
            (
                Arc::new(CoinsValuePoller::new(s.rates.clone(), hub.clone())),
                c.coins_tick,
            ),
        ];
        spawn_all(jobs)
    }
}
