//! Background dispatchers
//!
//! Every periodic job implements [`Periodic`] and runs on its own task. All
//! tasks watch one shutdown signal; on shutdown each runs a final tick and
//! exits, and [`DispatcherHandle::shutdown`] returns only once every task has
//! finished, so nothing publishes afterwards. A panicking tick is logged like
//! a failed one.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use account_service::LedgerService;
use async_trait::async_trait;
use auth_service::TokenService;
use chrono::Utc;
use common::cache::{ActivityTracker, DirtyBalances};
use common::error::Result;
use common::model::order::Order;
use common::model::{SubAccountId, UserId};
use futures::FutureExt;
use order_service::OrderUpdateCache;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::channel::{Channel, ChannelKind, KindTag};
use crate::hub::Hub;

/// A job run on a fixed interval
#[async_trait]
pub trait Periodic: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn tick(&self) -> Result<()>;
}

/// Running dispatchers
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl DispatcherHandle {
    pub fn tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every task and wait for their final tick
    pub async fn shutdown(mut self) {
        info!(tasks = self.tasks.len(), "stopping dispatchers");
        let _ = self.shutdown.send(true);
        while let Some(finished) = self.tasks.join_next().await {
            if let Err(e) = finished {
                error!("dispatcher task ended abnormally: {}", e);
            }
        }
        info!("dispatchers stopped");
    }
}

async fn run_tick(job: &dyn Periodic) {
    // A failed or panicking tick is logged and the dispatcher keeps going
    match AssertUnwindSafe(job.tick()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(dispatcher = job.name(), "tick failed: {}", e),
        Err(_) => error!(dispatcher = job.name(), "tick panicked"),
    }
}

/// Spawn each job on the current runtime
pub fn spawn_all(jobs: Vec<(Arc<dyn Periodic>, Duration)>) -> DispatcherHandle {
    let (shutdown, _) = watch::channel(false);
    let mut tasks = JoinSet::new();

    for (job, period) in jobs {
        let mut signal = shutdown.subscribe();
        tasks.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(dispatcher = job.name(), ?period, "dispatcher started");
            loop {
                tokio::select! {
                    _ = interval.tick() => run_tick(job.as_ref()).await,
                    _ = signal.changed() => break,
                }
            }
            run_tick(job.as_ref()).await;
            debug!(dispatcher = job.name(), "dispatcher finished");
        });
    }

    DispatcherHandle { shutdown, tasks }
}

/// Publishes balances of every dirty (user, sub-account)
pub struct BalanceCoalescer {
    dirty: Arc<DirtyBalances>,
    ledger: Arc<LedgerService>,
    hub: Arc<Hub>,
}

impl BalanceCoalescer {
    pub fn new(dirty: Arc<DirtyBalances>, ledger: Arc<LedgerService>, hub: Arc<Hub>) -> Self {
        Self { dirty, ledger, hub }
    }
}

#[async_trait]
impl Periodic for BalanceCoalescer {
    fn name(&self) -> &'static str {
        "balances"
    }

    async fn tick(&self) -> Result<()> {
        for (user_id, sub_account_id) in self.dirty.drain() {
            let targets = [
                Channel::user(ChannelKind::Balances, user_id, Some(sub_account_id)),
                Channel::user(ChannelKind::Balances, user_id, None),
            ];
            if !targets.iter().any(|c| self.hub.has_subscribers(c)) {
                continue;
            }
            let balances = match self.ledger.balances_for(user_id, sub_account_id).await {
                Ok(balances) => balances,
                Err(e) => {
                    error!(user_id, sub_account_id, "balance read failed: {}", e);
                    continue;
                }
            };
            let data = serde_json::to_value(&balances)?;
            for channel in &targets {
                self.hub.publish(channel, data.clone());
            }
        }
        Ok(())
    }
}

/// Publishes buffered order deltas to order channels
pub struct OrderUpdateCoalescer {
    updates: Arc<OrderUpdateCache>,
    hub: Arc<Hub>,
}

impl OrderUpdateCoalescer {
    pub fn new(updates: Arc<OrderUpdateCache>, hub: Arc<Hub>) -> Self {
        Self { updates, hub }
    }
}

#[async_trait]
impl Periodic for OrderUpdateCoalescer {
    fn name(&self) -> &'static str {
        "order-updates"
    }

    async fn tick(&self) -> Result<()> {
        let channels: Vec<Channel> = self
            .hub
            .subscribed(KindTag::OrderUpdate)
            .into_iter()
            .chain(self.hub.subscribed(KindTag::Orders))
            .collect();
        let users: HashSet<UserId> = channels.iter().filter_map(|c| c.user_id).collect();
        let discarded = self.updates.discard_except(&users);
        if discarded > 0 {
            debug!(discarded, "order deltas without listeners dropped");
        }

        for user_id in users {
            let orders = self.updates.drain_user(user_id);
            if orders.is_empty() {
                continue;
            }
            let mut by_sub: HashMap<SubAccountId, Vec<&Order>> = HashMap::new();
            for order in &orders {
                by_sub.entry(order.sub_account_id).or_default().push(order);
            }
            for channel in channels.iter().filter(|c| c.user_id == Some(user_id)) {
                let data = match channel.sub_account_id {
                    Some(sub) => match by_sub.get(&sub) {
                        Some(orders) => serde_json::to_value(orders)?,
                        None => continue,
                    },
                    None => serde_json::to_value(&orders)?,
                };
                self.hub.publish(channel, data);
            }
        }
        Ok(())
    }
}

/// Drops stale liveness entries, expired subscriptions and expired sessions
pub struct ActivityPruner {
    activity: Arc<ActivityTracker>,
    hub: Arc<Hub>,
    tokens: Option<Arc<TokenService>>,
    window: chrono::Duration,
}

impl ActivityPruner {
    pub fn new(activity: Arc<ActivityTracker>, hub: Arc<Hub>, window: Duration) -> Self {
        Self {
            activity,
            hub,
            tokens: None,
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(15)),
        }
    }

    /// Also prune the live-session cache of `tokens`
    pub fn with_sessions(mut self, tokens: Arc<TokenService>) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

#[async_trait]
impl Periodic for ActivityPruner {
    fn name(&self) -> &'static str {
        "activity"
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let pruned = self.activity.prune_older_than(now - self.window);
        if pruned > 0 {
            debug!(pruned, online = self.activity.online_count(), "inactive users pruned");
        }
        self.hub.prune_expired(now);
        if let Some(tokens) = &self.tokens {
            let expired = tokens.sessions().prune_expired(now);
            if expired > 0 {
                debug!(expired, "expired sessions pruned");
            }
        }
        Ok(())
    }
}
