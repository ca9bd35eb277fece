//! Subscription hub
//!
//! Connected clients get a bounded queue of [`Push`] messages. Subscribing to
//! a user channel authenticates with the same bearer token as REST and checks
//! that the token's user owns the channel. Subscriptions are indexed by
//! channel so dispatchers can find out who is listening.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use account_service::LedgerService;
use auth_service::AuthService;
use chrono::{DateTime, Duration, Utc};
use common::error::{Error, Result};
use common::model::UserId;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelKind, KindTag, Scope};

pub type SubscriberId = Uuid;

/// A message delivered to a subscriber
#[derive(Debug, Clone, Serialize)]
pub struct Push {
    pub channel: String,
    pub data: Value,
}

/// Resolves the bearer token a subscriber presents
pub trait SubscriberAuth: Send + Sync {
    fn authenticate(&self, token: &str, ip: &str) -> Result<UserId>;
}

impl SubscriberAuth for AuthService {
    fn authenticate(&self, token: &str, ip: &str) -> Result<UserId> {
        AuthService::authenticate(self, token, ip)?.user_id()
    }
}

struct Subscriber {
    tx: mpsc::Sender<Push>,
    /// Channel -> expiry of the subscription
    channels: HashMap<Channel, DateTime<Utc>>,
}

pub struct Hub {
    auth: Arc<dyn SubscriberAuth>,
    ledger: Arc<LedgerService>,
    subscribers: DashMap<SubscriberId, Subscriber>,
    by_channel: DashMap<Channel, HashSet<SubscriberId>>,
    lifetime: Duration,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(
        auth: Arc<dyn SubscriberAuth>,
        ledger: Arc<LedgerService>,
        lifetime: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            auth,
            ledger,
            subscribers: DashMap::new(),
            by_channel: DashMap::new(),
            lifetime,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a client and hand back its message queue
    pub fn connect(&self) -> (SubscriberId, mpsc::Receiver<Push>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                channels: HashMap::new(),
            },
        );
        debug!(subscriber = %id, "subscriber connected");
        (id, rx)
    }

    /// Drop a client and all its subscriptions
    pub fn disconnect(&self, id: SubscriberId) {
        let channels: Vec<Channel> = match self.subscribers.remove(&id) {
            Some((_, sub)) => sub.channels.into_keys().collect(),
            None => return,
        };
        for channel in channels {
            self.forget(&channel, id);
        }
        debug!(subscriber = %id, "subscriber disconnected");
    }

    fn forget(&self, channel: &Channel, id: SubscriberId) {
        let empty = match self.by_channel.get_mut(channel) {
            Some(mut ids) => {
                ids.remove(&id);
                ids.is_empty()
            }
            None => false,
        };
        if empty {
            self.by_channel.remove_if(channel, |_, ids| ids.is_empty());
        }
    }

    /// Subscribe, renewing the subscription when it already exists
    ///
    /// A token for another user removes the client from the channel and no
    /// snapshot is sent.
    pub async fn subscribe(
        &self,
        id: SubscriberId,
        channel: &str,
        token: Option<&str>,
        ip: &str,
    ) -> Result<Channel> {
        let channel: Channel = channel.parse()?;
        if !self.subscribers.contains_key(&id) {
            return Err(Error::NotFound("Subscriber is not connected".to_string()));
        }

        if channel.scope() == Scope::User {
            let token = token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::Unauthorized("Token is required".to_string()))?;
            let user_id = self.auth.authenticate(token, ip)?;
            if channel.user_id != Some(user_id) {
                self.unsubscribe(id, &channel);
                warn!(subscriber = %id, user_id, channel = %channel, "channel of another user refused");
                return Err(Error::AccessDenied("Channel belongs to another user".to_string()));
            }
        }

        let expires_at = Utc::now() + self.lifetime;
        if let Some(mut sub) = self.subscribers.get_mut(&id) {
            sub.channels.insert(channel.clone(), expires_at);
        }
        self.by_channel.entry(channel.clone()).or_default().insert(id);

        if let Err(e) = self.send_snapshot(id, &channel).await {
            self.unsubscribe(id, &channel);
            return Err(e);
        }
        debug!(subscriber = %id, channel = %channel, "subscribed");
        Ok(channel)
    }

    async fn send_snapshot(&self, id: SubscriberId, channel: &Channel) -> Result<()> {
        if channel.kind != ChannelKind::Balances {
            return Ok(());
        }
        let Some(user_id) = channel.user_id else {
            return Ok(());
        };
        let views = match channel.sub_account_id {
            Some(sub) => vec![self.ledger.owned_balances(user_id, sub).await?],
            None => self.ledger.all_balances(user_id).await?,
        };
        for view in views {
            self.deliver(id, channel, serde_json::to_value(&view)?);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, id: SubscriberId, channel: &Channel) -> bool {
        let removed = self
            .subscribers
            .get_mut(&id)
            .map(|mut sub| sub.channels.remove(channel).is_some())
            .unwrap_or(false);
        self.forget(channel, id);
        removed
    }

    fn deliver(&self, id: SubscriberId, channel: &Channel, data: Value) -> bool {
        let tx = match self.subscribers.get(&id) {
            Some(sub) => sub.tx.clone(),
            None => return false,
        };
        let push = Push {
            channel: channel.to_string(),
            data,
        };
        match tx.try_send(push) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %id, channel = %channel, "subscriber queue full, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.disconnect(id);
                false
            }
        }
    }

    /// Send to every subscriber of `channel`, returning how many got it
    pub fn publish(&self, channel: &Channel, data: Value) -> usize {
        let ids: Vec<SubscriberId> = match self.by_channel.get(channel) {
            Some(ids) => ids.iter().copied().collect(),
            None => return 0,
        };
        ids.into_iter()
            .filter(|id| self.deliver(*id, channel, data.clone()))
            .count()
    }

    pub fn has_subscribers(&self, channel: &Channel) -> bool {
        self.by_channel
            .get(channel)
            .map_or(false, |ids| !ids.is_empty())
    }

    /// Channels of a kind that currently have subscribers
    pub fn subscribed(&self, tag: KindTag) -> Vec<Channel> {
        self.by_channel
            .iter()
            .filter(|e| e.key().kind.tag() == tag && !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop subscriptions that were not renewed in time
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut expired = Vec::new();
        for mut sub in self.subscribers.iter_mut() {
            let id = *sub.key();
            sub.channels.retain(|channel, expires_at| {
                if *expires_at <= now {
                    expired.push((id, channel.clone()));
                    false
                } else {
                    true
                }
            });
        }
        for (id, channel) in &expired {
            self.forget(channel, *id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired subscriptions pruned");
        }
        expired.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
