//! Notification center
//!
//! Keeps the notifications of every user and pushes each new one on
//! `user:notifications#<user>` together with the unread count. New
//! notifications are normally queued through the [`NotificationDispatcher`]
//! pool rather than delivered inline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::error::{Error, Result};
use common::model::notification::Notification;
use common::model::UserId;
use common::pool::{JobHandler, WorkerPool};
use dashmap::DashMap;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::channel::{Channel, ChannelKind};
use crate::hub::Hub;

/// A notification to create
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: UserId,
    pub title: String,
    pub body: String,
}

impl NewNotification {
    pub fn new(user_id: UserId, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            user_id,
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Pool that creates notifications off the request path
pub type NotificationDispatcher = WorkerPool<NewNotification>;

pub struct NotificationCenter {
    by_user: DashMap<UserId, Vec<Notification>>,
    hub: Arc<Hub>,
}

impl NotificationCenter {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            by_user: DashMap::new(),
            hub,
        }
    }

    /// Spawn the dispatcher pool feeding this center
    pub fn dispatcher(self: &Arc<Self>, workers: usize, capacity: usize) -> NotificationDispatcher {
        WorkerPool::spawn("notifications", self.clone(), workers, capacity)
    }

    /// Store a notification and push it to the user's channel
    pub fn notify(&self, new: NewNotification) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            title: new.title,
            body: new.body,
            read: false,
            created_at: Utc::now(),
        };
        self.by_user
            .entry(notification.user_id)
            .or_default()
            .push(notification.clone());

        let unread = self.unread_count(notification.user_id);
        let channel = Channel::user(ChannelKind::Notifications, notification.user_id, None);
        let delivered = self.hub.publish(
            &channel,
            json!({ "notification": notification, "unread": unread }),
        );
        debug!(user_id = notification.user_id, delivered, "notification created");
        notification
    }

    /// Newest first, with the total count
    pub fn list(&self, user_id: UserId, page: usize, limit: usize) -> (Vec<Notification>, usize) {
        let mut all: Vec<Notification> = self
            .by_user
            .get(&user_id)
            .map(|n| n.clone())
            .unwrap_or_default();
        // Stored in creation order
        all.reverse();
        let total = all.len();
        let limit = limit.max(1);
        let page = all
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(limit))
            .take(limit)
            .collect();
        (page, total)
    }

    pub fn unread_count(&self, user_id: UserId) -> usize {
        self.by_user
            .get(&user_id)
            .map_or(0, |n| n.iter().filter(|n| !n.read).count())
    }

    pub fn mark_read(&self, user_id: UserId, id: Uuid) -> Result<Notification> {
        let mut notifications = self
            .by_user
            .get_mut(&user_id)
            .ok_or_else(not_found)?;
        let notification = notifications
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(not_found)?;
        notification.read = true;
        Ok(notification.clone())
    }

    /// Mark everything read, returning how many changed
    pub fn mark_all_read(&self, user_id: UserId) -> usize {
        self.by_user.get_mut(&user_id).map_or(0, |mut notifications| {
            notifications
                .iter_mut()
                .filter(|n| !n.read)
                .map(|n| n.read = true)
                .count()
        })
    }
}

fn not_found() -> Error {
    Error::NotFound("Notification not found".to_string())
}

#[async_trait]
impl JobHandler<NewNotification> for NotificationCenter {
    async fn handle(&self, job: NewNotification) -> Result<()> {
        self.notify(job);
        Ok(())
    }
}
