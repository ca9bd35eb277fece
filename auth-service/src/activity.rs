//! Security activity log
//!
//! Logins, logouts and credential changes are recorded off the request path
//! through a worker pool.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::db::DbPool;
use common::error::Result;
use common::model::UserId;
use common::pool::{JobHandler, WorkerPool};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Registered,
    Login,
    LoginFailed,
    Logout,
    PasswordChanged,
    TwoFactorChanged,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Registered => "registered",
            ActivityKind::Login => "login",
            ActivityKind::LoginFailed => "login_failed",
            ActivityKind::Logout => "logout",
            ActivityKind::PasswordChanged => "password_changed",
            ActivityKind::TwoFactorChanged => "two_factor_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub user_id: UserId,
    pub kind: ActivityKind,
    pub ip: Option<String>,
    pub at: DateTime<Utc>,
}

/// Where activity events end up
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record(&self, event: &ActivityEvent) -> Result<()>;
}

/// Sink that writes events to the log
pub struct LogActivitySink;

#[async_trait]
impl ActivitySink for LogActivitySink {
    async fn record(&self, event: &ActivityEvent) -> Result<()> {
        info!(user_id = event.user_id, ip = ?event.ip, "activity: {}", event.kind.as_str());
        Ok(())
    }
}

/// Sink that keeps events in memory
#[derive(Default)]
pub struct MemoryActivitySink {
    events: Mutex<Vec<ActivityEvent>>,
}

impl MemoryActivitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ActivitySink for MemoryActivitySink {
    async fn record(&self, event: &ActivityEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Sink backed by the `user_activity` table
pub struct PostgresActivitySink {
    pool: DbPool,
}

impl PostgresActivitySink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivitySink for PostgresActivitySink {
    async fn record(&self, event: &ActivityEvent) -> Result<()> {
        sqlx::query("INSERT INTO user_activity (user_id, kind, ip, created_at) VALUES ($1, $2, $3, $4)")
            .bind(event.user_id)
            .bind(event.kind.as_str())
            .bind(&event.ip)
            .bind(event.at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

struct RecordJob(Arc<dyn ActivitySink>);

#[async_trait]
impl JobHandler<ActivityEvent> for RecordJob {
    async fn handle(&self, job: ActivityEvent) -> Result<()> {
        self.0.record(&job).await
    }
}

/// Activity worker pool
#[derive(Clone)]
pub struct ActivityLog {
    pool: WorkerPool<ActivityEvent>,
}

impl ActivityLog {
    pub fn spawn(sink: Arc<dyn ActivitySink>, workers: usize, capacity: usize) -> Self {
        Self {
            pool: WorkerPool::spawn("activity", Arc::new(RecordJob(sink)), workers, capacity),
        }
    }

    /// Queue an event; a full or closed pool never fails the caller
    pub async fn record(&self, user_id: UserId, kind: ActivityKind, ip: Option<&str>) {
        let event = ActivityEvent {
            user_id,
            kind,
            ip: ip.map(str::to_string),
            at: Utc::now(),
        };
        if let Err(e) = self.pool.submit(event).await {
            warn!(user_id, "activity not recorded: {}", e);
        }
    }
}
