//! Outbound email
//!
//! The transport is an external collaborator behind [`Mailer`]. Messages are
//! handed to a [`MailDispatcher`], a bounded worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};
use crate::pool::{JobHandler, WorkerPool};

/// An email ready to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Email transport
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Transport that only logs; used when no SMTP relay is configured
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "email sent");
        Ok(())
    }
}

/// Transport that keeps messages in memory
#[derive(Default)]
pub struct MemoryMailer {
    outbox: Mutex<Vec<EmailMessage>>,
    failing: AtomicBool,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All messages sent so far
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Messages sent to one address
    pub fn sent_to(&self, address: &str) -> Vec<EmailMessage> {
        self.sent().into_iter().filter(|m| m.to == address).collect()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Upstream("mail relay unavailable".to_string()));
        }
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

struct MailJob(Arc<dyn Mailer>);

#[async_trait]
impl JobHandler<EmailMessage> for MailJob {
    async fn handle(&self, job: EmailMessage) -> Result<()> {
        self.0.send(&job).await
    }
}

/// Email worker pool
#[derive(Clone)]
pub struct MailDispatcher {
    pool: WorkerPool<EmailMessage>,
}

impl MailDispatcher {
    /// Spawn the pool on the current runtime
    pub fn spawn(mailer: Arc<dyn Mailer>, workers: usize, capacity: usize) -> Self {
        Self {
            pool: WorkerPool::spawn("mail", Arc::new(MailJob(mailer)), workers, capacity),
        }
    }

    /// Send and wait for the transport's answer
    pub async fn send(&self, message: EmailMessage) -> Result<()> {
        self.pool.submit_and_wait(message).await
    }

    /// Queue a message; failures are logged by the worker
    pub async fn enqueue(&self, message: EmailMessage) -> Result<()> {
        self.pool.submit(message).await
    }
}
