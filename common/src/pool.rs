//! Bounded worker pools fed by channels
//!
//! Side jobs (emails, notifications, activity logging) go through a pool
//! instead of ad-hoc spawned tasks. A full queue makes submitters wait.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Processes one job
#[async_trait]
pub trait JobHandler<J: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, job: J) -> Result<()>;
}

struct Envelope<J> {
    job: J,
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// Fixed number of workers draining a bounded queue
pub struct WorkerPool<J> {
    name: &'static str,
    tx: mpsc::Sender<Envelope<J>>,
}

impl<J> Clone for WorkerPool<J> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `workers` tasks on the current runtime
    pub fn spawn(
        name: &'static str,
        handler: Arc<dyn JobHandler<J>>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Envelope<J>>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(envelope) = next else { break };
                    let result = handler.handle(envelope.job).await;
                    match envelope.ack {
                        Some(ack) => {
                            let _ = ack.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                error!(pool = name, worker, "job failed: {}", e);
                            }
                        }
                    }
                }
                debug!(pool = name, worker, "worker exited");
            });
        }

        Self { name, tx }
    }

    /// Queue a job without waiting for it to run
    pub async fn submit(&self, job: J) -> Result<()> {
        self.tx
            .send(Envelope { job, ack: None })
            .await
            .map_err(|_| Error::Internal(format!("{} pool is shut down", self.name)))
    }

    /// Queue a job and wait for its outcome
    pub async fn submit_and_wait(&self, job: J) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                job,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| Error::Internal(format!("{} pool is shut down", self.name)))?;
        ack_rx
            .await
            .map_err(|_| Error::Internal(format!("{} worker dropped the job", self.name)))?
    }
}
