//! # Task Queue
//!
//! Background work is expressed as [`TaskDescriptor`]s pushed onto a
//! [`TaskQueue`]. [`LocalTaskQueue`] is an in-process implementation: a tokio
//! channel fed by callers and by cron-driven periodic registrations, and
//! drained by a [`TaskWorker`] running a fixed number of tasks concurrently.
//!
//! The channel is unbounded because a running sweep enqueues into the same
//! queue its own worker drains.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::normalize_cron_expr;
use crate::error::{Error, Result};
use crate::telemetry::{TraceContext, with_trace_context};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskDescriptor {
    /// Sweep for tokens about to expire and enqueue one refresh per connection
    #[serde(rename = "refresh_expiring_oauth2_tokens")]
    RefreshExpiringOAuth2Tokens,
    #[serde(rename = "refresh_oauth2_token")]
    RefreshOAuth2Token { connection_id: Uuid },
    PurgeExpiredNonces,
}

impl TaskDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskDescriptor::RefreshExpiringOAuth2Tokens => "refresh_expiring_oauth2_tokens",
            TaskDescriptor::RefreshOAuth2Token { .. } => "refresh_oauth2_token",
            TaskDescriptor::PurgeExpiredNonces => "purge_expired_nonces",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: Uuid,
    pub descriptor: TaskDescriptor,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queues one run of `descriptor`, returning the task id.
    async fn enqueue(&self, descriptor: TaskDescriptor) -> Result<Uuid>;

    /// Enqueues `descriptor` on every tick of `cron_expr`.
    async fn register_periodic(&self, cron_expr: &str, descriptor: TaskDescriptor) -> Result<()>;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<()>;
}

/// Receiving half of a [`LocalTaskQueue`], consumed by a [`TaskWorker`].
pub struct TaskReceiver {
    inner: mpsc::UnboundedReceiver<Task>,
}

pub struct LocalTaskQueue {
    sender: mpsc::UnboundedSender<Task>,
    shutdown: CancellationToken,
    periodic: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTaskQueue {
    pub fn new(shutdown: CancellationToken) -> (Self, TaskReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                shutdown,
                periodic: Mutex::new(Vec::new()),
            },
            TaskReceiver { inner: receiver },
        )
    }

    /// Waits for every periodic registration loop to exit after shutdown.
    pub async fn join_periodic(&self) {
        let handles: Vec<_> = self.periodic.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = ?err, "Periodic task loop ended abnormally");
            }
        }
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, descriptor: TaskDescriptor) -> Result<Uuid> {
        let task = Task {
            id: Uuid::new_v4(),
            descriptor,
        };
        let id = task.id;
        let kind = task.descriptor.kind();
        self.sender
            .send(task)
            .map_err(|_| Error::Queue("task queue is closed".into()))?;
        debug!(task_id = %id, kind, "Task enqueued");
        Ok(id)
    }

    async fn register_periodic(&self, cron_expr: &str, descriptor: TaskDescriptor) -> Result<()> {
        let schedule = cron::Schedule::from_str(&normalize_cron_expr(cron_expr))
            .map_err(|e| Error::Queue(format!("invalid cron expression '{}': {}", cron_expr, e)))?;

        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();
        let expr = cron_expr.to_string();
        info!(cron = %expr, kind = descriptor.kind(), "Registered periodic task");

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(cron = %expr, "Cron schedule has no upcoming runs");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let task = Task {
                    id: Uuid::new_v4(),
                    descriptor: descriptor.clone(),
                };
                if sender.send(task).is_err() {
                    break;
                }
            }
        });

        self.periodic.lock().await.push(handle);
        Ok(())
    }
}

/// Drains a [`TaskReceiver`], running up to `concurrency` tasks at once.
pub struct TaskWorker {
    receiver: TaskReceiver,
    handler: Arc<dyn TaskHandler>,
    concurrency: usize,
}

impl TaskWorker {
    pub fn new(receiver: TaskReceiver, handler: Arc<dyn TaskHandler>, concurrency: usize) -> Self {
        Self {
            receiver,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs until `shutdown` fires or every sender is gone, then waits for
    /// in-flight tasks.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(concurrency = self.concurrency, "Starting task worker");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = self.receiver.inner.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let handler = self.handler.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let context = TraceContext::new(task.id.simple().to_string());
                with_trace_context(context, async {
                    let kind = task.descriptor.kind();
                    match handler.handle(&task).await {
                        Ok(()) => debug!(task_id = %task.id, kind, "Task completed"),
                        Err(err) if err.is_retryable() => {
                            warn!(task_id = %task.id, kind, error = %err, "Task failed; will be picked up by the next sweep")
                        }
                        Err(err) => error!(task_id = %task.id, kind, error = %err, "Task failed"),
                    }
                })
                .await;
            });
        }

        // Wait for in-flight tasks by taking every permit back.
        let _ = permits.acquire_many(self.concurrency as u32).await;
        info!("Task worker stopped");
    }
}
