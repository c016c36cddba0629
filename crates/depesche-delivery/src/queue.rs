//! Bounded task queue with an explicit per-task state machine.
//!
//! Submission fails fast when the queue is saturated; that rejection is
//! the system's backpressure signal, not a defect. Task state lives in
//! a registry next to the channel so status queries never consume a
//! retry slot, and terminal records are retained for a bounded window
//! before lazy eviction.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use depesche_core::{Clock, Metrics};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::{
    error::{DeliveryError, Result},
    transport::Message,
};

/// Opaque task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Job payload, tagged by kind.
///
/// One strongly typed shape per kind; dispatch needs no reflection.
#[derive(Debug, Clone)]
pub enum JobPayload {
    /// A one-time-code delivery on behalf of an owner.
    CodeDelivery {
        /// Owner key the code belongs to.
        owner: String,
        /// The rendered code message.
        message: Message,
    },
    /// A general-purpose notification.
    Notification {
        /// The message to deliver.
        message: Message,
    },
}

impl JobPayload {
    /// The message this job transmits.
    pub fn message(&self) -> &Message {
        match self {
            Self::CodeDelivery { message, .. } | Self::Notification { message } => message,
        }
    }

    /// Stable job-kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CodeDelivery { .. } => "code_delivery",
            Self::Notification { .. } => "notification",
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Accepted, waiting for a worker.
    Queued,
    /// A worker is executing an attempt.
    Running,
    /// A failed attempt is waiting for its backoff delay.
    Retrying,
    /// Terminal: the message was transmitted.
    Succeeded,
    /// Terminal: no further attempt will be made.
    Failed,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One queued delivery job and its execution state.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    /// Task identifier.
    pub id: TaskId,
    /// The job to execute.
    pub payload: JobPayload,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Executions so far. Never exceeds `max_retries + 1`.
    pub attempt_count: u32,
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the next attempt may run, while retrying.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Most recent failure, for status queries.
    pub last_error: Option<String>,
    /// When a terminal state was reached.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Status view returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Executions so far.
    pub attempt_count: u32,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
}

/// Queue sizing and retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum queued tasks before submission is rejected.
    pub capacity: usize,
    /// How long terminal records stay queryable.
    pub retention: Duration,
    /// Hard ceiling on a task's total lifetime across retries.
    pub max_task_lifetime: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            retention: Duration::from_secs(300),
            max_task_lifetime: Duration::from_secs(3600),
        }
    }
}

struct QueueInner {
    tx: mpsc::Sender<TaskId>,
    tasks: Mutex<HashMap<TaskId, DeliveryTask>>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

/// Handle to the bounded task queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("config", &self.inner.config).finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Creates a queue and the receiver its workers consume.
    pub fn new(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Receiver<TaskId>) {
        let (tx, rx) = mpsc::channel(config.capacity);
        let inner = QueueInner { tx, tasks: Mutex::new(HashMap::new()), config, clock, metrics };
        (Self { inner: Arc::new(inner) }, rx)
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.inner.clock.now_system())
    }

    /// Accepts a job onto the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the queue is saturated, or
    /// `ShutdownRequested` when the workers are gone. Both are surfaced
    /// immediately so the caller can apply its own backpressure.
    pub async fn submit(&self, payload: JobPayload, max_retries: u32) -> Result<TaskId> {
        self.evict_expired().await;

        let task = DeliveryTask {
            id: TaskId::new(),
            payload,
            status: TaskStatus::Queued,
            attempt_count: 0,
            max_retries,
            created_at: self.now(),
            next_eligible_at: None,
            last_error: None,
            finished_at: None,
        };
        let id = task.id;
        let kind = task.payload.kind();

        self.inner.tasks.lock().await.insert(id, task);
        match self.inner.tx.try_send(id) {
            Ok(()) => {
                self.inner.metrics.queue.submitted.incr();
                debug!(task_id = %id, kind, "task queued");
                Ok(id)
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.tasks.lock().await.remove(&id);
                self.inner.metrics.queue.rejected.incr();
                warn!(kind, capacity = self.inner.config.capacity, "task queue full");
                Err(DeliveryError::queue_full(self.inner.config.capacity))
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.tasks.lock().await.remove(&id);
                Err(DeliveryError::ShutdownRequested)
            },
        }
    }

    /// Read-only status for a task. Never consumes a retry slot.
    pub async fn task_status(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.evict_expired().await;
        let tasks = self.inner.tasks.lock().await;
        tasks.get(&id).map(|task| TaskSnapshot {
            status: task.status,
            attempt_count: task.attempt_count,
            last_error: task.last_error.clone(),
        })
    }

    /// Claims a task for execution.
    ///
    /// Returns the payload, this attempt's number, and the retry
    /// budget, or `None` when the task is gone, already terminal, or
    /// force-failed for exceeding its maximum lifetime.
    pub(crate) async fn begin_attempt(&self, id: TaskId) -> Option<(JobPayload, u32, u32)> {
        let now = self.now();
        let mut tasks = self.inner.tasks.lock().await;
        let task = tasks.get_mut(&id)?;

        if task.status.is_terminal() {
            return None;
        }

        let age = (now - task.created_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.inner.config.max_task_lifetime {
            task.status = TaskStatus::Failed;
            task.last_error = Some(DeliveryError::LifetimeExceeded.to_string());
            task.finished_at = Some(now);
            self.inner.metrics.queue.expired.incr();
            self.inner.metrics.queue.failed.incr();
            warn!(task_id = %id, "task exceeded maximum lifetime, force-failed");
            return None;
        }

        task.status = TaskStatus::Running;
        task.attempt_count += 1;
        Some((task.payload.clone(), task.attempt_count, task.max_retries))
    }

    /// Marks a task as succeeded.
    pub(crate) async fn complete(&self, id: TaskId) {
        let now = self.now();
        let mut tasks = self.inner.tasks.lock().await;
        if let Some(task) = tasks.get_mut(&id) {
            task.status = TaskStatus::Succeeded;
            task.finished_at = Some(now);
            self.inner.metrics.queue.succeeded.incr();
        }
    }

    /// Marks a task as waiting for its next attempt.
    pub(crate) async fn schedule_retry(&self, id: TaskId, delay: Duration, error: &DeliveryError) {
        let now = self.now();
        let mut tasks = self.inner.tasks.lock().await;
        if let Some(task) = tasks.get_mut(&id) {
            task.status = TaskStatus::Retrying;
            task.next_eligible_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| {
                    chrono::Duration::zero()
                }));
            task.last_error = Some(error.to_string());
            self.inner.metrics.queue.retried.incr();
        }
    }

    /// Marks a task as permanently failed.
    pub(crate) async fn fail(&self, id: TaskId, reason: &str) {
        let now = self.now();
        let mut tasks = self.inner.tasks.lock().await;
        if let Some(task) = tasks.get_mut(&id) {
            task.status = TaskStatus::Failed;
            task.last_error = Some(reason.to_string());
            task.finished_at = Some(now);
            self.inner.metrics.queue.failed.incr();
        }
    }

    /// Puts a retrying task back on the channel.
    pub(crate) async fn requeue(&self, id: TaskId) -> Result<()> {
        self.inner.tx.send(id).await.map_err(|_| DeliveryError::ShutdownRequested)
    }

    async fn evict_expired(&self) {
        let now = self.now();
        let retention =
            chrono::Duration::from_std(self.inner.config.retention).unwrap_or_else(|_| {
                chrono::Duration::zero()
            });
        let mut tasks = self.inner.tasks.lock().await;
        tasks.retain(|_, task| {
            !(task.status.is_terminal()
                && task.finished_at.is_some_and(|at| at + retention <= now))
        });
    }

    /// Number of tracked tasks, terminal records included.
    pub async fn tracked_tasks(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }
}
