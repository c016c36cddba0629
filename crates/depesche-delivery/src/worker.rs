//! Worker pool executing queued delivery tasks.
//!
//! A fixed number of workers consume the bounded queue. Each execution
//! is a single pass through the dispatcher pipeline; failures feed the
//! per-task state machine, which schedules delayed requeues instead of
//! recursing. Shutdown is cooperative through a cancellation token.

use std::{sync::Arc, time::Duration};

use depesche_core::Clock;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    queue::{TaskId, TaskQueue},
    retry::RetryPolicy,
};

/// Worker pool sizing and shutdown behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Maximum time to wait for workers during graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Supervised pool of delivery workers.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    queue: TaskQueue,
    receiver: Arc<Mutex<mpsc::Receiver<TaskId>>>,
    config: WorkerConfig,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("active", &self.has_active_workers())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool over the queue's receiver. Workers start on
    /// `spawn_workers`.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        queue: TaskQueue,
        receiver: mpsc::Receiver<TaskId>,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            receiver: Arc::new(Mutex::new(receiver)),
            config,
            token: CancellationToken::new(),
            handles: Vec::new(),
            clock,
        }
    }

    /// Spawns the configured number of workers.
    pub fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        for worker_id in 0..self.config.worker_count {
            let worker = Worker {
                id: worker_id,
                dispatcher: self.dispatcher.clone(),
                queue: self.queue.clone(),
                receiver: self.receiver.clone(),
                retry: self.dispatcher.retry_policy().clone(),
                token: self.token.clone(),
                clock: self.clock.clone(),
            };
            self.handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Signals cancellation and waits for workers to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownRequested` if the timeout elapses with workers
    /// still running.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            worker_count = self.handles.len(),
            timeout_secs = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.token.cancel();

        let handles = std::mem::take(&mut self.handles);
        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "worker shutdown timed out, workers may still be running"
                );
                Err(DeliveryError::ShutdownRequested)
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.token.is_cancelled() {
            warn!("worker pool dropped with active workers, forcing cancellation");
            self.token.cancel();
        }
    }
}

struct Worker {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    queue: TaskQueue,
    receiver: Arc<Mutex<mpsc::Receiver<TaskId>>>,
    retry: RetryPolicy,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl Worker {
    async fn run(self) {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            let task_id = tokio::select! {
                () = self.token.cancelled() => break,
                task_id = Self::next_task(&self.receiver) => {
                    match task_id {
                        Some(task_id) => task_id,
                        None => break,
                    }
                },
            };
            self.process(task_id).await;
        }

        info!(worker_id = self.id, "delivery worker stopped");
    }

    /// Waits for the next task id.
    ///
    /// Workers serialize on the receiver lock while idle, but the lock
    /// is released before execution, so tasks run concurrently.
    async fn next_task(receiver: &Mutex<mpsc::Receiver<TaskId>>) -> Option<TaskId> {
        receiver.lock().await.recv().await
    }

    async fn process(&self, task_id: TaskId) {
        let Some((payload, attempt, max_retries)) = self.queue.begin_attempt(task_id).await else {
            return;
        };

        debug!(
            worker_id = self.id,
            task_id = %task_id,
            kind = payload.kind(),
            attempt,
            "executing task"
        );

        match self.dispatcher.execute(&payload).await {
            Ok(()) => {
                self.queue.complete(task_id).await;
                info!(worker_id = self.id, task_id = %task_id, attempt, "task succeeded");
            },
            Err(err) => self.handle_failure(task_id, attempt, max_retries, err).await,
        }
    }

    async fn handle_failure(
        &self,
        task_id: TaskId,
        attempt: u32,
        max_retries: u32,
        err: DeliveryError,
    ) {
        // Attempt count stays within max_retries + 1 by construction:
        // a retry is scheduled only while attempts remain.
        if err.is_retryable() && attempt <= max_retries {
            let delay = self.retry.backoff_delay(attempt);
            self.queue.schedule_retry(task_id, delay, &err).await;
            warn!(
                worker_id = self.id,
                task_id = %task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "task failed, retry scheduled"
            );
            self.spawn_requeue(task_id, delay);
        } else {
            self.queue.fail(task_id, &err.to_string()).await;
            error!(
                worker_id = self.id,
                task_id = %task_id,
                attempt,
                error = %err,
                "task permanently failed"
            );
        }
    }

    /// Requeues a task after its backoff delay without blocking a
    /// worker slot.
    fn spawn_requeue(&self, task_id: TaskId, delay: Duration) {
        let queue = self.queue.clone();
        let token = self.token.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    queue.fail(task_id, "shutdown before retry").await;
                },
                () = clock.sleep(delay) => {
                    if queue.requeue(task_id).await.is_err() {
                        queue.fail(task_id, "queue closed before retry").await;
                    }
                },
            }
        });
    }
}
