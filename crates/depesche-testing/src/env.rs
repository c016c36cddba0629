//! Composed test environment for end-to-end suites.

use std::sync::Arc;

use anyhow::{bail, Result};
use depesche_core::{Clock, KeyValueStore, MemoryStore, Metrics, TestClock};
use depesche_delivery::{
    Dispatcher, DispatcherConfig, QueueConfig, ScriptedTransport, SentMessage, TaskId,
    TaskQueue, TaskSnapshot, WorkerConfig, WorkerPool,
};
use depesche_otp::{OtpConfig, OtpManager};
use depesche_reset::{ResetConfig, ResetOrchestrator};

use crate::fixtures::InMemoryCredentials;

/// Configuration for building a `TestEnv`.
#[derive(Default)]
pub struct TestEnvBuilder {
    otp: OtpConfig,
    dispatcher: DispatcherConfig,
    queue: QueueConfig,
    workers: WorkerConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<TestClock>,
}

impl TestEnvBuilder {
    /// Starts from the default configuration of every component.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the issuance configuration.
    pub fn otp_config(mut self, config: OtpConfig) -> Self {
        self.otp = config;
        self
    }

    /// Overrides the dispatcher configuration.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    /// Overrides the queue configuration.
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// Overrides the worker pool configuration.
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.workers = config;
        self
    }

    /// Uses a specific backing store instead of a fresh in-memory one.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares a clock with externally built components.
    pub fn clock(mut self, clock: TestClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the environment and spawns its workers.
    pub fn start(self) -> TestEnv {
        let clock = self.clock.unwrap_or_default();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(clock_arc.clone())));
        let metrics = Arc::new(Metrics::new());
        let transport = ScriptedTransport::new();

        let otp = Arc::new(OtpManager::new(
            store.clone(),
            self.otp,
            metrics.clone(),
            clock_arc.clone(),
        ));
        let (queue, rx) = TaskQueue::new(self.queue, clock_arc.clone(), metrics.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(transport.clone()),
            queue.clone(),
            self.dispatcher,
            clock_arc.clone(),
            metrics.clone(),
        ));
        let credentials = InMemoryCredentials::new();
        let orchestrator = ResetOrchestrator::new(
            otp.clone(),
            dispatcher.clone(),
            store.clone(),
            Arc::new(credentials.clone()),
            ResetConfig::default(),
            clock_arc.clone(),
        );

        let mut workers =
            WorkerPool::new(dispatcher.clone(), queue.clone(), rx, self.workers, clock_arc);
        workers.spawn_workers();

        TestEnv {
            clock,
            metrics,
            store,
            transport,
            otp,
            dispatcher,
            queue,
            orchestrator,
            credentials,
            workers: Some(workers),
        }
    }
}

/// A fully wired delivery stack with running workers.
pub struct TestEnv {
    /// Deterministic clock every component shares.
    pub clock: TestClock,
    /// Process metrics.
    pub metrics: Arc<Metrics>,
    /// The backing key-value store.
    pub store: Arc<dyn KeyValueStore>,
    /// The scriptable outbound transport.
    pub transport: ScriptedTransport,
    /// Code issuance and validation.
    pub otp: Arc<OtpManager>,
    /// The dispatch pipeline.
    pub dispatcher: Arc<Dispatcher>,
    /// The task queue feeding the workers.
    pub queue: TaskQueue,
    /// The composed reset flow.
    pub orchestrator: ResetOrchestrator,
    /// Where completed resets land their secrets.
    pub credentials: InMemoryCredentials,
    workers: Option<WorkerPool>,
}

impl TestEnv {
    /// A fully default environment.
    pub fn start() -> Self {
        TestEnvBuilder::new().start()
    }

    /// Yields until the task reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Fails if the task never terminates within the yield budget.
    pub async fn wait_for_terminal(&self, id: TaskId) -> Result<TaskSnapshot> {
        for _ in 0..10_000 {
            if let Some(status) = self.queue.task_status(id).await {
                if status.status.is_terminal() {
                    return Ok(status);
                }
            }
            tokio::task::yield_now().await;
        }
        bail!("task {id} did not reach a terminal state");
    }

    /// Yields a number of times so workers can drain the queue.
    pub async fn settle(&self) {
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
    }

    /// Messages the transport accepted so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.transport.sent()
    }

    /// The security code carried by the most recent accepted message.
    pub fn last_sent_code(&self) -> Option<String> {
        self.sent().last().and_then(|m| crate::fixtures::extract_code(&m.body))
    }

    /// Stops the workers, waiting for in-flight tasks.
    ///
    /// # Errors
    ///
    /// Fails when the worker pool does not stop within its timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(workers) = self.workers.take() {
            workers.shutdown_graceful().await?;
        }
        Ok(())
    }
}
