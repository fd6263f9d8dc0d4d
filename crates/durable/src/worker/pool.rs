//! Worker pool for activity execution
//!
//! Manages concurrent activity execution with graceful shutdown. Workers
//! claim tasks from a single task queue, run the registered handlers under
//! the start-to-close timeout, and report outcomes back through the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, PollerError, TaskPoller};
use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::engine::WorkflowEngine;
use crate::persistence::{ClaimedTask, ProcessStore, StoreError, TaskFailureOutcome};
use crate::workflow::TimeoutType;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queue this worker polls
    pub task_queue: String,

    /// Maximum concurrent activity executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Stale task reclamation interval
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,

    /// How long without a heartbeat before a claimed task is considered stale
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration for the given task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set the stale task threshold
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Activity handler function type
///
/// Handlers receive the execution context and the JSON input recorded in the
/// ActivityScheduled event, and return the JSON result or an error.
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>>
        + Send
        + Sync,
>;

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// use windlass_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new("order-processing")
///     .with_max_concurrency(10);
///
/// let pool = WorkerPool::new(engine, config);
/// pool.register_activity(ChargeCreditCard);
///
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: ProcessStore> {
    engine: Arc<WorkflowEngine<S>>,
    store: Arc<S>,
    config: WorkerPoolConfig,
    handlers: Arc<RwLock<HashMap<String, ActivityHandler>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ProcessStore> WorkerPool<S> {
    /// Create a new worker pool backed by the engine's store
    pub fn new(engine: Arc<WorkflowEngine<S>>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = Arc::clone(engine.store());

        Self {
            engine,
            store,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handle: Mutex::new(None),
            reclaim_handle: Mutex::new(None),
        }
    }

    /// Register a typed activity
    pub fn register_activity<A: Activity>(&self, activity: A) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx, input| {
            let activity = Arc::clone(&activity);
            Box::pin(async move {
                let typed: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid activity input: {e}"))
                })?;
                let output = activity.execute(&ctx, typed).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!("failed to serialize activity output: {e}"))
                })
            })
        });

        self.handlers.write().insert(A::TYPE.to_string(), handler);
    }

    /// Register a raw activity handler
    pub fn register_handler<F, Fut>(&self, activity_type: &str, handler: F)
    where
        F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, ActivityError>>
            + Send
            + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        self.handlers
            .write()
            .insert(activity_type.to_string(), handler);
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read();
            if status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        *self.status.write() = WorkerPoolStatus::Running;

        self.start_poll_loop();
        self.start_reclaim_loop();

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops claiming new tasks and waits up to `shutdown_timeout` for
    /// in-flight activities to finish.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read();
            if status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");

        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;

        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Start the polling loop
    fn start_poll_loop(&self) {
        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let handlers = Arc::clone(&self.handlers);
        let active_tasks = Arc::clone(&self.active_tasks);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller = TaskPoller::new(
                Arc::clone(&store),
                config.worker_id.clone(),
                config.task_queue.clone(),
                Vec::new(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                // Re-read the registry each round so handlers registered
                // after start() are claimed too.
                poller.set_activity_types(handlers.read().keys().cloned().collect());

                let available_slots = active_tasks.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let handler = match handlers.read().get(&task.activity_type) {
                                Some(h) => Arc::clone(h),
                                None => {
                                    warn!(
                                        activity_type = %task.activity_type,
                                        "No handler registered"
                                    );
                                    continue;
                                }
                            };

                            let permit = match Arc::clone(&active_tasks).try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    debug!("No permits available");
                                    break;
                                }
                            };

                            let engine = Arc::clone(&engine);
                            let store = Arc::clone(&store);
                            let worker_id = config.worker_id.clone();

                            tokio::spawn(async move {
                                execute_task(engine, store, worker_id, handler, task).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Start the stale task reclamation loop
    fn start_reclaim_loop(&self) {
        let store = Arc::clone(&self.store);
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_stale_tasks(threshold).await {
                            Ok(reclaimed) => {
                                if !reclaimed.is_empty() {
                                    info!(count = reclaimed.len(), "Reclaimed stale tasks");
                                }
                            }
                            Err(e) => {
                                error!("Stale task reclamation failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        });

        *self.reclaim_handle.lock() = Some(handle);
    }
}

/// Execute a single claimed task and report its outcome
///
/// Heartbeats from the activity are forwarded to the store; a heartbeat
/// response requesting cancellation flips the context's cancellation flag.
/// A start-to-close timeout drops the handler future and reports a timed-out
/// outcome, terminal for the invocation.
async fn execute_task<S: ProcessStore>(
    engine: Arc<WorkflowEngine<S>>,
    store: Arc<S>,
    worker_id: String,
    handler: ActivityHandler,
    task: ClaimedTask,
) {
    let ctx = ActivityContext::new(
        task.instance_id.clone(),
        task.activity_id.clone(),
        task.attempt,
        task.max_attempts,
    );

    let (hb_tx, mut hb_rx) = mpsc::channel(16);
    let ctx = ctx.with_heartbeat(hb_tx);
    let cancel_handle = ctx.cancellation_handle();

    // Forward heartbeats while the handler runs. Ends when the context
    // (and with it the sender) is dropped.
    let hb_store = Arc::clone(&store);
    let hb_worker_id = worker_id.clone();
    let hb_cancel = cancel_handle.clone();
    let task_id = task.id;
    let hb_forwarder = tokio::spawn(async move {
        while let Some(payload) = hb_rx.recv().await {
            match hb_store
                .heartbeat_task(task_id, &hb_worker_id, payload.details)
                .await
            {
                Ok(resp) if resp.should_cancel => hb_cancel.cancel(),
                Ok(_) => {}
                Err(e) => warn!(%task_id, "Heartbeat failed: {}", e),
            }
        }
    });

    if let Err(e) = engine
        .on_activity_started(&task.instance_id, &task.activity_id, task.attempt, &worker_id)
        .await
    {
        warn!(%task_id, "Failed to record activity start: {}", e);
    }

    let instance_id = task.instance_id.clone();
    let activity_id = task.activity_id.clone();
    let retry_policy = task.options.retry_policy.clone();
    let timeout = task.options.start_to_close_timeout;

    debug!(%task_id, %instance_id, %activity_id, attempt = task.attempt, "Executing activity");

    let outcome = tokio::time::timeout(timeout, handler(ctx, task.input)).await;

    match outcome {
        Ok(Ok(result)) => {
            if cancel_handle.is_cancelled() {
                debug!(%task_id, "Activity finished after cancellation, result dropped");
                if let Err(e) = store.complete_task(task_id, result).await {
                    error!(%task_id, "Failed to finalize cancelled task: {}", e);
                }
            } else {
                if let Err(e) = store.complete_task(task_id, result.clone()).await {
                    error!(%task_id, "Failed to complete task: {}", e);
                }
                if let Err(e) = engine
                    .on_activity_completed(&instance_id, &activity_id, result)
                    .await
                {
                    error!(%task_id, "Failed to report activity completion: {}", e);
                }
            }
        }
        Ok(Err(err)) => {
            if cancel_handle.is_cancelled() {
                debug!(%task_id, "Cancelled activity failed, outcome dropped");
                if let Err(e) = store.fail_task(task_id, &err.message, false).await {
                    error!(%task_id, "Failed to finalize cancelled task: {}", e);
                }
            } else {
                let retryable =
                    err.retryable && retry_policy.should_retry(err.error_type.as_deref());

                match store.fail_task(task_id, &err.message, retryable).await {
                    Ok(outcome) => {
                        let will_retry = matches!(outcome, TaskFailureOutcome::WillRetry { .. });
                        if let Err(e) = engine
                            .on_activity_failed(&instance_id, &activity_id, err, will_retry)
                            .await
                        {
                            error!(%task_id, "Failed to report activity failure: {}", e);
                        }
                    }
                    Err(e) => error!(%task_id, "Failed to fail task: {}", e),
                }
            }
        }
        Err(_elapsed) => {
            warn!(%task_id, %activity_id, timeout_ms = timeout.as_millis(), "Activity timed out");
            if let Err(e) = store.timeout_task(task_id).await {
                error!(%task_id, "Failed to mark task timed out: {}", e);
            }
            if !cancel_handle.is_cancelled() {
                if let Err(e) = engine
                    .on_activity_timed_out(&instance_id, &activity_id, TimeoutType::StartToClose)
                    .await
                {
                    error!(%task_id, "Failed to report activity timeout: {}", e);
                }
            }
        }
    }

    hb_forwarder.abort();
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryProcessStore, ProcessStatus};
    use crate::workflow::{
        Workflow, WorkflowAction, WorkflowContext, WorkflowError,
    };
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GreetInput {
        name: String,
    }

    struct GreetingWorkflow {
        input: GreetInput,
        greeting: Option<String>,
        failed: Option<WorkflowError>,
    }

    impl Workflow for GreetingWorkflow {
        const TYPE: &'static str = "greeting";
        type Input = GreetInput;
        type Output = String;

        fn new(input: Self::Input) -> Self {
            Self {
                input,
                greeting: None,
                failed: None,
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "greet",
                "compose_greeting",
                json!({ "name": self.input.name }),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            result: Value,
        ) -> Vec<WorkflowAction> {
            let greeting = result.as_str().unwrap_or_default().to_string();
            self.greeting = Some(greeting.clone());
            vec![WorkflowAction::complete(json!(greeting))]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            error: &crate::activity::ActivityError,
        ) -> Vec<WorkflowAction> {
            let err = WorkflowError::new(&error.message);
            self.failed = Some(err.clone());
            vec![WorkflowAction::fail(err)]
        }

        fn is_completed(&self) -> bool {
            self.greeting.is_some() || self.failed.is_some()
        }

        fn result(&self) -> Option<Self::Output> {
            self.greeting.clone()
        }

        fn error(&self) -> Option<WorkflowError> {
            self.failed.clone()
        }
    }

    async fn wait_for_terminal(
        store: &Arc<InMemoryProcessStore>,
        instance_id: &str,
    ) -> ProcessStatus {
        for _ in 0..100 {
            let status = store.get_instance_status(instance_id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("instance did not reach a terminal state in time");
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.task_queue, "default");
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new("order-processing")
            .with_worker_id("test-worker")
            .with_max_concurrency(20)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.task_queue, "order-processing");
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pool_runs_activity_to_completion() {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<GreetingWorkflow>();
        let engine = Arc::new(engine);
        let store = Arc::clone(engine.store());

        let config = WorkerPoolConfig::new("greetings")
            .with_poller(PollerConfig::default().with_min_interval(Duration::from_millis(10)));
        let pool = WorkerPool::new(Arc::clone(&engine), config);

        pool.register_handler("compose_greeting", |_ctx, input| async move {
            let name = input["name"].as_str().unwrap_or("world").to_string();
            Ok(json!(format!("Hello, {name}!")))
        });

        pool.start().await.unwrap();

        engine
            .start_workflow::<GreetingWorkflow>(
                "greet_1",
                "greetings",
                GreetInput {
                    name: "Ada".to_string(),
                },
            )
            .await
            .unwrap();

        let status = wait_for_terminal(&store, "greet_1").await;
        assert_eq!(status, ProcessStatus::Completed);

        let info = store.get_instance("greet_1").await.unwrap();
        assert_eq!(info.result, Some(json!("Hello, Ada!")));

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_fails_instance() {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<GreetingWorkflow>();
        let engine = Arc::new(engine);
        let store = Arc::clone(engine.store());

        let config = WorkerPoolConfig::new("greetings")
            .with_poller(PollerConfig::default().with_min_interval(Duration::from_millis(10)));
        let pool = WorkerPool::new(Arc::clone(&engine), config);

        pool.register_handler("compose_greeting", |_ctx, _input| async move {
            Err(ActivityError::non_retryable("name service rejected request"))
        });

        pool.start().await.unwrap();

        engine
            .start_workflow::<GreetingWorkflow>(
                "greet_2",
                "greetings",
                GreetInput {
                    name: "Ada".to_string(),
                },
            )
            .await
            .unwrap();

        let status = wait_for_terminal(&store, "greet_2").await;
        assert_eq!(status, ProcessStatus::Failed);

        let info = store.get_instance("greet_2").await.unwrap();
        assert_eq!(
            info.error.map(|e| e.message),
            Some("name service rejected request".to_string())
        );

        pool.shutdown().await.unwrap();
    }

    struct SlowFetchWorkflow {
        fetched: bool,
        failed: Option<WorkflowError>,
    }

    impl Workflow for SlowFetchWorkflow {
        const TYPE: &'static str = "slow_fetch";
        type Input = Value;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self {
                fetched: false,
                failed: None,
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity_with_options(
                "fetch",
                "fetch_rates",
                json!({}),
                crate::workflow::ActivityOptions::default()
                    .with_start_to_close_timeout(Duration::from_millis(100)),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: Value,
        ) -> Vec<WorkflowAction> {
            self.fetched = true;
            vec![WorkflowAction::complete(json!({}))]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            error: &crate::activity::ActivityError,
        ) -> Vec<WorkflowAction> {
            let message = if error.timed_out {
                "rate fetch timed out"
            } else {
                "rate fetch failed"
            };
            let err = WorkflowError::new(message);
            self.failed = Some(err.clone());
            vec![WorkflowAction::fail(err)]
        }

        fn is_completed(&self) -> bool {
            self.fetched || self.failed.is_some()
        }

        fn result(&self) -> Option<Self::Output> {
            self.fetched.then(|| json!({}))
        }

        fn error(&self) -> Option<WorkflowError> {
            self.failed.clone()
        }
    }

    #[tokio::test]
    async fn test_unresponsive_activity_times_out_at_start_to_close() {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<SlowFetchWorkflow>();
        let engine = Arc::new(engine);
        let store = Arc::clone(engine.store());

        let config = WorkerPoolConfig::new("rates")
            .with_poller(PollerConfig::default().with_min_interval(Duration::from_millis(10)));
        let pool = WorkerPool::new(Arc::clone(&engine), config);

        // Handler never responds; the start-to-close deadline must cut it off
        pool.register_handler("fetch_rates", |_ctx, _input| async move {
            futures::future::pending::<Result<Value, ActivityError>>().await
        });

        pool.start().await.unwrap();

        engine
            .start_workflow::<SlowFetchWorkflow>("rates_1", "rates", json!({}))
            .await
            .unwrap();

        let status = wait_for_terminal(&store, "rates_1").await;
        assert_eq!(status, ProcessStatus::Failed);

        // The decision function saw a timed-out error, not a plain failure
        let info = store.get_instance("rates_1").await.unwrap();
        assert_eq!(
            info.error.map(|e| e.message),
            Some("rate fetch timed out".to_string())
        );

        let events = store.load_events("rates_1").await.unwrap();
        assert!(events.iter().any(|(_, e)| matches!(
            e,
            crate::workflow::WorkflowEvent::ActivityTimedOut {
                timeout_type: crate::workflow::TimeoutType::StartToClose,
                ..
            }
        )));

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_registered_after_start_is_claimed() {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<GreetingWorkflow>();
        let engine = Arc::new(engine);
        let store = Arc::clone(engine.store());

        let config = WorkerPoolConfig::new("greetings")
            .with_poller(PollerConfig::default().with_min_interval(Duration::from_millis(10)));
        let pool = WorkerPool::new(Arc::clone(&engine), config);

        // Pool is already polling before any handler exists
        pool.start().await.unwrap();

        engine
            .start_workflow::<GreetingWorkflow>(
                "greet_3",
                "greetings",
                GreetInput {
                    name: "Grace".to_string(),
                },
            )
            .await
            .unwrap();

        pool.register_handler("compose_greeting", |_ctx, input| async move {
            let name = input["name"].as_str().unwrap_or("world").to_string();
            Ok(json!(format!("Hello, {name}!")))
        });

        let status = wait_for_terminal(&store, "greet_3").await;
        assert_eq!(status, ProcessStatus::Completed);

        let info = store.get_instance("greet_3").await.unwrap();
        assert_eq!(info.result, Some(json!("Hello, Grace!")));

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let engine = Arc::new(WorkflowEngine::new(InMemoryProcessStore::new()));
        let pool = WorkerPool::new(engine, WorkerPoolConfig::default());

        pool.start().await.unwrap();
        assert!(matches!(
            pool.start().await,
            Err(WorkerPoolError::AlreadyRunning)
        ));
        pool.shutdown().await.unwrap();
    }
}
