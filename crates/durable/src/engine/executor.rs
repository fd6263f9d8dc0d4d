//! Process engine with replay support
//!
//! The `WorkflowEngine` is responsible for:
//! - Starting new process instances (idempotent by instance id)
//! - Replaying instances from event history
//! - Processing decision actions (scheduling activities, timers, awaits)
//! - Routing signals into suspended instances
//! - Terminating instances and cancelling their outstanding work

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::activity::ActivityError;
use crate::persistence::{ProcessStatus, ProcessStore, StoreError, TaskDefinition};
use crate::workflow::{
    TimeoutType, WorkflowAction, WorkflowContext, WorkflowEvent, WorkflowSignal,
};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Configuration for the process engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum events per instance (for safety)
    pub max_events_per_instance: usize,

    /// Attempts for a decision pass that loses the optimistic-append race
    pub max_append_attempts: u32,

    /// Base backoff between append attempts
    pub append_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events_per_instance: 10000,
            max_append_attempts: 3,
            append_backoff: Duration::from_millis(50),
        }
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Instance already exists with a different definition
    #[error("instance {0} already exists with a different input")]
    AlreadyExists(String),

    /// Instance already reached a terminal state
    #[error("instance {0} already completed")]
    InstanceCompleted(String),

    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Replay error (corrupt history or non-determinism detected)
    #[error("replay error: {0}")]
    ReplayError(String),

    /// Too many events
    #[error("instance {0} has too many events ({1} > {2})")]
    TooManyEvents(String, usize, usize),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of starting an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new instance was created
    Started,

    /// An instance with the same id and input already exists; the start was
    /// absorbed without side effects
    AlreadyRunning,
}

/// Result of a decision pass over an instance
#[derive(Debug)]
pub struct ProcessResult {
    /// Whether the instance has reached a terminal state
    pub completed: bool,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,

    /// Number of signals matched to awaits
    pub signals_matched: usize,
}

/// Process engine
///
/// The engine drives instance state machines by replaying histories and
/// processing the actions their decision functions return. Optimistic
/// concurrency on the history append is the only synchronization between
/// competing executors: a lost race surfaces as a conflict and the whole
/// decision pass is retried against the longer history.
///
/// # Example
///
/// ```ignore
/// use windlass_durable::prelude::*;
///
/// let store = InMemoryProcessStore::new();
/// let mut engine = WorkflowEngine::new(store);
/// engine.register::<OrderProcessing>();
///
/// engine
///     .start_workflow::<OrderProcessing>("order_1", "order-processing", input)
///     .await?;
/// ```
pub struct WorkflowEngine<S: ProcessStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: EngineConfig,
}

impl<S: ProcessStore> WorkflowEngine<S> {
    /// Create a new engine with the given store
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            registry: WorkflowRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    /// Create a new engine with custom config
    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self {
            store: Arc::new(store),
            registry: WorkflowRegistry::new(),
            config,
        }
    }

    /// Register a workflow type
    pub fn register<W: crate::workflow::Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Start a new process instance of a registered workflow type
    ///
    /// Starts are idempotent: a second start with the same instance id and
    /// the same input is absorbed and reports [`StartOutcome::AlreadyRunning`].
    /// A start reusing the id with a different input is rejected, including
    /// when the existing instance already finished.
    #[instrument(skip(self, input), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: crate::workflow::Workflow>(
        &self,
        instance_id: &str,
        task_queue: &str,
        input: W::Input,
    ) -> Result<StartOutcome, EngineError> {
        let input_json = serde_json::to_value(&input)?;
        self.start_by_type(W::TYPE, instance_id, task_queue, input_json)
            .await
    }

    /// Start an instance by workflow type name
    ///
    /// Used by callers that only hold the type name, such as the gateway and
    /// the cron scheduler.
    #[instrument(skip(self, input))]
    pub async fn start_by_type(
        &self,
        workflow_type: &str,
        instance_id: &str,
        task_queue: &str,
        input: serde_json::Value,
    ) -> Result<StartOutcome, EngineError> {
        match self
            .store
            .create_instance(instance_id, workflow_type, task_queue, input.clone())
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                let existing = self.store.get_instance(instance_id).await?;
                if existing.workflow_type == workflow_type && existing.input == input {
                    debug!(%instance_id, "start absorbed by existing instance");
                    return Ok(StartOutcome::AlreadyRunning);
                }
                return Err(EngineError::AlreadyExists(instance_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(%instance_id, %workflow_type, "starting new instance");

        let start_event = WorkflowEvent::ProcessStarted {
            input: input.clone(),
        };
        self.store
            .append_events(instance_id, 0, vec![start_event])
            .await?;

        let mut workflow = self.registry.create(workflow_type, input)?;
        let mut ctx = WorkflowContext::default();
        let actions = workflow.on_start(&mut ctx);

        let task_queue = task_queue.to_string();
        let sequence = self.drain_markers(instance_id, 1, &mut ctx).await?;
        self.process_actions(instance_id, &task_queue, &mut *workflow, &mut ctx, sequence, actions)
            .await?;

        Ok(StartOutcome::Started)
    }

    /// Process an instance after external events (activity outcomes, timer
    /// fires, signal arrivals)
    ///
    /// Replays the instance from its history, matches queued signals against
    /// pending awaits, and processes any resulting actions. Append conflicts
    /// restart the pass against the longer history.
    #[instrument(skip(self))]
    pub async fn process_instance(
        &self,
        instance_id: &str,
    ) -> Result<ProcessResult, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.process_instance_once(instance_id).await {
                Err(EngineError::Store(StoreError::ConcurrencyConflict { expected, actual }))
                    if attempt < self.config.max_append_attempts =>
                {
                    warn!(
                        %instance_id,
                        expected, actual, attempt,
                        "append conflict, retrying decision pass"
                    );
                    tokio::time::sleep(self.config.append_backoff * attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Send a signal to an instance
    ///
    /// The signal is queued in the instance's inbox and a decision pass runs
    /// to match it against a pending await. Unawaited signals stay queued.
    #[instrument(skip(self, signal))]
    pub async fn send_signal(
        &self,
        instance_id: &str,
        signal: WorkflowSignal,
    ) -> Result<ProcessResult, EngineError> {
        let status = self.store.get_instance_status(instance_id).await?;
        if status.is_terminal() {
            warn!(%instance_id, %status, "cannot signal a finished instance");
            return Err(EngineError::InstanceCompleted(instance_id.to_string()));
        }

        self.store.push_signal(instance_id, signal).await?;
        debug!(%instance_id, "signal queued");

        self.process_instance(instance_id).await
    }

    /// Terminate an instance
    ///
    /// Records the termination, moves the instance to the terminal
    /// `Terminated` status, and cancels its outstanding tasks and timers.
    /// In-flight activities are asked to stop via heartbeat cancellation.
    #[instrument(skip(self))]
    pub async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), EngineError> {
        let status = self.store.get_instance_status(instance_id).await?;
        if status.is_terminal() {
            return Err(EngineError::InstanceCompleted(instance_id.to_string()));
        }

        let events = self.store.load_events(instance_id).await?;
        let sequence = events.len() as i64;

        self.store
            .append_events(
                instance_id,
                sequence,
                vec![WorkflowEvent::ProcessTerminated {
                    reason: reason.to_string(),
                }],
            )
            .await?;

        self.store
            .update_instance_status(instance_id, ProcessStatus::Terminated, None, None)
            .await?;

        let cancelled = self.store.cancel_instance_tasks(instance_id).await?;
        self.store.cancel_instance_timers(instance_id).await?;

        info!(%instance_id, reason, cancelled = cancelled.len(), "instance terminated");
        Ok(())
    }

    /// Record that a worker picked up an activity attempt
    ///
    /// Informational; the event is not replayed into the decision function.
    #[instrument(skip(self))]
    pub async fn on_activity_started(
        &self,
        instance_id: &str,
        activity_id: &str,
        attempt: u32,
        worker_id: &str,
    ) -> Result<(), EngineError> {
        self.append_report(
            instance_id,
            WorkflowEvent::ActivityStarted {
                activity_id: activity_id.to_string(),
                attempt,
                worker_id: worker_id.to_string(),
            },
            |_| false,
        )
        .await?;
        Ok(())
    }

    /// Handle activity completion
    ///
    /// Called by the worker pool when an activity completes successfully.
    /// Duplicate reports for an activity that already has a recorded outcome
    /// are dropped, which is what keeps side effects at-most-once per
    /// activity id.
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        &self,
        instance_id: &str,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<ProcessResult, EngineError> {
        let appended = self
            .append_report(
                instance_id,
                WorkflowEvent::ActivityCompleted {
                    activity_id: activity_id.to_string(),
                    result,
                },
                |events| has_activity_outcome(events, activity_id),
            )
            .await?;
        if !appended {
            debug!(%instance_id, %activity_id, "duplicate completion report ignored");
            return Ok(noop_result());
        }

        self.process_instance(instance_id).await
    }

    /// Handle activity failure
    ///
    /// Called by the worker pool when an activity attempt fails. Only final
    /// failures (no further retries) reach the decision function.
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        &self,
        instance_id: &str,
        activity_id: &str,
        error: ActivityError,
        will_retry: bool,
    ) -> Result<ProcessResult, EngineError> {
        let appended = self
            .append_report(
                instance_id,
                WorkflowEvent::ActivityFailed {
                    activity_id: activity_id.to_string(),
                    error,
                    will_retry,
                },
                |events| !will_retry && has_activity_outcome(events, activity_id),
            )
            .await?;
        if !appended {
            debug!(%instance_id, %activity_id, "duplicate failure report ignored");
            return Ok(noop_result());
        }

        if !will_retry {
            self.process_instance(instance_id).await
        } else {
            Ok(ProcessResult {
                completed: false,
                events_written: 1,
                tasks_enqueued: 0,
                signals_matched: 0,
            })
        }
    }

    /// Handle activity timeout
    ///
    /// Timeouts are terminal for the invocation and are delivered to the
    /// decision function as a distinct, timed-out failure.
    #[instrument(skip(self))]
    pub async fn on_activity_timed_out(
        &self,
        instance_id: &str,
        activity_id: &str,
        timeout_type: TimeoutType,
    ) -> Result<ProcessResult, EngineError> {
        let appended = self
            .append_report(
                instance_id,
                WorkflowEvent::ActivityTimedOut {
                    activity_id: activity_id.to_string(),
                    timeout_type,
                },
                |events| has_activity_outcome(events, activity_id),
            )
            .await?;
        if !appended {
            debug!(%instance_id, %activity_id, "duplicate timeout report ignored");
            return Ok(noop_result());
        }

        self.process_instance(instance_id).await
    }

    /// Handle timer fired
    #[instrument(skip(self))]
    pub async fn on_timer_fired(
        &self,
        instance_id: &str,
        timer_id: &str,
    ) -> Result<ProcessResult, EngineError> {
        let appended = self
            .append_report(
                instance_id,
                WorkflowEvent::TimerFired {
                    timer_id: timer_id.to_string(),
                },
                |events| {
                    events.iter().any(|(_, e)| {
                        matches!(e, WorkflowEvent::TimerFired { timer_id: t } if t == timer_id)
                    })
                },
            )
            .await?;
        if !appended {
            debug!(%instance_id, %timer_id, "duplicate timer fire ignored");
            return Ok(noop_result());
        }

        self.process_instance(instance_id).await
    }

    /// Append an externally reported event at the current history head
    ///
    /// Returns false if `already_recorded` says the report is a duplicate.
    /// A lost optimistic-append race means another reporter grew the history,
    /// so conflicts reload and re-run the duplicate check before appending at
    /// the new head; every iteration either appends, detects a duplicate, or
    /// observes progress by someone else. Transient store failures are
    /// retried with capped backoff before giving up.
    async fn append_report<F>(
        &self,
        instance_id: &str,
        event: WorkflowEvent,
        already_recorded: F,
    ) -> Result<bool, EngineError>
    where
        F: Fn(&[(i64, WorkflowEvent)]) -> bool,
    {
        let mut transient_failures = 0;
        loop {
            let attempt: Result<bool, StoreError> = async {
                let events = self.store.load_events(instance_id).await?;
                if already_recorded(&events) {
                    return Ok(false);
                }
                let sequence = events.len() as i64;
                self.store
                    .append_events(instance_id, sequence, vec![event.clone()])
                    .await?;
                Ok(true)
            }
            .await;

            match attempt {
                Ok(appended) => return Ok(appended),
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    warn!(
                        %instance_id,
                        expected, actual,
                        "outcome report lost append race, re-reading history"
                    );
                }
                Err(e @ StoreError::Database(_))
                    if transient_failures < self.config.max_append_attempts =>
                {
                    transient_failures += 1;
                    warn!(
                        %instance_id,
                        attempt = transient_failures,
                        "store unavailable while reporting outcome: {}", e
                    );
                    let backoff = self.config.append_backoff * transient_failures;
                    tokio::time::sleep(backoff.min(Duration::from_secs(5))).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn process_instance_once(
        &self,
        instance_id: &str,
    ) -> Result<ProcessResult, EngineError> {
        let info = self.store.get_instance(instance_id).await?;

        if info.status.is_terminal() {
            debug!(%instance_id, status = %info.status, "instance already terminal");
            return Ok(ProcessResult {
                completed: true,
                events_written: 0,
                tasks_enqueued: 0,
                signals_matched: 0,
            });
        }

        let events = self.store.load_events(instance_id).await?;
        if events.is_empty() {
            return Err(EngineError::InstanceNotFound(instance_id.to_string()));
        }
        if events.len() > self.config.max_events_per_instance {
            return Err(EngineError::TooManyEvents(
                instance_id.to_string(),
                events.len(),
                self.config.max_events_per_instance,
            ));
        }
        if !matches!(&events[0].1, WorkflowEvent::ProcessStarted { .. }) {
            return Err(EngineError::ReplayError(
                "first event must be ProcessStarted".to_string(),
            ));
        }

        let mut workflow = self
            .registry
            .create(&info.workflow_type, info.input.clone())?;

        // Markers are seeded before replay so version() calls inside replayed
        // callbacks see the recorded choices.
        let mut markers = HashMap::new();
        for (_, event) in &events {
            if let WorkflowEvent::VersionMarked { change_id, version } = event {
                markers.insert(change_id.clone(), *version);
            }
        }
        let mut ctx = WorkflowContext::new(markers);

        // Replay all events to rebuild state. Actions a callback re-issues
        // for effects already recorded in history are dropped; actions whose
        // effect is NOT yet recorded (they come from the newest event) are
        // collected and processed after the replay.
        let mut recorded = RecordedEffects::from_history(&events);
        let mut pending_awaits: VecDeque<String> = VecDeque::new();
        let mut new_actions: Vec<WorkflowAction> = Vec::new();
        for (_, event) in &events {
            let actions =
                self.replay_event(&mut *workflow, &mut ctx, &mut pending_awaits, event);
            for action in actions {
                if recorded.absorb(&action) {
                    new_actions.push(action);
                }
            }
        }

        let mut sequence = events.len() as i64;
        let mut events_written = 0;
        let mut tasks_enqueued = 0;
        let mut signals_matched = 0;

        debug!(
            %instance_id,
            sequence,
            pending_awaits = pending_awaits.len(),
            new_actions = new_actions.len(),
            "replayed history"
        );

        // Version markers first requested during replay of old events come
        // from newly deployed code paths; persist them for the next replay.
        let after_markers = self.drain_markers(instance_id, sequence, &mut ctx).await?;
        events_written += (after_markers - sequence) as usize;
        sequence = after_markers;

        if !new_actions.is_empty() {
            let (new_seq, written, enqueued, awaits) = self
                .process_actions_internal(
                    instance_id,
                    &info.task_queue,
                    &mut *workflow,
                    &mut ctx,
                    sequence,
                    new_actions,
                )
                .await?;
            sequence = new_seq;
            events_written += written;
            tasks_enqueued += enqueued;
            pending_awaits.extend(awaits);
        }

        // Match queued signals against pending awaits, oldest await first.
        while let Some(signal_name) = pending_awaits.pop_front() {
            let Some(signal) = self.store.pop_signal(instance_id, &signal_name).await? else {
                // Still waiting; leave the await pending.
                pending_awaits.push_front(signal_name);
                break;
            };

            sequence = self
                .store
                .append_events(
                    instance_id,
                    sequence,
                    vec![WorkflowEvent::SignalReceived {
                        signal: signal.clone(),
                    }],
                )
                .await?;
            events_written += 1;
            signals_matched += 1;

            let actions = workflow.on_signal(&mut ctx, &signal);
            sequence = self.drain_markers(instance_id, sequence, &mut ctx).await?;

            let (new_seq, written, enqueued, awaits) = self
                .process_actions_internal(
                    instance_id,
                    &info.task_queue,
                    &mut *workflow,
                    &mut ctx,
                    sequence,
                    actions,
                )
                .await?;
            sequence = new_seq;
            events_written += written;
            tasks_enqueued += enqueued;
            pending_awaits.extend(awaits);
        }

        let completed = workflow.is_completed();
        if completed {
            if let Some(result) = workflow.result_json() {
                self.store
                    .update_instance_status(
                        instance_id,
                        ProcessStatus::Completed,
                        Some(result),
                        None,
                    )
                    .await?;
            } else if let Some(error) = workflow.error() {
                self.store
                    .update_instance_status(
                        instance_id,
                        ProcessStatus::Failed,
                        None,
                        Some(error),
                    )
                    .await?;
            }
        }

        Ok(ProcessResult {
            completed,
            events_written,
            tasks_enqueued,
            signals_matched,
        })
    }

    /// Replay a single event on a workflow, returning the actions the
    /// callback re-issued
    fn replay_event(
        &self,
        workflow: &mut dyn AnyWorkflow,
        ctx: &mut WorkflowContext,
        pending_awaits: &mut VecDeque<String>,
        event: &WorkflowEvent,
    ) -> Vec<WorkflowAction> {
        match event {
            WorkflowEvent::ProcessStarted { .. } => workflow.on_start(ctx),

            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
            } => workflow.on_activity_completed(ctx, activity_id, result.clone()),

            WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                will_retry,
            } => {
                // Only final failures reach the decision function
                if !will_retry {
                    workflow.on_activity_failed(ctx, activity_id, error)
                } else {
                    vec![]
                }
            }

            WorkflowEvent::ActivityTimedOut {
                activity_id,
                timeout_type,
            } => {
                let error = match timeout_type {
                    TimeoutType::ScheduleToStart => {
                        ActivityError::timed_out("no worker claimed the activity in time")
                    }
                    TimeoutType::StartToClose => {
                        ActivityError::timed_out("start-to-close timeout elapsed")
                    }
                    TimeoutType::Heartbeat => {
                        ActivityError::timed_out("activity stopped heartbeating")
                    }
                };
                workflow.on_activity_failed(ctx, activity_id, &error)
            }

            WorkflowEvent::TimerFired { timer_id } => workflow.on_timer_fired(ctx, timer_id),

            WorkflowEvent::SignalAwaited { signal_name } => {
                pending_awaits.push_back(signal_name.clone());
                vec![]
            }

            WorkflowEvent::SignalReceived { signal } => {
                if let Some(pos) = pending_awaits
                    .iter()
                    .position(|n| n == &signal.signal_name)
                {
                    pending_awaits.remove(pos);
                }
                workflow.on_signal(ctx, signal)
            }

            // Markers were seeded before replay; the rest are informational
            WorkflowEvent::VersionMarked { .. }
            | WorkflowEvent::ProcessCompleted { .. }
            | WorkflowEvent::ProcessFailed { .. }
            | WorkflowEvent::ProcessTerminated { .. }
            | WorkflowEvent::ActivityScheduled { .. }
            | WorkflowEvent::ActivityStarted { .. }
            | WorkflowEvent::ActivityCancelled { .. }
            | WorkflowEvent::TimerStarted { .. } => vec![],
        }
    }

    /// Persist version markers first requested during the current pass
    async fn drain_markers(
        &self,
        instance_id: &str,
        mut sequence: i64,
        ctx: &mut WorkflowContext,
    ) -> Result<i64, EngineError> {
        let markers = ctx.take_new_markers();
        if markers.is_empty() {
            return Ok(sequence);
        }

        let events = markers
            .into_iter()
            .map(|(change_id, version)| WorkflowEvent::VersionMarked { change_id, version })
            .collect::<Vec<_>>();

        sequence = self
            .store
            .append_events(instance_id, sequence, events)
            .await?;
        Ok(sequence)
    }

    /// Process actions from a decision callback
    async fn process_actions(
        &self,
        instance_id: &str,
        task_queue: &str,
        workflow: &mut dyn AnyWorkflow,
        ctx: &mut WorkflowContext,
        sequence: i64,
        actions: Vec<WorkflowAction>,
    ) -> Result<(), EngineError> {
        let (_seq, _written, _enqueued, _awaits) = self
            .process_actions_internal(instance_id, task_queue, workflow, ctx, sequence, actions)
            .await?;
        Ok(())
    }

    /// Internal action processing that returns detailed results
    ///
    /// An `AwaitSignal` action checks the inbox immediately: if a matching
    /// signal is already queued it is consumed right away, which is how a
    /// signal sent before the await still unblocks the instance. Unsatisfied
    /// awaits are returned so the caller can track them.
    async fn process_actions_internal(
        &self,
        instance_id: &str,
        task_queue: &str,
        workflow: &mut dyn AnyWorkflow,
        ctx: &mut WorkflowContext,
        mut sequence: i64,
        actions: Vec<WorkflowAction>,
    ) -> Result<(i64, usize, usize, Vec<String>), EngineError> {
        let mut events_written = 0;
        let mut tasks_enqueued = 0;
        let mut unsatisfied_awaits = Vec::new();

        let mut queue: VecDeque<WorkflowAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(%instance_id, %activity_id, %activity_type, "scheduling activity");

                    let event = WorkflowEvent::ActivityScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(instance_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    self.store
                        .enqueue_task(TaskDefinition {
                            instance_id: instance_id.to_string(),
                            task_queue: task_queue.to_string(),
                            activity_id,
                            activity_type,
                            input,
                            options,
                        })
                        .await?;
                    tasks_enqueued += 1;
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    debug!(%instance_id, %timer_id, ?duration, "starting timer");

                    let event = WorkflowEvent::TimerStarted {
                        timer_id: timer_id.clone(),
                        duration_ms: duration.as_millis() as u64,
                    };
                    sequence = self
                        .store
                        .append_events(instance_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    let fires_at = Utc::now()
                        + chrono::Duration::from_std(duration)
                            .unwrap_or(chrono::Duration::zero());
                    self.store
                        .schedule_timer(instance_id, &timer_id, fires_at)
                        .await?;
                }

                WorkflowAction::AwaitSignal { signal_name } => {
                    debug!(%instance_id, %signal_name, "awaiting signal");

                    let event = WorkflowEvent::SignalAwaited {
                        signal_name: signal_name.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(instance_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    if let Some(signal) = self.store.pop_signal(instance_id, &signal_name).await?
                    {
                        sequence = self
                            .store
                            .append_events(
                                instance_id,
                                sequence,
                                vec![WorkflowEvent::SignalReceived {
                                    signal: signal.clone(),
                                }],
                            )
                            .await?;
                        events_written += 1;

                        let new_actions = workflow.on_signal(ctx, &signal);
                        sequence = self.drain_markers(instance_id, sequence, ctx).await?;

                        for action in new_actions.into_iter().rev() {
                            queue.push_front(action);
                        }
                    } else {
                        unsatisfied_awaits.push(signal_name);
                    }
                }

                WorkflowAction::CompleteProcess { result } => {
                    info!(%instance_id, "completing instance");

                    let event = WorkflowEvent::ProcessCompleted {
                        result: result.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(instance_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    self.store
                        .update_instance_status(
                            instance_id,
                            ProcessStatus::Completed,
                            Some(result),
                            None,
                        )
                        .await?;
                }

                WorkflowAction::FailProcess { error } => {
                    error!(%instance_id, error = %error.message, "failing instance");

                    let event = WorkflowEvent::ProcessFailed {
                        error: error.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(instance_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    self.store
                        .update_instance_status(
                            instance_id,
                            ProcessStatus::Failed,
                            None,
                            Some(error),
                        )
                        .await?;
                }

                WorkflowAction::CancelActivity { activity_id } => {
                    debug!(%instance_id, %activity_id, "cancelling activity");

                    let event = WorkflowEvent::ActivityCancelled {
                        activity_id,
                        reason: "cancelled by workflow".to_string(),
                    };
                    sequence = self
                        .store
                        .append_events(instance_id, sequence, vec![event])
                        .await?;
                    events_written += 1;
                }

                WorkflowAction::None => {}
            }
        }

        Ok((sequence, events_written, tasks_enqueued, unsatisfied_awaits))
    }
}

/// Ledger of effects already recorded in history, used during replay to
/// separate re-issued actions from genuinely new ones
struct RecordedEffects {
    scheduled: std::collections::HashSet<String>,
    timers: std::collections::HashSet<String>,
    cancelled: std::collections::HashSet<String>,
    awaited: HashMap<String, usize>,
    completed: bool,
    failed: bool,
}

impl RecordedEffects {
    fn from_history(events: &[(i64, WorkflowEvent)]) -> Self {
        let mut effects = Self {
            scheduled: Default::default(),
            timers: Default::default(),
            cancelled: Default::default(),
            awaited: HashMap::new(),
            completed: false,
            failed: false,
        };
        for (_, event) in events {
            match event {
                WorkflowEvent::ActivityScheduled { activity_id, .. } => {
                    effects.scheduled.insert(activity_id.clone());
                }
                WorkflowEvent::TimerStarted { timer_id, .. } => {
                    effects.timers.insert(timer_id.clone());
                }
                WorkflowEvent::ActivityCancelled { activity_id, .. } => {
                    effects.cancelled.insert(activity_id.clone());
                }
                WorkflowEvent::SignalAwaited { signal_name } => {
                    *effects.awaited.entry(signal_name.clone()).or_default() += 1;
                }
                WorkflowEvent::ProcessCompleted { .. } => effects.completed = true,
                WorkflowEvent::ProcessFailed { .. } => effects.failed = true,
                _ => {}
            }
        }
        effects
    }

    /// Returns true if the action is new (its effect is not in history).
    /// Recorded effects are consumed so a repeated await of the same name
    /// only matches as many times as history shows.
    fn absorb(&mut self, action: &WorkflowAction) -> bool {
        match action {
            WorkflowAction::ScheduleActivity { activity_id, .. } => {
                !self.scheduled.contains(activity_id)
            }
            WorkflowAction::StartTimer { timer_id, .. } => !self.timers.contains(timer_id),
            WorkflowAction::CancelActivity { activity_id } => {
                !self.cancelled.contains(activity_id)
            }
            WorkflowAction::AwaitSignal { signal_name } => {
                match self.awaited.get_mut(signal_name) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        false
                    }
                    _ => true,
                }
            }
            WorkflowAction::CompleteProcess { .. } => !self.completed,
            WorkflowAction::FailProcess { .. } => !self.failed,
            WorkflowAction::None => false,
        }
    }
}

fn has_activity_outcome(events: &[(i64, WorkflowEvent)], activity_id: &str) -> bool {
    events.iter().any(|(_, e)| match e {
        WorkflowEvent::ActivityCompleted { activity_id: id, .. }
        | WorkflowEvent::ActivityTimedOut { activity_id: id, .. }
        | WorkflowEvent::ActivityCancelled { activity_id: id, .. } => id == activity_id,
        WorkflowEvent::ActivityFailed {
            activity_id: id,
            will_retry,
            ..
        } => id == activity_id && !will_retry,
        _ => false,
    })
}

fn noop_result() -> ProcessResult {
    ProcessResult {
        completed: false,
        events_written: 0,
        tasks_enqueued: 0,
        signals_matched: 0,
    }
}
