//! ProcessStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActivityOptions, WorkflowEvent, WorkflowSignal};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Process instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Instance already exists with a conflicting definition
    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Timer not found
    #[error("timer not found: {0}")]
    TimerNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Process instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Instance is running (or suspended waiting on a signal or timer)
    Running,

    /// Instance completed successfully
    Completed,

    /// Instance failed
    Failed,

    /// Instance was terminated by an external caller
    Terminated,
}

impl ProcessStatus {
    /// Whether the instance has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub instance_id: String,
    pub task_queue: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub instance_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Response from heartbeat operation
#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted
    pub accepted: bool,

    /// Whether cancellation was requested
    pub should_cancel: bool,
}

/// Outcome of failing a task
#[derive(Debug, Clone)]
pub enum TaskFailureOutcome {
    /// Task will be retried after the delay
    WillRetry { next_attempt: u32, delay: Duration },

    /// No attempts remain (or the error was non-retryable); the final
    /// failure goes to the decision function
    ExhaustedRetries,
}

/// A pending task whose schedule-to-start deadline has elapsed
#[derive(Debug, Clone)]
pub struct ExpiredTask {
    pub task_id: Uuid,
    pub instance_id: String,
    pub activity_id: String,
}

/// A durable timer that is due to fire
#[derive(Debug, Clone)]
pub struct DueTimer {
    pub id: Uuid,
    pub instance_id: String,
    pub timer_id: String,
}

/// Process instance information
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: ProcessStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<crate::workflow::WorkflowError>,
    pub started_at: DateTime<Utc>,
}

/// Store for process histories, the task queue, timers, and signal inboxes
///
/// This trait defines the interface for persisting instance state.
/// Implementations must be thread-safe and support concurrent access.
/// History appends carry an expected sequence number; a mismatch means
/// another executor got there first and the caller must re-replay.
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create a new process instance
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the instance id is taken,
    /// regardless of the existing instance's status. Callers that want
    /// idempotent starts inspect the existing instance themselves.
    async fn create_instance(
        &self,
        instance_id: &str,
        workflow_type: &str,
        task_queue: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Get instance status
    async fn get_instance_status(&self, instance_id: &str) -> Result<ProcessStatus, StoreError>;

    /// Get full instance info
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, StoreError>;

    /// Append events to an instance history (with optimistic concurrency)
    ///
    /// Returns the new sequence number after appending.
    async fn append_events(
        &self,
        instance_id: &str,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError>;

    /// Load all events for an instance, in sequence order (for replay)
    async fn load_events(
        &self,
        instance_id: &str,
    ) -> Result<Vec<(i64, WorkflowEvent)>, StoreError>;

    /// Update instance status
    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: ProcessStatus,
        result: Option<serde_json::Value>,
        error: Option<crate::workflow::WorkflowError>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue an activity task on its instance's task queue
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Claim pending tasks for execution
    ///
    /// Only tasks on `task_queue` matching one of `activity_types` whose
    /// retry backoff has elapsed are eligible.
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Record task heartbeat
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Complete a task successfully
    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Fail a task
    ///
    /// If attempts remain and the error is retryable the task is requeued
    /// with a backoff delay; otherwise the failure is final.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Mark a task as timed out (terminal, never retried)
    async fn timeout_task(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Cancel all non-terminal tasks belonging to an instance
    ///
    /// Claimed tasks are flagged so the next heartbeat reports
    /// `should_cancel`; pending tasks are cancelled outright. Returns the
    /// ids of the cancelled pending tasks.
    async fn cancel_instance_tasks(&self, instance_id: &str) -> Result<Vec<Uuid>, StoreError>;

    /// Find and reclaim stale claimed tasks (no heartbeat)
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Find pending tasks whose schedule-to-start deadline has elapsed
    ///
    /// The returned tasks are marked timed out.
    async fn take_schedule_to_start_expired(&self) -> Result<Vec<ExpiredTask>, StoreError>;

    /// Find claimed tasks that outlived their configured heartbeat timeout
    ///
    /// Only tasks whose options carry a heartbeat timeout are eligible. The
    /// returned tasks are marked timed out.
    async fn take_heartbeat_expired(&self) -> Result<Vec<ExpiredTask>, StoreError>;

    // =========================================================================
    // Signal Operations
    // =========================================================================

    /// Push a signal onto an instance's inbox
    ///
    /// Signals queue per (instance, signal name) in arrival order; each is
    /// consumed by exactly one matching await.
    async fn push_signal(
        &self,
        instance_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), StoreError>;

    /// Pop the oldest queued signal with the given name, if any
    async fn pop_signal(
        &self,
        instance_id: &str,
        signal_name: &str,
    ) -> Result<Option<WorkflowSignal>, StoreError>;

    // =========================================================================
    // Timer Operations
    // =========================================================================

    /// Schedule a durable timer
    async fn schedule_timer(
        &self,
        instance_id: &str,
        timer_id: &str,
        fires_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError>;

    /// Get timers whose fire time has passed
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError>;

    /// Mark a timer as fired
    async fn complete_timer(&self, timer_id: Uuid) -> Result<(), StoreError>;

    /// Cancel all pending timers for an instance
    async fn cancel_instance_timers(&self, instance_id: &str) -> Result<(), StoreError>;
}
