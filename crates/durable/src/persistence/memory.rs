//! In-memory implementation of ProcessStore for testing

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{WorkflowError, WorkflowEvent, WorkflowSignal};

/// Internal instance state
struct InstanceState {
    workflow_type: String,
    task_queue: String,
    status: ProcessStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    events: Vec<WorkflowEvent>,
    signals: VecDeque<WorkflowSignal>,
    started_at: DateTime<Utc>,
}

/// Internal task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    claimed_by: Option<String>,
    enqueued_at: DateTime<Utc>,
    next_attempt_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
    last_error: Option<String>,
}

/// Internal timer state
struct TimerState {
    instance_id: String,
    timer_id: String,
    fires_at: DateTime<Utc>,
    fired: bool,
}

/// In-memory implementation of ProcessStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use windlass_durable::InMemoryProcessStore;
///
/// let store = InMemoryProcessStore::new();
/// ```
pub struct InMemoryProcessStore {
    instances: RwLock<HashMap<String, InstanceState>>,
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    timers: RwLock<HashMap<Uuid, TimerState>>,
}

impl InMemoryProcessStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Get the number of queued signals for an instance
    pub fn queued_signal_count(&self, instance_id: &str) -> usize {
        self.instances
            .read()
            .get(instance_id)
            .map(|i| i.signals.len())
            .unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
        self.tasks.write().clear();
        self.timers.write().clear();
    }
}

impl Default for InMemoryProcessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn create_instance(
        &self,
        instance_id: &str,
        workflow_type: &str,
        task_queue: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(instance_id) {
            return Err(StoreError::AlreadyExists(instance_id.to_string()));
        }
        instances.insert(
            instance_id.to_string(),
            InstanceState {
                workflow_type: workflow_type.to_string(),
                task_queue: task_queue.to_string(),
                status: ProcessStatus::Running,
                input,
                result: None,
                error: None,
                events: vec![],
                signals: VecDeque::new(),
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_instance_status(&self, instance_id: &str) -> Result<ProcessStatus, StoreError> {
        let instances = self.instances.read();
        instances
            .get(instance_id)
            .map(|i| i.status)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, StoreError> {
        let instances = self.instances.read();
        let instance = instances
            .get(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        Ok(InstanceInfo {
            id: instance_id.to_string(),
            workflow_type: instance.workflow_type.clone(),
            task_queue: instance.task_queue.clone(),
            status: instance.status,
            input: instance.input.clone(),
            result: instance.result.clone(),
            error: instance.error.clone(),
            started_at: instance.started_at,
        })
    }

    async fn append_events(
        &self,
        instance_id: &str,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let current_sequence = instance.events.len() as i64;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        instance.events.extend(events);
        Ok(instance.events.len() as i64)
    }

    async fn load_events(
        &self,
        instance_id: &str,
    ) -> Result<Vec<(i64, WorkflowEvent)>, StoreError> {
        let instances = self.instances.read();
        let instance = instances
            .get(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        Ok(instance
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i64, e.clone()))
            .collect())
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: ProcessStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        instance.status = status;
        instance.result = result;
        instance.error = error;
        Ok(())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        tasks.insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                claimed_by: None,
                enqueued_at: now,
                next_attempt_at: now,
                last_heartbeat_at: None,
                cancel_requested: false,
                last_error: None,
            },
        );
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let mut claimed = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if claimed.len() >= max_tasks {
                break;
            }

            if task.status == TaskStatus::Pending
                && task.definition.task_queue == task_queue
                && activity_types.contains(&task.definition.activity_type)
                && task.next_attempt_at <= now
            {
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(worker_id.to_string());
                task.attempt += 1;
                task.last_heartbeat_at = Some(now);

                claimed.push(ClaimedTask {
                    id: *task_id,
                    instance_id: task.definition.instance_id.clone(),
                    activity_id: task.definition.activity_id.clone(),
                    activity_type: task.definition.activity_type.clone(),
                    input: task.definition.input.clone(),
                    options: task.definition.options.clone(),
                    attempt: task.attempt,
                    max_attempts: task.definition.options.retry_policy.max_attempts,
                });
            }
        }

        Ok(claimed)
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        _worker_id: &str,
        _details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.last_heartbeat_at = Some(Utc::now());

        Ok(HeartbeatResponse {
            accepted: task.status == TaskStatus::Claimed,
            should_cancel: task.cancel_requested,
        })
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.status = TaskStatus::Completed;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.last_error = Some(error.to_string());

        let policy = &task.definition.options.retry_policy;
        if retryable && policy.has_attempts_remaining(task.attempt) {
            let delay = policy.delay_for_attempt(task.attempt + 1);
            task.status = TaskStatus::Pending;
            task.claimed_by = None;
            task.next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            Ok(TaskFailureOutcome::WillRetry {
                next_attempt: task.attempt + 1,
                delay,
            })
        } else {
            task.status = TaskStatus::Failed;
            Ok(TaskFailureOutcome::ExhaustedRetries)
        }
    }

    async fn timeout_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.status = TaskStatus::TimedOut;
        Ok(())
    }

    async fn cancel_instance_tasks(&self, instance_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let mut tasks = self.tasks.write();
        let mut cancelled = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if task.definition.instance_id != instance_id {
                continue;
            }
            match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::Cancelled;
                    cancelled.push(*task_id);
                }
                TaskStatus::Claimed => {
                    task.cancel_requested = true;
                }
                _ => {}
            }
        }

        Ok(cancelled)
    }

    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold).unwrap_or(chrono::Duration::zero());
        let mut tasks = self.tasks.write();
        let mut reclaimed = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if task.status == TaskStatus::Claimed
                && task.last_heartbeat_at.map(|t| t < cutoff).unwrap_or(true)
            {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                reclaimed.push(*task_id);
            }
        }

        Ok(reclaimed)
    }

    async fn take_schedule_to_start_expired(&self) -> Result<Vec<ExpiredTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let mut expired = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if task.status != TaskStatus::Pending || task.attempt > 0 {
                continue;
            }
            let deadline = task.enqueued_at
                + chrono::Duration::from_std(task.definition.options.schedule_to_start_timeout)
                    .unwrap_or(chrono::Duration::zero());
            if deadline <= now {
                task.status = TaskStatus::TimedOut;
                expired.push(ExpiredTask {
                    task_id: *task_id,
                    instance_id: task.definition.instance_id.clone(),
                    activity_id: task.definition.activity_id.clone(),
                });
            }
        }

        Ok(expired)
    }

    async fn take_heartbeat_expired(&self) -> Result<Vec<ExpiredTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let mut expired = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if task.status != TaskStatus::Claimed {
                continue;
            }
            let Some(heartbeat_timeout) = task.definition.options.heartbeat_timeout else {
                continue;
            };
            let cutoff = now
                - chrono::Duration::from_std(heartbeat_timeout)
                    .unwrap_or(chrono::Duration::zero());
            if task.last_heartbeat_at.map(|t| t <= cutoff).unwrap_or(true) {
                task.status = TaskStatus::TimedOut;
                expired.push(ExpiredTask {
                    task_id: *task_id,
                    instance_id: task.definition.instance_id.clone(),
                    activity_id: task.definition.activity_id.clone(),
                });
            }
        }

        Ok(expired)
    }

    async fn push_signal(
        &self,
        instance_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        instance.signals.push_back(signal);
        Ok(())
    }

    async fn pop_signal(
        &self,
        instance_id: &str,
        signal_name: &str,
    ) -> Result<Option<WorkflowSignal>, StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let pos = instance
            .signals
            .iter()
            .position(|s| s.signal_name == signal_name);

        Ok(pos.and_then(|p| instance.signals.remove(p)))
    }

    async fn schedule_timer(
        &self,
        instance_id: &str,
        timer_id: &str,
        fires_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        self.timers.write().insert(
            id,
            TimerState {
                instance_id: instance_id.to_string(),
                timer_id: timer_id.to_string(),
                fires_at,
                fired: false,
            },
        );
        Ok(id)
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError> {
        let timers = self.timers.read();
        let mut due: Vec<_> = timers
            .iter()
            .filter(|(_, t)| !t.fired && t.fires_at <= now)
            .map(|(id, t)| DueTimer {
                id: *id,
                instance_id: t.instance_id.clone(),
                timer_id: t.timer_id.clone(),
            })
            .collect();

        due.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(due)
    }

    async fn complete_timer(&self, timer_id: Uuid) -> Result<(), StoreError> {
        let mut timers = self.timers.write();
        let timer = timers
            .get_mut(&timer_id)
            .ok_or(StoreError::TimerNotFound(timer_id))?;

        timer.fired = true;
        Ok(())
    }

    async fn cancel_instance_timers(&self, instance_id: &str) -> Result<(), StoreError> {
        let mut timers = self.timers.write();
        timers.retain(|_, t| t.instance_id != instance_id);
        Ok(())
    }
}
