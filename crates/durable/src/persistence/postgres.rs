//! PostgreSQL implementation of ProcessStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via sequence numbers
//! - Efficient task claiming with SKIP LOCKED
//! - Event sourcing for instance replay
//!
//! Schema lives in the crate's `migrations/` directory.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{ActivityOptions, WorkflowError, WorkflowEvent, WorkflowSignal};

/// PostgreSQL implementation of ProcessStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use windlass_durable::PostgresProcessStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresProcessStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresProcessStore {
    pool: PgPool,
}

impl PostgresProcessStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    #[instrument(skip(self, input))]
    async fn create_instance(
        &self,
        instance_id: &str,
        workflow_type: &str,
        task_queue: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO durable_instances (id, workflow_type, task_queue, status, input)
            VALUES ($1, $2, $3, 'running', $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(workflow_type)
        .bind(task_queue)
        .bind(&input)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(instance_id.to_string()));
        }

        debug!(%instance_id, %workflow_type, %task_queue, "created instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance_status(&self, instance_id: &str) -> Result<ProcessStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM durable_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get instance status: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let status: String = row.get("status");
        parse_process_status(&status)
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, task_queue, status, input, result, error, started_at
            FROM durable_instances
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get instance: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let status_str: String = row.get("status");
        let error_json: Option<serde_json::Value> = row.get("error");

        Ok(InstanceInfo {
            id: row.get("id"),
            workflow_type: row.get("workflow_type"),
            task_queue: row.get("task_queue"),
            status: parse_process_status(&status_str)?,
            input: row.get("input"),
            result: row.get("result"),
            error: error_json.and_then(|v| serde_json::from_value(v).ok()),
            started_at: row.get("started_at"),
        })
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        instance_id: &str,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Serialize appends per instance by locking the instance row
        sqlx::query("SELECT 1 FROM durable_instances WHERE id = $1 FOR UPDATE")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_num) + 1, 0) as next_seq
            FROM durable_instance_events
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let current_sequence: i64 = row.get("next_seq");

        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let mut new_sequence = current_sequence;
        for event in events {
            let event_type = event_type_name(&event);
            let event_data = serde_json::to_value(&event)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO durable_instance_events (instance_id, sequence_num, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(instance_id)
            .bind(new_sequence)
            .bind(event_type)
            .bind(&event_data)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            new_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%instance_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    #[instrument(skip(self))]
    async fn load_events(
        &self,
        instance_id: &str,
    ) -> Result<Vec<(i64, WorkflowEvent)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data
            FROM durable_instance_events
            WHERE instance_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("sequence_num");
            let data: serde_json::Value = row.get("event_data");
            let event: WorkflowEvent = serde_json::from_value(data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            events.push((seq, event));
        }

        Ok(events)
    }

    #[instrument(skip(self, result, error))]
    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: ProcessStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let status_str = status.to_string();
        let error_json = error
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let completed_at: Option<DateTime<Utc>> = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        let rows = sqlx::query(
            r#"
            UPDATE durable_instances
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                completed_at = COALESCE($5, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(&status_str)
        .bind(&result)
        .bind(&error_json)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update instance status: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if rows.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(instance_id.to_string()));
        }

        Ok(())
    }

    #[instrument(skip(self, task))]
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let options_json = serde_json::to_value(&task.options)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO durable_task_queue
                (id, instance_id, task_queue, activity_id, activity_type, input, options)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(task_id)
        .bind(&task.instance_id)
        .bind(&task.task_queue)
        .bind(&task.activity_id)
        .bind(&task.activity_type)
        .bind(&task.input)
        .bind(&options_json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(task_id)
    }

    #[instrument(skip(self))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'claimed',
                claimed_by = $1,
                attempt = attempt + 1,
                last_heartbeat_at = now()
            WHERE id IN (
                SELECT id FROM durable_task_queue
                WHERE status = 'pending'
                  AND task_queue = $2
                  AND activity_type = ANY($3)
                  AND next_attempt_at <= now()
                ORDER BY next_attempt_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, instance_id, activity_id, activity_type, input, options, attempt
            "#,
        )
        .bind(worker_id)
        .bind(task_queue)
        .bind(activity_types)
        .bind(max_tasks as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let options_json: serde_json::Value = row.get("options");
            let options: ActivityOptions = serde_json::from_value(options_json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let attempt: i32 = row.get("attempt");

            claimed.push(ClaimedTask {
                id: row.get("id"),
                instance_id: row.get("instance_id"),
                activity_id: row.get("activity_id"),
                activity_type: row.get("activity_type"),
                input: row.get("input"),
                max_attempts: options.retry_policy.max_attempts,
                options,
                attempt: attempt as u32,
            });
        }

        Ok(claimed)
    }

    #[instrument(skip(self, _details))]
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        _details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET last_heartbeat_at = now()
            WHERE id = $1
            RETURNING status, claimed_by, cancel_requested
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let status: String = row.get("status");
        let claimed_by: Option<String> = row.get("claimed_by");
        let should_cancel: bool = row.get("cancel_requested");

        Ok(HeartbeatResponse {
            accepted: status == "claimed" && claimed_by.as_deref() == Some(worker_id),
            should_cancel,
        })
    }

    #[instrument(skip(self, _result))]
    async fn complete_task(
        &self,
        task_id: Uuid,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let rows = sqlx::query("UPDATE durable_task_queue SET status = 'completed' WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let row = sqlx::query("SELECT attempt, options FROM durable_task_queue WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let attempt: i32 = row.get("attempt");
        let options_json: serde_json::Value = row.get("options");
        let options: ActivityOptions = serde_json::from_value(options_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let policy = &options.retry_policy;
        if retryable && policy.has_attempts_remaining(attempt as u32) {
            let delay = policy.delay_for_attempt(attempt as u32 + 1);
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            sqlx::query(
                r#"
                UPDATE durable_task_queue
                SET status = 'pending',
                    claimed_by = NULL,
                    next_attempt_at = $2,
                    last_error = $3
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(next_attempt_at)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(TaskFailureOutcome::WillRetry {
                next_attempt: attempt as u32 + 1,
                delay,
            })
        } else {
            sqlx::query(
                "UPDATE durable_task_queue SET status = 'failed', last_error = $2 WHERE id = $1",
            )
            .bind(task_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(TaskFailureOutcome::ExhaustedRetries)
        }
    }

    #[instrument(skip(self))]
    async fn timeout_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let rows = sqlx::query("UPDATE durable_task_queue SET status = 'timed_out' WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_instance_tasks(&self, instance_id: &str) -> Result<Vec<Uuid>, StoreError> {
        // Pending tasks are cancelled outright
        let rows = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'cancelled'
            WHERE instance_id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        // Claimed tasks are flagged; the worker sees should_cancel on the
        // next heartbeat
        sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET cancel_requested = true
            WHERE instance_id = $1 AND status = 'claimed'
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold).unwrap_or(chrono::Duration::zero());

        let rows = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'pending',
                claimed_by = NULL
            WHERE status = 'claimed'
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn take_schedule_to_start_expired(&self) -> Result<Vec<ExpiredTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'timed_out'
            WHERE status = 'pending'
              AND attempt = 0
              AND enqueued_at
                  + ((options->>'schedule_to_start_timeout')::bigint * interval '1 millisecond')
                  <= now()
            RETURNING id, instance_id, activity_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| ExpiredTask {
                task_id: r.get("id"),
                instance_id: r.get("instance_id"),
                activity_id: r.get("activity_id"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn take_heartbeat_expired(&self) -> Result<Vec<ExpiredTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'timed_out'
            WHERE status = 'claimed'
              AND options->>'heartbeat_timeout' IS NOT NULL
              AND last_heartbeat_at
                  + ((options->>'heartbeat_timeout')::bigint * interval '1 millisecond')
                  <= now()
            RETURNING id, instance_id, activity_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| ExpiredTask {
                task_id: r.get("id"),
                instance_id: r.get("instance_id"),
                activity_id: r.get("activity_id"),
            })
            .collect())
    }

    #[instrument(skip(self, signal))]
    async fn push_signal(
        &self,
        instance_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO durable_signals (id, instance_id, signal_name, payload, sent_at)
            SELECT $1, $2, $3, $4, $5
            WHERE EXISTS (SELECT 1 FROM durable_instances WHERE id = $2)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(instance_id)
        .bind(&signal.signal_name)
        .bind(&signal.payload)
        .bind(signal.sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pop_signal(
        &self,
        instance_id: &str,
        signal_name: &str,
    ) -> Result<Option<WorkflowSignal>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_signals
            SET consumed = true
            WHERE id = (
                SELECT id FROM durable_signals
                WHERE instance_id = $1 AND signal_name = $2 AND NOT consumed
                ORDER BY sent_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING signal_name, payload, sent_at
            "#,
        )
        .bind(instance_id)
        .bind(signal_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|r| WorkflowSignal {
            signal_name: r.get("signal_name"),
            payload: r.get("payload"),
            sent_at: r.get("sent_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn schedule_timer(
        &self,
        instance_id: &str,
        timer_id: &str,
        fires_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO durable_timers (id, instance_id, timer_id, fires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(instance_id)
        .bind(timer_id)
        .bind(fires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(id)
    }

    #[instrument(skip(self))]
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, timer_id
            FROM durable_timers
            WHERE NOT fired AND fires_at <= $1
            ORDER BY fires_at, id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| DueTimer {
                id: r.get("id"),
                instance_id: r.get("instance_id"),
                timer_id: r.get("timer_id"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn complete_timer(&self, timer_id: Uuid) -> Result<(), StoreError> {
        let rows = sqlx::query("UPDATE durable_timers SET fired = true WHERE id = $1")
            .bind(timer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows.rows_affected() == 0 {
            return Err(StoreError::TimerNotFound(timer_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_instance_timers(&self, instance_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM durable_timers WHERE instance_id = $1 AND NOT fired")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

fn parse_process_status(s: &str) -> Result<ProcessStatus, StoreError> {
    match s {
        "running" => Ok(ProcessStatus::Running),
        "completed" => Ok(ProcessStatus::Completed),
        "failed" => Ok(ProcessStatus::Failed),
        "terminated" => Ok(ProcessStatus::Terminated),
        other => Err(StoreError::Database(format!(
            "unknown instance status: {other}"
        ))),
    }
}

fn event_type_name(event: &WorkflowEvent) -> &'static str {
    match event {
        WorkflowEvent::ProcessStarted { .. } => "process_started",
        WorkflowEvent::ProcessCompleted { .. } => "process_completed",
        WorkflowEvent::ProcessFailed { .. } => "process_failed",
        WorkflowEvent::ProcessTerminated { .. } => "process_terminated",
        WorkflowEvent::ActivityScheduled { .. } => "activity_scheduled",
        WorkflowEvent::ActivityStarted { .. } => "activity_started",
        WorkflowEvent::ActivityCompleted { .. } => "activity_completed",
        WorkflowEvent::ActivityFailed { .. } => "activity_failed",
        WorkflowEvent::ActivityTimedOut { .. } => "activity_timed_out",
        WorkflowEvent::ActivityCancelled { .. } => "activity_cancelled",
        WorkflowEvent::TimerStarted { .. } => "timer_started",
        WorkflowEvent::TimerFired { .. } => "timer_fired",
        WorkflowEvent::SignalAwaited { .. } => "signal_awaited",
        WorkflowEvent::SignalReceived { .. } => "signal_received",
        WorkflowEvent::VersionMarked { .. } => "version_marked",
    }
}
