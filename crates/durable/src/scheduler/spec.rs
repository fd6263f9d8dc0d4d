//! Schedule specification types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Policy for a fire that triggers while the previous launched instance is
/// still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the fire
    #[default]
    Skip,

    /// Defer at most one fire; it launches when the previous instance
    /// finishes. A newer deferred fire replaces an older one.
    BufferOne,

    /// Launch unconditionally
    AllowAll,

    /// Terminate the previous instance, then launch
    CancelOther,
}

/// Specification of a recurring schedule
///
/// The cron expression uses the 6-field format (sec min hour day month
/// day-of-week) and is evaluated in `time_zone`. Each fire launches an
/// instance of `workflow_type` on `task_queue` with a deterministic id
/// derived from the fire time, so a restarted scheduler re-requesting the
/// same fire is absorbed by the engine's idempotent start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Cron expression (6-field, seconds resolution)
    pub cron_expression: String,

    /// IANA timezone name the expression is evaluated in
    pub time_zone: String,

    /// What to do when a fire overlaps a still-running instance
    pub overlap_policy: OverlapPolicy,

    /// Workflow type to launch
    pub workflow_type: String,

    /// Task queue the launched instances run on
    pub task_queue: String,

    /// Input passed to every launched instance
    pub input: serde_json::Value,

    /// If set, fires missed while the scheduler was down are replayed in
    /// order as long as they fall within this window. Unset means missed
    /// fires are dropped.
    #[serde(default, with = "option_duration_millis")]
    pub catch_up_window: Option<Duration>,
}

impl ScheduleSpec {
    /// Create a spec with the default policy (Skip, UTC, no catch-up)
    pub fn new(
        cron_expression: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            cron_expression: cron_expression.into(),
            time_zone: "UTC".to_string(),
            overlap_policy: OverlapPolicy::default(),
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            input,
            catch_up_window: None,
        }
    }

    /// Set the timezone
    pub fn with_time_zone(mut self, tz: impl Into<String>) -> Self {
        self.time_zone = tz.into();
        self
    }

    /// Set the overlap policy
    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    /// Enable catch-up for missed fires within the window
    pub fn with_catch_up_window(mut self, window: Duration) -> Self {
        self.catch_up_window = Some(window);
        self
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
