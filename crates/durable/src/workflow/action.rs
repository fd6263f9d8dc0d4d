//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::RetryPolicy;

/// Actions a decision function can request
///
/// These are the commands a workflow can issue in response to events.
/// Each action is persisted as a [`WorkflowEvent`](super::WorkflowEvent)
/// before it takes effect, so a crash between decision and execution is
/// recovered by replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution on the instance's task queue
    ScheduleActivity {
        /// Unique identifier for this activity within the instance
        activity_id: String,

        /// Type of activity to execute (used to look up the worker handler)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a timer that fires after the specified duration
    StartTimer {
        timer_id: String,

        #[serde(with = "duration_serde")]
        duration: Duration,
    },

    /// Suspend until a signal with the given name is delivered
    ///
    /// This is a suspension point: the decision function resumes via
    /// `on_signal` when a matching signal is dequeued from the inbox.
    AwaitSignal {
        signal_name: String,
    },

    /// Complete the instance successfully with a result
    CompleteProcess {
        result: serde_json::Value,
    },

    /// Fail the instance with an error
    FailProcess {
        error: WorkflowError,
    },

    /// Request cancellation of a pending activity
    CancelActivity {
        activity_id: String,
    },

    /// No action (used when event handling doesn't trigger new work)
    None,
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with_options(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create an await signal action
    pub fn await_signal(signal_name: impl Into<String>) -> Self {
        Self::AwaitSignal {
            signal_name: signal_name.into(),
        }
    }

    /// Create a complete process action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteProcess { result }
    }

    /// Create a fail process action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailProcess { error }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for the activity to be claimed by a worker
    #[serde(with = "duration_serde")]
    pub schedule_to_start_timeout: Duration,

    /// Maximum time for a single execution attempt; elapsing yields a
    /// TimedOut outcome, terminal for the invocation
    #[serde(with = "duration_serde")]
    pub start_to_close_timeout: Duration,

    /// Heartbeat interval for long-running activities
    #[serde(with = "option_duration_serde")]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(60),
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the schedule-to-start timeout
    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = timeout;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Enable heartbeating with the specified timeout
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// Serde support for Duration (as milliseconds)
pub(crate) mod duration_serde {
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

/// Serde support for Option<Duration>
pub(crate) mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_action() {
        let action = WorkflowAction::schedule_activity(
            "validate",
            "validate_order",
            json!({"order_id": 1}),
        );

        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                ..
            } => {
                assert_eq!(activity_id, "validate");
                assert_eq!(activity_type, "validate_order");
                assert_eq!(input, json!({"order_id": 1}));
            }
            _ => panic!("Expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_await_signal_action() {
        let action = WorkflowAction::await_signal("payment-notification-signal");
        match action {
            WorkflowAction::AwaitSignal { signal_name } => {
                assert_eq!(signal_name, "payment-notification-signal");
            }
            _ => panic!("Expected AwaitSignal"),
        }
    }

    #[test]
    fn test_action_serialization() {
        let action = WorkflowAction::ScheduleActivity {
            activity_id: "charge".to_string(),
            activity_type: "charge_credit_card".to_string(),
            input: json!({}),
            options: ActivityOptions::default(),
        };

        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"schedule_activity\""));

        let parsed: WorkflowAction = serde_json::from_str(&json).unwrap();
        assert_eq!(action, parsed);
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(60))
            .with_heartbeat(Duration::from_secs(30));

        let json = serde_json::to_string(&options).unwrap();
        let parsed: ActivityOptions = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.start_to_close_timeout, Duration::from_secs(60));
        assert_eq!(parsed.heartbeat_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_timer_action() {
        let action = WorkflowAction::timer("delay", Duration::from_secs(60));

        match action {
            WorkflowAction::StartTimer { timer_id, duration } => {
                assert_eq!(timer_id, "delay");
                assert_eq!(duration, Duration::from_secs(60));
            }
            _ => panic!("Expected StartTimer"),
        }
    }
}
