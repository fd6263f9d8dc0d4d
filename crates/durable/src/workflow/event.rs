//! History events for process instances

use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Types of timeouts that can occur
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Activity was not claimed within schedule_to_start_timeout
    ScheduleToStart,

    /// Activity did not complete within start_to_close_timeout
    StartToClose,

    /// Worker did not send heartbeat within heartbeat_timeout
    Heartbeat,
}

/// Entries in a process instance's append-only history
///
/// The history is the sole source of truth for replay. Events are immutable
/// once written: the engine only ever appends, and the instance state is
/// reconstructed by replaying all events in sequence order. Appends are
/// guarded by an expected sequence number so a decision is either fully
/// recorded or not recorded at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Process Lifecycle Events
    // =========================================================================
    /// Instance was started with the given input
    ProcessStarted {
        input: serde_json::Value,
    },

    /// Decision function returned normally
    ProcessCompleted {
        result: serde_json::Value,
    },

    /// Decision function propagated a failure
    ProcessFailed {
        error: WorkflowError,
    },

    /// Instance was terminated by an external caller
    ProcessTerminated {
        reason: String,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique within the owning instance, stable across retries and replays
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Activity execution started (claimed by a worker)
    ActivityStarted {
        activity_id: String,
        /// Current attempt number (1-based)
        attempt: u32,
        worker_id: String,
    },

    /// Activity completed successfully
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },

    /// Activity failed (may or may not retry)
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
        /// Whether the executor will retry; only final failures reach the
        /// decision function
        will_retry: bool,
    },

    /// Activity timed out — terminal for this invocation, distinct from Failed
    ActivityTimedOut {
        activity_id: String,
        timeout_type: TimeoutType,
    },

    /// Activity was cancelled (instance terminated)
    ActivityCancelled {
        activity_id: String,
        reason: String,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started
    TimerStarted {
        timer_id: String,
        duration_ms: u64,
    },

    /// Timer fired (duration elapsed)
    TimerFired {
        timer_id: String,
    },

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// The decision function suspended waiting on a named signal channel
    SignalAwaited {
        signal_name: String,
    },

    /// A queued signal was consumed by a matching await
    SignalReceived {
        signal: WorkflowSignal,
    },

    // =========================================================================
    // Versioning Events
    // =========================================================================
    /// A branch-point version was resolved for the first time
    ///
    /// Written once per (instance, change_id); replay returns the recorded
    /// version even after the code's supported range moves.
    VersionMarked {
        change_id: String,
        version: i32,
    },
}

impl WorkflowEvent {
    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityTimedOut { activity_id, .. }
            | Self::ActivityCancelled { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal process event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcessCompleted { .. }
                | Self::ProcessFailed { .. }
                | Self::ProcessTerminated { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_round_trip() {
        let event = WorkflowEvent::ProcessStarted {
            input: json!({"order_id": 2, "product": "T-shirt"}),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"process_started\""));

        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_version_marker_serialization() {
        let event = WorkflowEvent::VersionMarked {
            change_id: "Step2".to_string(),
            version: 1,
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityStarted {
            activity_id: "validate-order".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
        };

        assert_eq!(event.activity_id(), Some("validate-order"));

        let awaited = WorkflowEvent::SignalAwaited {
            signal_name: "payment-notification-signal".to_string(),
        };
        assert_eq!(awaited.activity_id(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::ProcessCompleted { result: json!({}) }.is_terminal());
        assert!(WorkflowEvent::ProcessFailed {
            error: WorkflowError::new("boom")
        }
        .is_terminal());
        assert!(WorkflowEvent::ProcessTerminated {
            reason: "operator request".to_string()
        }
        .is_terminal());

        assert!(!WorkflowEvent::ProcessStarted { input: json!({}) }.is_terminal());
        assert!(!WorkflowEvent::TimerFired {
            timer_id: "t".to_string()
        }
        .is_terminal());
    }
}
