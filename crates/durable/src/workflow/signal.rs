//! Signals for cross-instance communication
//!
//! Instances never share memory; all communication between in-flight
//! processes (or from external callers) goes through named signals routed
//! into the target instance's inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, addressed message delivered into a process instance's inbox
///
/// Signals of the same name queue in FIFO order per instance; each is
/// consumed by exactly one matching receive. Consumption is recorded in
/// history, so replay returns the same payload instead of waiting again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal name; receives match on this
    pub signal_name: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,

    /// When the signal was sent
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(signal_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_name: signal_name.into(),
            payload,
            sent_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_construction() {
        let signal = WorkflowSignal::new(
            "payment-notification-signal",
            serde_json::json!({"order_id": 2}),
        );

        assert_eq!(signal.signal_name, "payment-notification-signal");
        assert_eq!(signal.payload, serde_json::json!({"order_id": 2}));
    }

    #[test]
    fn test_signal_serialization() {
        let signal = WorkflowSignal::new("delivery-notification-signal", serde_json::json!(null));

        let json = serde_json::to_string(&signal).unwrap();
        let parsed: WorkflowSignal = serde_json::from_str(&json).unwrap();

        assert_eq!(signal.signal_name, parsed.signal_name);
        assert_eq!(signal.payload, parsed.payload);
    }
}
