//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type for activity failures
///
/// The `retryable` flag drives the executor's backoff loop; `timed_out`
/// distinguishes a start-to-close timeout from a business failure when the
/// error finally reaches the decision function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether the executor should retry this attempt
    pub retryable: bool,

    /// Whether this failure was a start-to-close timeout
    #[serde(default)]
    pub timed_out: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error (transient infrastructure failure)
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            timed_out: false,
            details: None,
        }
    }

    /// Create a non-retryable error (business failure)
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            timed_out: false,
            details: None,
        }
    }

    /// Create a timeout error — terminal for the invocation, never retried
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Some("TIMEOUT".to_string()),
            retryable: false,
            timed_out: true,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a single fallible, timeout-bounded unit of external work
///
/// Activities are where side effects live. They are executed by workers
/// outside the decision function and:
/// - May take external time and block on I/O
/// - May fail and be retried per the instance's retry policy
/// - Can send heartbeats for liveness
/// - Observe cancellation cooperatively through the context
///
/// The engine does not know what an activity does — only how it is invoked,
/// timed, and retried. An `activity_id` that already has a recorded outcome
/// is never re-executed; replay returns the cached result.
///
/// # Example
///
/// ```ignore
/// use windlass_durable::prelude::*;
///
/// struct ChargeCreditCard;
///
/// #[async_trait]
/// impl Activity for ChargeCreditCard {
///     const TYPE: &'static str = "charge_credit_card";
///     type Input = ChargeRequest;
///     type Output = ChargeReceipt;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         // Call the payment provider...
///         Ok(ChargeReceipt { transaction_id: "...".into() })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Stable name this activity is registered under
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return [`ActivityError::retryable`] for transient failures that
    /// should be retried, [`ActivityError::non_retryable`] for permanent
    /// business failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_retryable() {
        let error = ActivityError::retryable("worker unreachable");
        assert!(error.retryable);
        assert!(!error.timed_out);
        assert_eq!(error.to_string(), "worker unreachable");
    }

    #[test]
    fn test_activity_error_non_retryable() {
        let error = ActivityError::non_retryable("payment declined");
        assert!(!error.retryable);
        assert!(!error.timed_out);
    }

    #[test]
    fn test_timeout_error_is_distinct() {
        let error = ActivityError::timed_out("exceeded start-to-close timeout");
        assert!(error.timed_out);
        assert!(!error.retryable);
        assert_eq!(error.error_type, Some("TIMEOUT".to_string()));
    }

    #[test]
    fn test_activity_error_serialization() {
        let error = ActivityError::retryable("test error")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
    }
}
