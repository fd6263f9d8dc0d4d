//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};

use super::{WorkflowAction, WorkflowContext, WorkflowSignal};
use crate::activity::ActivityError;

/// Error type for process failures
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is a deterministic decision function driven by events
///
/// Workflows define how a process instance reacts to its history:
/// - How to start execution (`on_start`)
/// - How to handle activity outcomes (`on_activity_completed`,
///   `on_activity_failed`)
/// - How to handle timers (`on_timer_fired`)
/// - How to handle delivered signals (`on_signal`)
///
/// # Determinism
///
/// Callbacks must be pure functions of the instance's accumulated state and
/// the incoming event: no clock reads, no randomness, no I/O. Given the same
/// event sequence they must produce the same actions — this is what makes
/// replay-based recovery possible. Anything nondeterministic belongs in an
/// activity; code evolution goes through [`WorkflowContext::version`].
///
/// # Example
///
/// ```ignore
/// use windlass_durable::prelude::*;
///
/// struct OrderWorkflow {
///     order: Order,
///     state: OrderState,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = Order;
///     type Output = OrderReceipt;
///
///     fn new(input: Self::Input) -> Self {
///         Self { order: input, state: OrderState::Created }
///     }
///
///     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity(
///             "validate",
///             "validate_order",
///             json!({ "order_id": self.order.id }),
///         )]
///     }
///
///     // ... implement other methods
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// Used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when the process completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// Called both when starting a new instance and when replaying.
    fn new(input: Self::Input) -> Self;

    /// Called when the instance starts (or replays from the beginning)
    fn on_start(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails for good (retries exhausted, a
    /// non-retryable error, or a start-to-close timeout)
    ///
    /// `error.timed_out` distinguishes a timeout from a business failure.
    /// The workflow may recover, compensate, or propagate with
    /// [`WorkflowAction::FailProcess`].
    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = (ctx, timer_id);
        vec![]
    }

    /// Called when an awaited signal is delivered
    fn on_signal(
        &mut self,
        ctx: &mut WorkflowContext,
        signal: &WorkflowSignal,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, signal);
        vec![]
    }

    /// Check if the workflow has reached a terminal state
    fn is_completed(&self) -> bool;

    /// Get the workflow result (if completed successfully)
    fn result(&self) -> Option<Self::Output>;

    /// Get the workflow error (if failed)
    fn error(&self) -> Option<WorkflowError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("payment declined");
        assert_eq!(error.to_string(), "payment declined");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("not found").with_code("NOT_FOUND");
        assert_eq!(error.code, Some("NOT_FOUND".to_string()));
    }
}
