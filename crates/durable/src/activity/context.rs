//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (activity cancelled or timed out)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// The context carries the current attempt information, heartbeat support
/// for long-running activities, and the out-of-band cancellation flag set
/// when the owning instance is terminated.
#[derive(Debug)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Process instance that owns this activity
    pub instance_id: String,

    /// Activity ID within the instance
    pub activity_id: String,

    /// Heartbeat sender
    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    /// Cancellation flag
    cancelled: Arc<AtomicBool>,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        instance_id: impl Into<String>,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            instance_id: instance_id.into(),
            activity_id: activity_id.into(),
            heartbeat_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Get a handle that can be used to cancel this activity
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Record a heartbeat
    ///
    /// Heartbeats keep the claimed task from being reclaimed as stale and
    /// report progress back to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity has been cancelled or the heartbeat
    /// channel is closed.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an activity out-of-band
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Cancel the activity
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_context_creation() {
        let ctx = ActivityContext::new("order_1", "validate", 1, 3);

        assert_eq!(ctx.instance_id, "order_1");
        assert_eq!(ctx.activity_id, "validate");
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 3);
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        let ctx = ActivityContext::new("order_1", "validate", 3, 3);
        assert!(ctx.is_last_attempt());

        let ctx = ActivityContext::new("order_1", "validate", 2, 3);
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_cancellation() {
        let ctx = ActivityContext::new("order_1", "validate", 1, 3);
        let handle = ctx.cancellation_handle();

        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_heartbeat_when_cancelled() {
        let ctx = ActivityContext::new("order_1", "validate", 1, 3);
        let handle = ctx.cancellation_handle();

        handle.cancel();

        let result = ctx.heartbeat(None).await;
        assert!(matches!(result, Err(HeartbeatError::Cancelled)));
    }

    #[tokio::test]
    async fn test_heartbeat_with_channel() {
        let (tx, mut rx) = mpsc::channel(10);
        let ctx = ActivityContext::new("order_1", "validate", 1, 3).with_heartbeat(tx);

        ctx.heartbeat(Some(serde_json::json!({"progress": 50})))
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert!(payload.details.is_some());
    }
}
