//! Activity abstractions
//!
//! Activities are the units of work dispatched to workers. They:
//! - May fail and be retried according to the retry policy
//! - Are bounded by a start-to-close timeout
//! - Can send heartbeats to indicate liveness
//! - Observe cancellation cooperatively

mod context;
mod definition;

pub use context::{ActivityContext, CancellationHandle, HeartbeatError, HeartbeatPayload};
pub use definition::{Activity, ActivityError};
