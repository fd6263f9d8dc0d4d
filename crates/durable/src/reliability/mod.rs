//! Reliability primitives
//!
//! Retry policies with exponential backoff, caps, and jitter. Timeouts are
//! enforced by the worker pool; this module only describes the schedule of
//! re-attempts between them.

mod retry;

pub use retry::RetryPolicy;
