//! Worker infrastructure for activity execution
//!
//! This module provides:
//! - [`WorkerPool`] for concurrent activity execution with graceful shutdown
//! - [`TaskPoller`] for claiming tasks with adaptive backoff
//! - [`TimerService`] for firing durable timers and expiring unclaimed tasks

mod pool;
mod poller;
mod timer;

pub use pool::{
    ActivityHandler, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use timer::{TimerService, TimerServiceConfig};
