//! Cron scheduler for recurring instance launches
//!
//! This module provides:
//! - [`ScheduleSpec`] describing a cron expression, timezone, and launch action
//! - [`OverlapPolicy`] for fires that overlap a still-running instance
//! - [`Scheduler`] evaluating registered schedules on a tick loop

mod service;
mod spec;

pub use service::{Scheduler, SchedulerConfig, SchedulerError};
pub use spec::{OverlapPolicy, ScheduleSpec};
