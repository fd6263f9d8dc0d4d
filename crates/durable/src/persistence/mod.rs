//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`ProcessStore`] trait for instance, task queue, signal, and timer persistence
//! - [`InMemoryProcessStore`] for testing
//! - [`PostgresProcessStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryProcessStore;
pub use postgres::PostgresProcessStore;
pub use store::{
    ClaimedTask, DueTimer, ExpiredTask, HeartbeatResponse, InstanceInfo, ProcessStatus,
    ProcessStore, StoreError, TaskDefinition, TaskFailureOutcome, TaskStatus,
};
