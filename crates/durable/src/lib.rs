//! # Durable Process Orchestration Engine
//!
//! A PostgreSQL-backed engine for long-lived business processes that survive
//! restarts, with activity retries, cross-instance signals, and cron schedules.
//!
//! ## Features
//!
//! - **Event-sourced instances**: every state change is an appended history
//!   event; recovery replays the decision function against the history
//! - **Replay determinism**: recorded activity results, timer fires, signal
//!   payloads, and version markers are fed back on replay, so side effects
//!   run at most once per activity id
//! - **Retryable activities**: per-activity retry policies with exponential
//!   backoff, jitter, and non-retryable error codes
//! - **Signals**: named FIFO inboxes per instance; each signal is consumed by
//!   exactly one awaiting receive
//! - **Cron schedules**: timezone-aware recurring launches with Skip,
//!   BufferOne, AllowAll, and CancelOther overlap policies
//! - **Versioning**: recorded branch markers let workflow code evolve without
//!   breaking instances that are mid-flight on old code
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EngineHandle                           │
//! │  (client gateway: start, signal, result, terminate)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (replays histories, processes decision actions)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ProcessStore                            │
//! │  (histories, task queue, signal inboxes, durable timers)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                WorkerPool / TimerService / Scheduler         │
//! │  (claims tasks, runs activities, fires timers and crons)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use windlass_durable::prelude::*;
//!
//! struct OrderProcessing {
//!     order: Order,
//!     state: OrderState,
//! }
//!
//! impl Workflow for OrderProcessing {
//!     const TYPE: &'static str = "order_processing";
//!     type Input = Order;
//!     type Output = OrderReceipt;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { order: input, state: OrderState::Created }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_activity(
//!             "validate",
//!             "validate_order",
//!             json!({ "order_id": self.order.id }),
//!         )]
//!     }
//!
//!     // ... implement other trait methods
//! }
//! ```

pub mod activity;
pub mod engine;
pub mod gateway;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::engine::{
        EngineConfig, EngineError, StartOutcome, WorkflowEngine, WorkflowRegistry,
    };
    pub use crate::gateway::{EngineHandle, GatewayError};
    pub use crate::persistence::{
        ClaimedTask, InMemoryProcessStore, PostgresProcessStore, ProcessStatus, ProcessStore,
        StoreError, TaskDefinition,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::scheduler::{OverlapPolicy, ScheduleSpec, Scheduler, SchedulerConfig};
    pub use crate::worker::{TimerService, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent,
        WorkflowSignal, DEFAULT_VERSION,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use engine::{EngineConfig, EngineError, StartOutcome, WorkflowEngine, WorkflowRegistry};
pub use gateway::{EngineHandle, GatewayError};
pub use persistence::{
    InMemoryProcessStore, PostgresProcessStore, ProcessStatus, ProcessStore, StoreError,
};
pub use reliability::RetryPolicy;
pub use scheduler::{OverlapPolicy, ScheduleSpec, Scheduler};
pub use worker::{TimerService, WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent,
    WorkflowSignal,
};
