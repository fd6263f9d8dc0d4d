//! Workflow abstractions and types
//!
//! This module contains the core process primitives:
//! - [`Workflow`] trait for defining deterministic decision functions
//! - [`WorkflowAction`] enum for commands a decision function can issue
//! - [`WorkflowEvent`] enum for persisted history entries
//! - [`WorkflowSignal`] for cross-instance communication
//! - [`WorkflowContext`] for recorded version markers

mod action;
mod context;
mod definition;
mod event;
mod signal;

pub use action::{ActivityOptions, WorkflowAction};
pub use context::{WorkflowContext, DEFAULT_VERSION};
pub use definition::{Workflow, WorkflowError};
pub use event::{TimeoutType, WorkflowEvent};
pub use signal::WorkflowSignal;
