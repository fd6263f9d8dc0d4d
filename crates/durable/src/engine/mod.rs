//! Process engine: replay, decision passes, and the workflow registry

mod executor;
mod registry;

pub use executor::{EngineConfig, EngineError, ProcessResult, StartOutcome, WorkflowEngine};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
