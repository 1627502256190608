#![warn(missing_docs)]

//! # Archflow Engine
//!
//! Drives a workflow graph to a terminal [`FlowResult`](archflow_execution::FlowResult):
//!
//! - [`FlowEngine`] — `run` / `pause` / `stop` / `resume`, ready-queue
//!   scheduling with guard routing, error paths, retries, deadlines and
//!   cancellation
//! - [`StepHandler`] / built-in handlers (`tool`, `transform`, `wait`,
//!   `noop`) resolved by step type
//! - [`StateStore`] — pluggable suspension persistence with an in-memory
//!   implementation
//!
//! The engine never lets a step's failure escape as a panic or error: every
//! outcome becomes a [`StepResult`](archflow_execution::StepResult) routed
//! through the graph. Event emission and metrics recording can fail without
//! affecting a run's outcome.

pub mod config;
pub mod control;
pub mod engine;
pub mod handler;
pub mod store;

pub use config::EngineConfig;
pub use control::{RunControl, RunStatus};
pub use engine::{FlowEngine, StartedRun};
pub use handler::{
    HandlerError, NoopHandler, StepHandler, StepRegistry, ToolStepHandler, TransformHandler,
    WaitHandler,
};
pub use store::{InMemoryStateStore, StateStore, StoreError, SuspensionRecord};

use archflow_core::IdParseError;
use archflow_workflow::WorkflowError;

/// Error raised by the engine's public entry points.
///
/// Runtime step failures are not errors — they are routed through the graph
/// and surface in the [`FlowResult`](archflow_execution::FlowResult).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The workflow failed load-time validation.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    /// A step names a type with no registered handler.
    #[error("unknown step type {0:?}")]
    UnknownStepType(String),
    /// No workflow with this id is registered.
    #[error("workflow {0:?} is not registered")]
    UnknownWorkflow(String),
    /// No run with this id is known.
    #[error("run not found: {0}")]
    RunNotFound(String),
    /// The run id is not a valid execution id.
    #[error("invalid run id: {0}")]
    InvalidRunId(#[from] IdParseError),
    /// `resume` was called but nothing is suspended under this run id.
    #[error("no suspension recorded for run {0}")]
    NoSuspension(String),
    /// The presented resume token does not match the suspension record.
    #[error("resume token does not match")]
    InvalidResumeToken,
    /// The suspension record expired before `resume` arrived.
    #[error("suspension for run {0} expired")]
    SuspensionExpired(String),
    /// Suspension persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
