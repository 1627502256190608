#![warn(missing_docs)]

//! # Archflow Workflow
//!
//! The declared shape of a workflow: [`Workflow`], [`Step`] and
//! [`Connection`], plus load-time validation and the successor indexes the
//! engine schedules from.
//!
//! Validation happens once, before any scheduling: unreachable steps and
//! duplicate connections reject the workflow as invalid, and a connection
//! referencing a missing step is a broken graph — never discovered lazily.

pub mod graph;
pub mod model;

pub use graph::FlowGraph;
pub use model::{Connection, ParameterDecl, Step, Workflow};

/// Error raised while validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// The definition violates a structural invariant.
    #[error("invalid workflow: {0}")]
    Invalid(String),
    /// A connection references a step that does not exist.
    #[error("broken graph: {0}")]
    BrokenGraph(String),
}
