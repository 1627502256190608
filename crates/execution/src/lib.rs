#![warn(missing_docs)]

//! # Archflow Execution
//!
//! Execution-time state for the Archflow engine — this crate does NOT
//! contain the orchestrator. It defines:
//!
//! - [`ExecutionTracker`] — lifecycle records with parent/child topology and
//!   a process-wide monotone sequence
//! - [`ExecutionRecord`] — one tracked execution's lifecycle state
//! - [`ExecutionContext`] — the per-run mutable bag of path-keyed values
//! - [`StepResult`] / [`FlowResult`] and their metrics — what steps and runs
//!   produce
//! - Status enums for records, steps and flows

pub mod context;
pub mod record;
pub mod result;
pub mod status;
pub mod tracker;

pub use context::{ExecutionContext, FlowState};
pub use record::{ExecutionRecord, RecordStatus};
pub use result::{
    ExecutionError, ExecutionMetrics, FlowResult, StepError, StepMetrics, StepResult,
};
pub use status::{FlowStatus, StepStatus};
pub use tracker::{ExecutionTracker, TrackerError, TrackerStats};
