#![warn(missing_docs)]

//! # Archflow Tool
//!
//! The tool invocation pipeline:
//!
//! - [`ToolRegistry`] — named, side-effectful callables behind the [`Tool`]
//!   trait
//! - [`InterceptorChain`] — the ordered before/after/on-error middleware
//!   pipeline around every invocation (validate → log → cache → meter)
//! - [`ToolInvoker`] — the single point that couples execution tracking and
//!   interception; nothing else calls the tracker for tool execution
//!
//! Tools declare optional input schemas and strict-retry policies; the
//! invoker applies both.

pub mod builtin;
pub mod chain;
pub mod context;
pub mod invoker;
pub mod registry;

pub use chain::{InterceptorChain, InterceptorHalt, ToolInterceptor};
pub use context::ToolContext;
pub use invoker::ToolInvoker;
pub use registry::{Tool, ToolRegistry};

use archflow_execution::TrackerError;
use archflow_resilience::Attempt;

/// Error raised by the tool pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The requested tool is not registered.
    #[error("tool not found: {0}")]
    NotFound(String),
    /// An interceptor halted the invocation.
    #[error("interceptor {interceptor} halted invocation: {reason}")]
    Halted {
        /// Which interceptor raised the halt.
        interceptor: String,
        /// Why.
        reason: String,
    },
    /// The tool itself failed.
    #[error("tool execution failed: {0}")]
    Execution(String),
    /// The tool's output failed its schema under fail-fast policy.
    #[error("output validation failed: {}", violations.join("; "))]
    Validation {
        /// Every violation found.
        violations: Vec<String>,
    },
    /// Retries exhausted.
    #[error("retries exhausted after {} attempt(s)", attempts.len())]
    RetryExhausted {
        /// One record per attempt made.
        attempts: Vec<Attempt>,
    },
    /// Child invocation under an unknown parent execution.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// The owning run was cancelled.
    #[error("tool invocation cancelled")]
    Cancelled,
}
