//! Canonical context-path keys.
//!
//! The execution context is a flat map keyed by dotted paths. Every producer
//! and consumer of those paths goes through this module so the spelling
//! lives in exactly one place.

/// Path under which a run's initial input is stored.
pub const FLOW_INPUT: &str = "flow.input";

/// Path under which `resume` places user-supplied data.
pub const INTERACTION_USER_DATA: &str = "interaction.userData";

/// Path for a step's output value: `step.<id>.output`.
#[must_use]
pub fn step_output(step_id: &str) -> String {
    format!("step.{step_id}.output")
}

/// Path for a step's error message: `step.<id>.error`.
#[must_use]
pub fn step_error(step_id: &str) -> String {
    format!("step.{step_id}.error")
}

/// Path for a step's status: `step.<id>.status`.
#[must_use]
pub fn step_status(step_id: &str) -> String {
    format!("step.{step_id}.status")
}
