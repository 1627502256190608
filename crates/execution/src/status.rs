//! Step- and flow-level status enums.

use serde::{Deserialize, Serialize};

/// Outcome status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step finished and produced an output.
    Completed,
    /// The step failed after exhausting any configured retries.
    Failed,
    /// The step never ran because no live inbound path selected it.
    Skipped,
    /// The step suspended the run awaiting external interaction.
    Suspended,
    /// The step was cancelled by a stop request. Distinct from `Failed`.
    Cancelled,
}

impl StepStatus {
    /// Returns `true` if traversal should continue along success edges.
    ///
    /// Skipped steps traverse like completed ones.
    #[must_use]
    pub fn advances(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Suspended => write!(f, "suspended"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Steps are being scheduled.
    Running,
    /// Every reachable step finished.
    Completed,
    /// The run terminated on an unrecovered failure.
    Failed,
    /// The run is parked awaiting a `resume` call.
    Suspended,
    /// The run was stopped by request.
    Stopped,
}

impl FlowStatus {
    /// Returns `true` if the run has reached a final state.
    ///
    /// Suspended runs are not terminal — they can be resumed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Returns `true` if the run completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Suspended => write!(f, "suspended"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_steps_advance_like_completed() {
        assert!(StepStatus::Completed.advances());
        assert!(StepStatus::Skipped.advances());
        assert!(!StepStatus::Failed.advances());
        assert!(!StepStatus::Suspended.advances());
        assert!(!StepStatus::Cancelled.advances());
    }

    #[test]
    fn suspended_flows_are_not_terminal() {
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(FlowStatus::Stopped.is_terminal());
        assert!(!FlowStatus::Suspended.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&StepStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(serde_json::to_string(&FlowStatus::Suspended).unwrap(), "\"suspended\"");
    }

    #[test]
    fn serde_roundtrip() {
        for status in [
            FlowStatus::Running,
            FlowStatus::Completed,
            FlowStatus::Failed,
            FlowStatus::Suspended,
            FlowStatus::Stopped,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let back: FlowStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }
}
