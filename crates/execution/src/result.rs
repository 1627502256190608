//! Step and flow result types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{FlowStatus, StepStatus};

/// One error recorded against a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Machine-readable error kind (`RetryExhausted`, `StepTimeout`, …).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// When the error occurred.
    pub at: DateTime<Utc>,
}

impl StepError {
    /// Create an error stamped now.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Per-step numeric measurements.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Wall-clock duration of the step, retries included.
    pub duration_ms: u64,
    /// Tokens consumed by the step.
    pub tokens: u64,
    /// Retries performed beyond the first attempt.
    pub retry_count: u32,
    /// Additional numeric attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

/// Outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step's id within the workflow.
    pub step_id: String,
    /// Outcome status.
    pub status: StepStatus,
    /// Output value for completed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Errors, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepError>,
    /// Measurements for this step.
    #[serde(default)]
    pub metrics: StepMetrics,
    /// Resume token when the step suspended the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl StepResult {
    /// A completed step with an output value.
    #[must_use]
    pub fn completed(step_id: impl Into<String>, output: Value) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            output: Some(output),
            errors: Vec::new(),
            metrics: StepMetrics::default(),
            resume_token: None,
        }
    }

    /// A failed step.
    #[must_use]
    pub fn failed(step_id: impl Into<String>, error: StepError) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            errors: vec![error],
            metrics: StepMetrics::default(),
            resume_token: None,
        }
    }

    /// A skipped step.
    #[must_use]
    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: None,
            errors: Vec::new(),
            metrics: StepMetrics::default(),
            resume_token: None,
        }
    }

    /// A step that suspended the run.
    #[must_use]
    pub fn suspended(step_id: impl Into<String>, resume_token: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Suspended,
            output: None,
            errors: Vec::new(),
            metrics: StepMetrics::default(),
            resume_token: Some(resume_token.into()),
        }
    }

    /// A step cancelled by a stop request.
    #[must_use]
    pub fn cancelled(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Cancelled,
            output: None,
            errors: vec![StepError::new("Cancelled", "step cancelled")],
            metrics: StepMetrics::default(),
            resume_token: None,
        }
    }

    /// Replace the metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// One error in a run's ordered error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// The step that produced the error, when attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Machine-readable error kind.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// When the error occurred. Orders the run's error list.
    pub at: DateTime<Utc>,
}

impl ExecutionError {
    /// Create an error stamped now.
    #[must_use]
    pub fn new(
        step_id: Option<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_id,
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Aggregated measurements for a whole run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Tokens consumed across all steps.
    pub tokens: u64,
    /// Steps that completed.
    pub steps_completed: u32,
    /// Steps that failed.
    pub steps_failed: u32,
    /// Retries performed across all steps.
    pub retries: u32,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    /// The run's root execution id.
    pub run_id: String,
    /// Terminal status (or `Suspended` with a resume token).
    pub status: FlowStatus,
    /// Output of the last completed terminal step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Aggregated run metrics.
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    /// Errors ordered by time of occurrence; the first is the primary cause.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExecutionError>,
    /// Present iff status is `Suspended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl FlowResult {
    /// Returns `true` if the run completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
