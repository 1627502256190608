//! Tracked lifecycle state of one execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use archflow_core::ExecutionId;

/// Lifecycle status of a tracked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// The execution is in flight.
    Running,
    /// The execution finished with a result.
    Completed,
    /// The execution finished with an error.
    Failed,
}

impl RecordStatus {
    /// Returns `true` once the record can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One execution's tracked state.
///
/// Children are stored as ids only — navigation always goes back through the
/// tracker's map, so records never form reference cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// The execution's identity.
    pub id: ExecutionId,
    /// The parent execution, `None` for roots.
    #[serde(default)]
    pub parent: Option<ExecutionId>,
    /// When tracking started.
    pub started_at: DateTime<Utc>,
    /// When the record went terminal. Present iff status ≠ running.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Current lifecycle status.
    pub status: RecordStatus,
    /// Child executions, in start order. Append-only while running.
    #[serde(default)]
    pub children: Vec<ExecutionId>,
    /// Result value if the execution completed.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error message if the execution failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Create a running record.
    #[must_use]
    pub fn started(id: ExecutionId, parent: Option<ExecutionId>) -> Self {
        Self {
            id,
            parent,
            started_at: Utc::now(),
            ended_at: None,
            status: RecordStatus::Running,
            children: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// Returns `true` while the execution is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == RecordStatus::Running
    }

    /// Wall-clock duration, available once terminal.
    #[must_use]
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.ended_at
            .map(|end| (end - self.started_at).to_std().unwrap_or_default())
    }

    pub(crate) fn mark_completed(&mut self, result: Option<Value>) {
        self.status = RecordStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.result = result;
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RecordStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_core::ExecutionKind;

    #[test]
    fn started_record_is_running_without_end_instant() {
        let record = ExecutionRecord::started(ExecutionId::new_root(ExecutionKind::Flow), None);
        assert!(record.is_running());
        assert!(record.ended_at.is_none());
        assert!(record.duration().is_none());
        assert!(record.children.is_empty());
    }

    #[test]
    fn completion_sets_end_instant_and_result() {
        let mut record = ExecutionRecord::started(ExecutionId::new_root(ExecutionKind::Tool), None);
        record.mark_completed(Some(serde_json::json!({"ok": true})));
        assert_eq!(record.status, RecordStatus::Completed);
        assert!(record.ended_at.is_some());
        assert!(record.duration().is_some());
        assert_eq!(record.result, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn failure_sets_error() {
        let mut record = ExecutionRecord::started(ExecutionId::new_root(ExecutionKind::Tool), None);
        record.mark_failed("boom");
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RecordStatus::Running.is_terminal());
        assert!(RecordStatus::Completed.is_terminal());
        assert!(RecordStatus::Failed.is_terminal());
    }
}
