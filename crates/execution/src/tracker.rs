//! Hierarchical execution tracker.
//!
//! The tracker owns every [`ExecutionRecord`] and the parent/child topology.
//! It is the linearization point for execution lifecycles: a child id
//! observed through [`ExecutionTracker::children`] always has a record.
//!
//! Sequence numbers come from one process-wide monotone counter. They are
//! **not** per-parent contiguous — consumers must not interpret gaps.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use archflow_core::{ExecutionId, ExecutionKind};

use crate::record::{ExecutionRecord, RecordStatus};

/// Error returned by tracker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// `start_child` was called with an id the tracker does not know.
    #[error("parent execution not found: {0}")]
    ParentNotFound(String),
}

/// Aggregate counts over all tracked records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerStats {
    /// All records currently held.
    pub total: usize,
    /// Records still running.
    pub running: usize,
    /// Records that completed.
    pub completed: usize,
    /// Records that failed.
    pub failed: usize,
}

/// Concurrent registry of execution records.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    records: DashMap<ExecutionId, ExecutionRecord>,
    sequence: AtomicU32,
}

impl ExecutionTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            sequence: AtomicU32::new(0),
        }
    }

    /// Start tracking a new root execution.
    pub fn start_root(&self, kind: ExecutionKind) -> ExecutionId {
        let id = ExecutionId::new_root(kind);
        self.records
            .insert(id.clone(), ExecutionRecord::started(id.clone(), None));
        id
    }

    /// Start tracking a child of `parent`.
    ///
    /// Allocates the next process-wide sequence, creates the child record,
    /// then appends the child id to the parent's children.
    ///
    /// # Errors
    ///
    /// [`TrackerError::ParentNotFound`] when `parent` is unknown.
    pub fn start_child(
        &self,
        parent: &ExecutionId,
        kind: ExecutionKind,
    ) -> Result<ExecutionId, TrackerError> {
        let parent_depth = self
            .records
            .get(parent)
            .map(|r| r.id.depth())
            .ok_or_else(|| TrackerError::ParentNotFound(parent.to_string()))?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let child = parent
            .derive_child(kind)
            .with_sequence(seq)
            .with_depth(parent_depth + 1);

        // Insert the record before linking so any observer of the parent's
        // children can resolve the child.
        self.records.insert(
            child.clone(),
            ExecutionRecord::started(child.clone(), Some(parent.clone())),
        );

        match self.records.get_mut(parent) {
            Some(mut record) => record.children.push(child.clone()),
            None => {
                // Parent was removed concurrently; the child must not leak.
                self.records.remove(&child);
                return Err(TrackerError::ParentNotFound(parent.to_string()));
            }
        }

        Ok(child)
    }

    /// Transition a record to completed. Idempotent: a second terminal call
    /// is a no-op logged at debug.
    pub fn complete(&self, id: &ExecutionId, result: Option<Value>) {
        if let Some(mut record) = self.records.get_mut(id) {
            if record.status.is_terminal() {
                tracing::debug!(execution_id = %id, "ignoring repeated terminal transition");
                return;
            }
            record.mark_completed(result);
        }
    }

    /// Transition a record to failed. Idempotent like [`Self::complete`].
    pub fn fail(&self, id: &ExecutionId, error: impl Into<String>) {
        if let Some(mut record) = self.records.get_mut(id) {
            if record.status.is_terminal() {
                tracing::debug!(execution_id = %id, "ignoring repeated terminal transition");
                return;
            }
            record.mark_failed(error);
        }
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn record(&self, id: &ExecutionId) -> Option<ExecutionRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Snapshot of a record's children, in start order.
    #[must_use]
    pub fn children(&self, id: &ExecutionId) -> Option<Vec<ExecutionId>> {
        self.records.get(id).map(|r| r.children.clone())
    }

    /// All records under `root`, pre-order.
    #[must_use]
    pub fn hierarchy(&self, root: &ExecutionId) -> Vec<ExecutionRecord> {
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if let Some(record) = self.records.get(&id) {
                // Children are pushed reversed so the leftmost child is
                // visited first.
                for child in record.children.iter().rev() {
                    stack.push(child.clone());
                }
                out.push(record.clone());
            }
        }
        out
    }

    /// Remove a record and, recursively, every descendant. Also detaches the
    /// record from its parent's children.
    pub fn remove(&self, id: &ExecutionId) {
        let parent = self.records.get(id).and_then(|r| r.parent.clone());
        if let Some(parent_id) = parent {
            if let Some(mut parent_record) = self.records.get_mut(&parent_id) {
                parent_record.children.retain(|c| c != id);
            }
        }
        self.remove_subtree(id);
    }

    fn remove_subtree(&self, id: &ExecutionId) {
        let children = match self.records.remove(id) {
            Some((_, record)) => record.children,
            None => return,
        };
        for child in children {
            self.remove_subtree(&child);
        }
    }

    /// Remove every non-running record whose end instant precedes `cutoff`.
    pub fn cleanup(&self, cutoff: DateTime<Utc>) {
        let expired: Vec<ExecutionId> = self
            .records
            .iter()
            .filter(|r| r.ended_at.is_some_and(|end| end < cutoff))
            .map(|r| r.id.clone())
            .collect();
        for id in expired {
            // A parent removed earlier in the loop already dropped this
            // record; `remove` tolerates that.
            self.remove(&id);
        }
    }

    /// Aggregate counts over all records.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        let mut stats = TrackerStats::default();
        for record in &self.records {
            stats.total += 1;
            match record.status {
                RecordStatus::Running => stats.running += 1,
                RecordStatus::Completed => stats.completed += 1,
                RecordStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
