//! Per-run execution context.
//!
//! The context is a path-keyed bag of JSON values (`step.<id>.output`, …)
//! plus a metrics accumulator and the run's [`FlowState`]. It lives exactly
//! as long as one engine `run` call; suspension snapshots the data map and a
//! later resume restores it.
//!
//! Writes are performed by the currently executing step; reads are
//! unrestricted within the run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use archflow_core::{ExecutionId, keys};

use crate::result::{ExecutionMetrics, StepMetrics};
use crate::status::FlowStatus;

/// The run's identity and current status, visible to steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowState {
    /// The workflow being executed.
    pub flow_id: String,
    /// Current run status.
    pub status: FlowStatus,
}

#[derive(Debug, Default)]
struct MetricsAccumulator {
    tokens: AtomicU64,
    retries: AtomicU32,
    steps_completed: AtomicU32,
    steps_failed: AtomicU32,
}

/// Mutable per-run state shared across steps.
///
/// Cloning is cheap and shares the underlying state; the engine hands each
/// step task a clone.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The run's root execution id.
    pub execution_id: ExecutionId,
    data: Arc<RwLock<Map<String, Value>>>,
    metrics: Arc<MetricsAccumulator>,
    flow_state: Arc<RwLock<FlowState>>,
    /// Token for cooperative cancellation of the whole run.
    pub cancellation: CancellationToken,
    /// Authenticated principal, propagated explicitly (never thread-local).
    pub principal: Option<Arc<str>>,
}

impl ExecutionContext {
    /// Create a context for a new run.
    #[must_use]
    pub fn new(execution_id: ExecutionId, flow_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            data: Arc::new(RwLock::new(Map::new())),
            metrics: Arc::new(MetricsAccumulator::default()),
            flow_state: Arc::new(RwLock::new(FlowState {
                flow_id: flow_id.into(),
                status: FlowStatus::Running,
            })),
            cancellation: CancellationToken::new(),
            principal: None,
        }
    }

    /// Store the run-level input under `flow.input`.
    #[must_use]
    pub fn with_input(self, input: Value) -> Self {
        self.set(keys::FLOW_INPUT, input);
        self
    }

    /// Attach the authenticated principal.
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<Arc<str>>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Restore a context from a suspension snapshot.
    #[must_use]
    pub fn from_snapshot(
        execution_id: ExecutionId,
        flow_id: impl Into<String>,
        snapshot: Map<String, Value>,
    ) -> Self {
        let ctx = Self::new(execution_id, flow_id);
        *ctx.data.write() = snapshot;
        ctx
    }

    /// Write a value at a path. The last write wins.
    pub fn set(&self, path: impl Into<String>, value: Value) {
        self.data.write().insert(path.into(), value);
    }

    /// Read a value at a path.
    ///
    /// Resolves an exact key first, then descends into stored JSON: a lookup
    /// of `step.A.output.k` finds the value stored at `step.A.output` and
    /// navigates into its `k` member.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Value> {
        let data = self.data.read();
        if let Some(value) = data.get(path) {
            return Some(value.clone());
        }
        for (split, _) in path.rmatch_indices('.') {
            let (prefix, rest) = (&path[..split], &path[split + 1..]);
            if let Some(base) = data.get(prefix) {
                return descend(base, rest).cloned();
            }
        }
        None
    }

    /// Returns `true` if a path resolves to a value.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Snapshot the data map (for suspension records).
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        self.data.read().clone()
    }

    /// Current flow state.
    #[must_use]
    pub fn flow_state(&self) -> FlowState {
        self.flow_state.read().clone()
    }

    /// Update the run status.
    pub fn set_status(&self, status: FlowStatus) {
        self.flow_state.write().status = status;
    }

    /// Fold one step's measurements into the run accumulator.
    pub fn record_step(&self, metrics: &StepMetrics, failed: bool) {
        self.metrics.tokens.fetch_add(metrics.tokens, Ordering::Relaxed);
        self.metrics
            .retries
            .fetch_add(metrics.retry_count, Ordering::Relaxed);
        if failed {
            self.metrics.steps_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.steps_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Add tokens consumed outside step accounting (e.g. nested tool calls).
    pub fn add_tokens(&self, tokens: u64) {
        self.metrics.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Snapshot the aggregated run metrics.
    #[must_use]
    pub fn metrics(&self, duration_ms: u64) -> ExecutionMetrics {
        ExecutionMetrics {
            duration_ms,
            tokens: self.metrics.tokens.load(Ordering::Relaxed),
            steps_completed: self.metrics.steps_completed.load(Ordering::Relaxed),
            steps_failed: self.metrics.steps_failed.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
        }
    }
}

fn descend<'a>(base: &'a Value, rest: &str) -> Option<&'a Value> {
    rest.split('.').try_fold(base, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_core::ExecutionKind;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(ExecutionId::new_root(ExecutionKind::Flow), "wf-1")
    }

    #[test]
    fn set_then_get_exact_path() {
        let ctx = ctx();
        ctx.set(keys::step_output("A"), json!({"k": 1}));
        assert_eq!(ctx.get("step.A.output"), Some(json!({"k": 1})));
    }

    #[test]
    fn get_descends_into_stored_values() {
        let ctx = ctx();
        ctx.set(keys::step_output("A"), json!({"k": 1, "list": [10, 20]}));
        assert_eq!(ctx.get("step.A.output.k"), Some(json!(1)));
        assert_eq!(ctx.get("step.A.output.list.1"), Some(json!(20)));
        assert_eq!(ctx.get("step.A.output.missing"), None);
    }

    #[test]
    fn get_unknown_path_is_none() {
        let ctx = ctx();
        assert_eq!(ctx.get("step.Z.output"), None);
        assert!(!ctx.contains("step.Z.output"));
    }

    #[test]
    fn with_input_stores_under_flow_input() {
        let ctx = ctx().with_input(json!({"q": "hello"}));
        assert_eq!(ctx.get("flow.input.q"), Some(json!("hello")));
    }

    #[test]
    fn snapshot_restores_into_new_context() {
        let ctx = ctx();
        ctx.set(keys::step_output("A"), json!(42));
        let snapshot = ctx.snapshot();

        let restored = ExecutionContext::from_snapshot(
            ExecutionId::new_root(ExecutionKind::Flow),
            "wf-1",
            snapshot,
        );
        assert_eq!(restored.get("step.A.output"), Some(json!(42)));
    }

    #[test]
    fn metrics_accumulate_across_steps() {
        let ctx = ctx();
        ctx.record_step(
            &StepMetrics {
                duration_ms: 10,
                tokens: 100,
                retry_count: 1,
                ..StepMetrics::default()
            },
            false,
        );
        ctx.record_step(
            &StepMetrics {
                duration_ms: 5,
                tokens: 50,
                retry_count: 0,
                ..StepMetrics::default()
            },
            true,
        );

        let metrics = ctx.metrics(15);
        assert_eq!(metrics.tokens, 150);
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.steps_completed, 1);
        assert_eq!(metrics.steps_failed, 1);
        assert_eq!(metrics.duration_ms, 15);
    }

    #[test]
    fn clones_share_state() {
        let ctx = ctx();
        let clone = ctx.clone();
        clone.set("step.A.output", json!(1));
        assert_eq!(ctx.get("step.A.output"), Some(json!(1)));

        ctx.cancellation.cancel();
        assert!(clone.cancellation.is_cancelled());
    }

    #[test]
    fn status_updates_are_visible() {
        let ctx = ctx();
        assert_eq!(ctx.flow_state().status, FlowStatus::Running);
        ctx.set_status(FlowStatus::Suspended);
        assert_eq!(ctx.flow_state().status, FlowStatus::Suspended);
        assert_eq!(ctx.flow_state().flow_id, "wf-1");
    }
}
