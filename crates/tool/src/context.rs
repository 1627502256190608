//! Per-invocation tool context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

use archflow_core::ExecutionId;
use archflow_execution::ExecutionContext;

/// Reserved attribute key: invocation start in epoch milliseconds, written
/// by the metering interceptor.
pub const METRICS_START_TIME: &str = "_metrics.startTime";

#[derive(Debug, Default)]
struct Slots {
    result: RwLock<Option<Value>>,
    error: RwLock<Option<String>>,
    ended_at: RwLock<Option<Instant>>,
}

/// Everything an interceptor or tool can see about one invocation.
///
/// Cloning shares the underlying state, so a recovery result set by an
/// `on_error` hook is visible to the chain.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Execution id minted for this invocation.
    pub execution_id: ExecutionId,
    /// The tool being invoked.
    pub tool_name: String,
    /// The invocation input.
    pub input: Value,
    /// The run-wide execution context.
    pub run: ExecutionContext,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
    started: Instant,
    /// Concurrent free-form attributes shared along the chain.
    pub attributes: Arc<DashMap<String, Value>>,
    cached: Arc<AtomicBool>,
    slots: Arc<Slots>,
}

impl ToolContext {
    /// Create a context for one invocation.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        tool_name: impl Into<String>,
        input: Value,
        run: ExecutionContext,
    ) -> Self {
        Self {
            execution_id,
            tool_name: tool_name.into(),
            input,
            run,
            started_at: Utc::now(),
            started: Instant::now(),
            attributes: Arc::new(DashMap::new()),
            cached: Arc::new(AtomicBool::new(false)),
            slots: Arc::new(Slots::default()),
        }
    }

    /// Set an attribute.
    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Read an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.get(key).map(|v| v.clone())
    }

    /// Mark this invocation as served from cache.
    pub fn mark_cached(&self) {
        self.cached.store(true, Ordering::Release);
    }

    /// Whether the result came from cache.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    /// Set the invocation result. Used by the chain on success and by
    /// `on_error` hooks that recover.
    pub fn set_result(&self, value: Value) {
        *self.slots.result.write() = Some(value);
    }

    /// The invocation result, when set.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        self.slots.result.read().clone()
    }

    /// Record the invocation error.
    pub fn set_error(&self, message: impl Into<String>) {
        *self.slots.error.write() = Some(message.into());
    }

    /// The invocation error, when set.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.slots.error.read().clone()
    }

    /// Mark the invocation finished.
    pub fn mark_ended(&self) {
        *self.slots.ended_at.write() = Some(Instant::now());
    }

    /// Elapsed time, up to the end instant once marked.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        let end = self.slots.ended_at.read();
        let elapsed = match *end {
            Some(end) => end.duration_since(self.started),
            None => self.started.elapsed(),
        };
        elapsed.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_core::ExecutionKind;
    use serde_json::json;

    fn tool_ctx() -> ToolContext {
        let run = ExecutionContext::new(ExecutionId::new_root(ExecutionKind::Flow), "wf");
        ToolContext::new(
            ExecutionId::new_root(ExecutionKind::Tool),
            "search",
            json!({"q": "x"}),
            run,
        )
    }

    #[test]
    fn attributes_are_shared_across_clones() {
        let ctx = tool_ctx();
        let clone = ctx.clone();
        clone.set_attribute(METRICS_START_TIME, json!(123));
        assert_eq!(ctx.attribute(METRICS_START_TIME), Some(json!(123)));
    }

    #[test]
    fn result_and_error_slots() {
        let ctx = tool_ctx();
        assert!(ctx.result().is_none());
        ctx.set_result(json!(1));
        ctx.set_error("late error");
        assert_eq!(ctx.result(), Some(json!(1)));
        assert_eq!(ctx.error().as_deref(), Some("late error"));
    }

    #[test]
    fn cached_flag() {
        let ctx = tool_ctx();
        assert!(!ctx.is_cached());
        ctx.mark_cached();
        assert!(ctx.is_cached());
    }

    #[test]
    fn elapsed_freezes_once_ended() {
        let ctx = tool_ctx();
        ctx.mark_ended();
        let first = ctx.elapsed_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(ctx.elapsed_ms(), first);
    }
}
