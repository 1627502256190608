//! Built-in interceptors: validate → log → cache → meter.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::{debug, warn};

use archflow_metrics::MetricsRegistry;

use crate::ToolError;
use crate::chain::{InterceptorHalt, ToolInterceptor};
use crate::context::{METRICS_START_TIME, ToolContext};
use crate::registry::ToolRegistry;

/// Checks the invocation input against the tool's declared schema.
pub struct ValidationInterceptor {
    registry: ToolRegistry,
}

impl ValidationInterceptor {
    /// Create a validator resolving schemas from `registry`.
    #[must_use]
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolInterceptor for ValidationInterceptor {
    fn name(&self) -> &str {
        "validation"
    }

    fn order(&self) -> i32 {
        10
    }

    async fn before_execute(&self, ctx: &ToolContext) -> Result<(), InterceptorHalt> {
        let Some(tool) = self.registry.get(&ctx.tool_name) else {
            return Ok(());
        };
        if let Some(schema) = tool.input_schema() {
            if let Err(violations) = schema.validate(&ctx.input) {
                return Err(InterceptorHalt::new(format!(
                    "input validation failed: {}",
                    violations.join("; ")
                )));
            }
        }
        Ok(())
    }
}

/// Structured logging around every invocation.
pub struct LoggingInterceptor;

#[async_trait]
impl ToolInterceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    fn order(&self) -> i32 {
        20
    }

    async fn before_execute(&self, ctx: &ToolContext) -> Result<(), InterceptorHalt> {
        debug!(tool = %ctx.tool_name, execution_id = %ctx.execution_id, "tool invocation started");
        Ok(())
    }

    async fn after_execute(
        &self,
        ctx: &ToolContext,
        result: Value,
    ) -> Result<Value, InterceptorHalt> {
        debug!(
            tool = %ctx.tool_name,
            execution_id = %ctx.execution_id,
            duration_ms = ctx.elapsed_ms(),
            cached = ctx.is_cached(),
            "tool invocation finished"
        );
        Ok(result)
    }

    async fn on_error(&self, ctx: &ToolContext, error: &ToolError) {
        warn!(
            tool = %ctx.tool_name,
            execution_id = %ctx.execution_id,
            %error,
            "tool invocation failed"
        );
    }
}

/// Memoizes results by (tool, input).
///
/// Entries never expire; the cache is scoped to the process and meant for
/// idempotent lookup tools.
#[derive(Default)]
pub struct CacheInterceptor {
    entries: DashMap<String, Value>,
}

impl CacheInterceptor {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(ctx: &ToolContext) -> String {
        format!("{}:{}", ctx.tool_name, ctx.input)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ToolInterceptor for CacheInterceptor {
    fn name(&self) -> &str {
        "cache"
    }

    fn order(&self) -> i32 {
        30
    }

    async fn before_execute(&self, ctx: &ToolContext) -> Result<(), InterceptorHalt> {
        if let Some(hit) = self.entries.get(&Self::key(ctx)) {
            ctx.set_result(hit.clone());
            ctx.mark_cached();
        }
        Ok(())
    }

    async fn after_execute(
        &self,
        ctx: &ToolContext,
        result: Value,
    ) -> Result<Value, InterceptorHalt> {
        if !ctx.is_cached() {
            self.entries.insert(Self::key(ctx), result.clone());
        }
        Ok(result)
    }
}

/// Records invocation counters and durations into the metrics registry.
pub struct MeterInterceptor {
    metrics: MetricsRegistry,
}

impl MeterInterceptor {
    /// Create a meter writing into `metrics`.
    #[must_use]
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl ToolInterceptor for MeterInterceptor {
    fn name(&self) -> &str {
        "meter"
    }

    fn order(&self) -> i32 {
        40
    }

    async fn before_execute(&self, ctx: &ToolContext) -> Result<(), InterceptorHalt> {
        ctx.set_attribute(
            METRICS_START_TIME,
            json!(chrono::Utc::now().timestamp_millis()),
        );
        Ok(())
    }

    async fn after_execute(
        &self,
        ctx: &ToolContext,
        result: Value,
    ) -> Result<Value, InterceptorHalt> {
        self.metrics.counter("archflow_tool_invocations_total").inc();
        if ctx.is_cached() {
            self.metrics.counter("archflow_tool_cache_hits_total").inc();
        }
        self.metrics
            .series("archflow_tool_duration_ms")
            .record(ctx.elapsed_ms() as f64);
        Ok(result)
    }

    async fn on_error(&self, _ctx: &ToolContext, _error: &ToolError) {
        self.metrics.counter("archflow_tool_errors_total").inc();
    }
}
