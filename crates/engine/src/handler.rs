//! Step handlers.
//!
//! A step's `type` selects a [`StepHandler`] from the [`StepRegistry`].
//! Built-ins cover tool dispatch, context transforms, human-interaction
//! waits and no-ops; applications register their own handlers for anything
//! else (LLM adapters, vector stores, …).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use archflow_execution::{ExecutionContext, StepResult};
use archflow_expression::{PathResolver, evaluate};
use archflow_streaming::StreamingRegistry;
use archflow_tool::{ToolError, ToolInvoker};
use archflow_workflow::Step;

/// Error raised by a handler. The engine converts it into a failed
/// [`StepResult`]; it never escapes a step boundary.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Handler-specific failure.
    #[error("{0}")]
    Message(String),
    /// A tool invocation failed.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl HandlerError {
    /// Machine-readable error kind, aligned with the engine error taxonomy.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "StepFailed",
            Self::Tool(ToolError::NotFound(_)) => "ToolNotFound",
            Self::Tool(ToolError::Halted { .. }) => "InterceptorHalt",
            Self::Tool(ToolError::Validation { .. }) => "ValidationFailure",
            Self::Tool(ToolError::RetryExhausted { .. }) => "RetryExhausted",
            Self::Tool(ToolError::Cancelled) => "Cancelled",
            Self::Tool(_) => "ToolFailed",
        }
    }
}

/// Executes one step type.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The step `type` this handler serves.
    fn step_type(&self) -> &str;

    /// Execute a step. Returning an error is equivalent to returning a
    /// failed result; the engine treats both identically.
    async fn execute(&self, step: &Step, ctx: &ExecutionContext)
    -> Result<StepResult, HandlerError>;
}

/// Concurrent step-type → handler mapping.
#[derive(Default, Clone)]
pub struct StepRegistry {
    handlers: Arc<DashMap<String, Arc<dyn StepHandler>>>,
}

impl StepRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own step type.
    pub fn register(&self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.step_type().to_owned(), handler);
    }

    /// Look up the handler for a step type.
    #[must_use]
    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).map(|h| Arc::clone(&h))
    }
}

/// Resolves expression paths against an execution context.
pub(crate) struct CtxResolver<'a>(pub &'a ExecutionContext);

impl PathResolver for CtxResolver<'_> {
    fn resolve(&self, path: &str) -> Option<Value> {
        self.0.get(path)
    }
}

/// Completes immediately with the configured `value` (default null).
pub struct NoopHandler;

#[async_trait]
impl StepHandler for NoopHandler {
    fn step_type(&self) -> &str {
        "noop"
    }

    async fn execute(
        &self,
        step: &Step,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, HandlerError> {
        let output = step.config.get("value").cloned().unwrap_or(Value::Null);
        Ok(StepResult::completed(&step.id, output))
    }
}

/// Produces an output from the context.
///
/// Config keys: `expression` (evaluated over ctx paths) or `value` (static);
/// optional `emit_delta` publishes a `chat/delta` with the given content.
pub struct TransformHandler {
    streaming: Arc<StreamingRegistry>,
}

impl TransformHandler {
    /// Create a transform handler publishing through `streaming`.
    #[must_use]
    pub fn new(streaming: Arc<StreamingRegistry>) -> Self {
        Self { streaming }
    }
}

#[async_trait]
impl StepHandler for TransformHandler {
    fn step_type(&self) -> &str {
        "transform"
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, HandlerError> {
        if let Some(content) = step.config.get("emit_delta").and_then(Value::as_str) {
            self.streaming.publish(
                &ctx.execution_id,
                archflow_event::ArchflowEvent::chat_delta(&ctx.execution_id, content, None),
            );
        }

        let output = match step.config.get("expression").and_then(Value::as_str) {
            Some(source) => evaluate(source, &CtxResolver(ctx))
                .map_err(|e| HandlerError::Message(format!("transform failed: {e}")))?,
            None => step.config.get("value").cloned().unwrap_or(Value::Null),
        };
        Ok(StepResult::completed(&step.id, output))
    }
}

/// Suspends the run awaiting human interaction.
///
/// Config keys: `reason` and `timeout_ms` feed the `interaction/suspend`
/// event the engine publishes.
pub struct WaitHandler;

#[async_trait]
impl StepHandler for WaitHandler {
    fn step_type(&self) -> &str {
        "wait"
    }

    async fn execute(
        &self,
        step: &Step,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, HandlerError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        Ok(StepResult::suspended(&step.id, token))
    }
}

/// Dispatches through the tool invoker as a child execution of the run.
///
/// Config keys: `tool` (required), plus either `input` (static JSON) or
/// `input_path` (a ctx path resolved at execution time).
pub struct ToolStepHandler {
    invoker: Arc<ToolInvoker>,
    streaming: Arc<StreamingRegistry>,
}

impl ToolStepHandler {
    /// Create a tool step handler.
    #[must_use]
    pub fn new(invoker: Arc<ToolInvoker>, streaming: Arc<StreamingRegistry>) -> Self {
        Self { invoker, streaming }
    }
}

#[async_trait]
impl StepHandler for ToolStepHandler {
    fn step_type(&self) -> &str {
        "tool"
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, HandlerError> {
        let tool_name = step
            .config
            .get("tool")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::Message("tool step is missing 'tool'".into()))?;

        let input = match step.config.get("input_path").and_then(Value::as_str) {
            Some(path) => ctx.get(path).unwrap_or(Value::Null),
            None => step.config.get("input").cloned().unwrap_or(Value::Null),
        };

        let call_id = uuid::Uuid::new_v4().simple().to_string();
        self.streaming.publish(
            &ctx.execution_id,
            archflow_event::ArchflowEvent::tool_start(
                &ctx.execution_id,
                tool_name,
                &call_id,
                input.clone(),
            ),
        );

        let started = std::time::Instant::now();
        let output = self
            .invoker
            .execute_child(&ctx.execution_id, tool_name, input, ctx)
            .await?;

        self.streaming.publish(
            &ctx.execution_id,
            archflow_event::ArchflowEvent::tool_result(
                &ctx.execution_id,
                tool_name,
                &call_id,
                output.clone(),
                started.elapsed().as_millis() as u64,
            ),
        );

        Ok(StepResult::completed(&step.id, output))
    }
}
