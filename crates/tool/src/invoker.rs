//! Tracked tool invocation.
//!
//! The invoker is the only place that couples the execution tracker and the
//! interceptor chain. Every invocation — root or nested — goes through
//! [`ToolInvoker::execute`] / [`ToolInvoker::execute_child`].

use std::sync::Arc;

use serde_json::Value;

use archflow_core::{ExecutionId, ExecutionKind};
use archflow_execution::{ExecutionContext, ExecutionTracker};
use archflow_resilience::{NoopListener, RetryError, execute_with_retry};

use crate::ToolError;
use crate::chain::InterceptorChain;
use crate::context::ToolContext;
use crate::registry::ToolRegistry;

/// Orchestrates tracker + chain + registry for every tool call.
pub struct ToolInvoker {
    tracker: Arc<ExecutionTracker>,
    registry: ToolRegistry,
    chain: InterceptorChain,
}

impl ToolInvoker {
    /// Create an invoker over the given tracker, registry and chain.
    #[must_use]
    pub fn new(tracker: Arc<ExecutionTracker>, registry: ToolRegistry, chain: InterceptorChain) -> Self {
        Self {
            tracker,
            registry,
            chain,
        }
    }

    /// The registry this invoker resolves tools from.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// The tracker recording invocation lifecycles.
    #[must_use]
    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// Invoke a tool as a root execution.
    ///
    /// # Errors
    ///
    /// [`ToolError`] — unknown tool, interceptor halt, execution failure,
    /// validation failure or retry exhaustion.
    pub async fn execute(
        &self,
        tool_name: &str,
        input: Value,
        run: &ExecutionContext,
    ) -> Result<Value, ToolError> {
        let execution_id = self.tracker.start_root(ExecutionKind::Tool);
        self.dispatch(execution_id, tool_name, input, run).await
    }

    /// Invoke a tool as a child of an existing execution.
    ///
    /// # Errors
    ///
    /// [`ToolError::Tracker`] when the parent is unknown, otherwise as
    /// [`ToolInvoker::execute`].
    pub async fn execute_child(
        &self,
        parent: &ExecutionId,
        tool_name: &str,
        input: Value,
        run: &ExecutionContext,
    ) -> Result<Value, ToolError> {
        let execution_id = self.tracker.start_child(parent, ExecutionKind::Tool)?;
        self.dispatch(execution_id, tool_name, input, run).await
    }

    async fn dispatch(
        &self,
        execution_id: ExecutionId,
        tool_name: &str,
        input: Value,
        run: &ExecutionContext,
    ) -> Result<Value, ToolError> {
        let ctx = ToolContext::new(execution_id.clone(), tool_name, input, run.clone());

        let result = match self.registry.get(tool_name) {
            Some(tool) => self.run_through_chain(&tool, &ctx).await,
            None => Err(ToolError::NotFound(tool_name.to_owned())),
        };

        match &result {
            Ok(value) => self.tracker.complete(&execution_id, Some(value.clone())),
            Err(error) => self.tracker.fail(&execution_id, error.to_string()),
        }
        result
    }

    async fn run_through_chain(
        &self,
        tool: &Arc<dyn crate::registry::Tool>,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let policy = tool.retry_policy().cloned();
        self.chain
            .dispatch(ctx, || {
                let tool = Arc::clone(tool);
                let ctx = ctx.clone();
                async move {
                    match policy {
                        None => tool.execute(ctx.input.clone(), &ctx).await,
                        Some(policy) => {
                            let outcome = execute_with_retry(
                                &policy,
                                &NoopListener,
                                &ctx.run.cancellation,
                                || {
                                    let tool = Arc::clone(&tool);
                                    let ctx = ctx.clone();
                                    async move { tool.execute(ctx.input.clone(), &ctx).await }
                                },
                            )
                            .await;
                            match outcome {
                                Ok(outcome) if outcome.validation_failed => {
                                    let violations = outcome
                                        .attempts
                                        .last()
                                        .and_then(|a| a.error.clone())
                                        .map_or_else(Vec::new, |e| vec![e]);
                                    Err(ToolError::Validation { violations })
                                }
                                Ok(outcome) => Ok(outcome.value.unwrap_or(Value::Null)),
                                Err(RetryError::Exhausted { attempts }) => {
                                    Err(ToolError::RetryExhausted { attempts })
                                }
                                Err(RetryError::InvalidConfig(message)) => {
                                    Err(ToolError::Execution(message))
                                }
                            }
                        }
                    }
                }
            })
            .await
    }
}
