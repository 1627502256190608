//! Ordered interceptor chain around tool execution.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ToolError;
use crate::context::ToolContext;

/// Raised by a hook to stop the invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct InterceptorHalt {
    /// Why the hook halted the chain.
    pub reason: String,
}

impl InterceptorHalt {
    /// Halt with a reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Middleware around a tool invocation.
///
/// `before_execute` hooks run in ascending `order`; `after_execute` and
/// `on_error` run in reverse.
#[async_trait]
pub trait ToolInterceptor: Send + Sync {
    /// Interceptor name, used in errors and logs.
    fn name(&self) -> &str;

    /// Position in the chain; lower runs earlier. Ties preserve
    /// registration order.
    fn order(&self) -> i32 {
        0
    }

    /// Runs before the tool. A halt skips the invocation.
    async fn before_execute(&self, _ctx: &ToolContext) -> Result<(), InterceptorHalt> {
        Ok(())
    }

    /// Runs after a successful invocation, in reverse order. May transform
    /// the result.
    async fn after_execute(
        &self,
        _ctx: &ToolContext,
        result: Value,
    ) -> Result<Value, InterceptorHalt> {
        Ok(result)
    }

    /// Runs after a failed invocation, in reverse order. An interceptor may
    /// recover by setting a result on the context.
    async fn on_error(&self, _ctx: &ToolContext, _error: &ToolError) {}
}

/// The ordered pipeline. Sorted ascending by `order`; ties keep
/// registration order.
#[derive(Default, Clone)]
pub struct InterceptorChain {
    // (registration index kept implicitly by the stable sort)
    interceptors: Vec<Arc<dyn ToolInterceptor>>,
}

impl InterceptorChain {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interceptor, keeping the chain sorted.
    pub fn register(&mut self, interceptor: Arc<dyn ToolInterceptor>) {
        self.interceptors.push(interceptor);
        self.interceptors.sort_by_key(|i| i.order());
    }

    /// Number of registered interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Drive one invocation through the chain.
    ///
    /// 1. `before_execute` in order — a halt skips the invocation and is
    ///    surfaced as [`ToolError::Halted`].
    /// 2. The executor — skipped when a before hook already produced a
    ///    cached result on the context.
    /// 3. On success, `after_execute` in reverse order, each able to
    ///    transform the result.
    /// 4. On failure, `on_error` in reverse order; a recovery result set on
    ///    the context replaces the error, which is otherwise re-raised.
    ///
    /// # Errors
    ///
    /// [`ToolError::Halted`] from a hook, or whatever the executor raised
    /// when no interceptor recovered.
    pub async fn dispatch<F, Fut>(&self, ctx: &ToolContext, executor: F) -> Result<Value, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ToolError>>,
    {
        for interceptor in &self.interceptors {
            if let Err(halt) = interceptor.before_execute(ctx).await {
                ctx.mark_ended();
                ctx.set_error(&halt.reason);
                return Err(ToolError::Halted {
                    interceptor: interceptor.name().to_owned(),
                    reason: halt.reason,
                });
            }
        }

        // A before hook (the cache) may have produced the result already.
        let outcome = match ctx.result() {
            Some(cached) if ctx.is_cached() => Ok(cached),
            _ => executor().await,
        };

        match outcome {
            Ok(mut result) => {
                for interceptor in self.interceptors.iter().rev() {
                    match interceptor.after_execute(ctx, result).await {
                        Ok(transformed) => result = transformed,
                        Err(halt) => {
                            ctx.mark_ended();
                            ctx.set_error(&halt.reason);
                            return Err(ToolError::Halted {
                                interceptor: interceptor.name().to_owned(),
                                reason: halt.reason,
                            });
                        }
                    }
                }
                ctx.set_result(result.clone());
                ctx.mark_ended();
                Ok(result)
            }
            Err(error) => {
                ctx.set_error(error.to_string());
                for interceptor in self.interceptors.iter().rev() {
                    interceptor.on_error(ctx, &error).await;
                }
                ctx.mark_ended();
                match ctx.result() {
                    Some(recovered) => Ok(recovered),
                    None => Err(error),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_core::{ExecutionId, ExecutionKind};
    use archflow_execution::ExecutionContext;
    use parking_lot::Mutex;
    use serde_json::json;

    fn tool_ctx() -> ToolContext {
        let run = ExecutionContext::new(ExecutionId::new_root(ExecutionKind::Flow), "wf");
        ToolContext::new(
            ExecutionId::new_root(ExecutionKind::Tool),
            "echo",
            json!({"v": 1}),
            run,
        )
    }

    struct Recorder {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ToolInterceptor for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        async fn before_execute(&self, _ctx: &ToolContext) -> Result<(), InterceptorHalt> {
            self.log.lock().push(format!("before:{}", self.name));
            Ok(())
        }
        async fn after_execute(
            &self,
            _ctx: &ToolContext,
            result: Value,
        ) -> Result<Value, InterceptorHalt> {
            self.log.lock().push(format!("after:{}", self.name));
            Ok(result)
        }
        async fn on_error(&self, _ctx: &ToolContext, _error: &ToolError) {
            self.log.lock().push(format!("error:{}", self.name));
        }
    }

    fn recorder_chain(log: &Arc<Mutex<Vec<String>>>) -> InterceptorChain {
        let mut chain = InterceptorChain::new();
        // Registered out of order on purpose.
        chain.register(Arc::new(Recorder {
            name: "b",
            order: 20,
            log: Arc::clone(log),
        }));
        chain.register(Arc::new(Recorder {
            name: "a",
            order: 10,
            log: Arc::clone(log),
        }));
        chain
    }

    #[tokio::test]
    async fn before_in_order_after_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = recorder_chain(&log);
        let ctx = tool_ctx();

        let result = chain.dispatch(&ctx, || async { Ok(json!(7)) }).await.unwrap();

        assert_eq!(result, json!(7));
        assert_eq!(
            *log.lock(),
            vec!["before:a", "before:b", "after:b", "after:a"]
        );
        assert_eq!(ctx.result(), Some(json!(7)));
    }

    #[tokio::test]
    async fn order_ties_preserve_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        for name in ["first", "second"] {
            chain.register(Arc::new(Recorder {
                name,
                order: 5,
                log: Arc::clone(&log),
            }));
        }
        chain
            .dispatch(&tool_ctx(), || async { Ok(json!(null)) })
            .await
            .unwrap();
        assert_eq!(log.lock()[0], "before:first");
        assert_eq!(log.lock()[1], "before:second");
    }

    struct HaltingBefore;

    #[async_trait]
    impl ToolInterceptor for HaltingBefore {
        fn name(&self) -> &str {
            "halting"
        }
        async fn before_execute(&self, _ctx: &ToolContext) -> Result<(), InterceptorHalt> {
            Err(InterceptorHalt::new("policy says no"))
        }
    }

    #[tokio::test]
    async fn halt_in_before_skips_the_invocation() {
        let mut chain = InterceptorChain::new();
        chain.register(Arc::new(HaltingBefore));
        let invoked = Arc::new(Mutex::new(false));

        let err = chain
            .dispatch(&tool_ctx(), || {
                let invoked = Arc::clone(&invoked);
                async move {
                    *invoked.lock() = true;
                    Ok(json!(1))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::Halted { ref interceptor, .. } if interceptor == "halting"));
        assert!(!*invoked.lock());
    }

    struct Doubler;

    #[async_trait]
    impl ToolInterceptor for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }
        async fn after_execute(
            &self,
            _ctx: &ToolContext,
            result: Value,
        ) -> Result<Value, InterceptorHalt> {
            Ok(json!(result.as_i64().unwrap_or(0) * 2))
        }
    }

    #[tokio::test]
    async fn after_hooks_transform_the_result() {
        let mut chain = InterceptorChain::new();
        chain.register(Arc::new(Doubler));
        let result = chain
            .dispatch(&tool_ctx(), || async { Ok(json!(21)) })
            .await
            .unwrap();
        assert_eq!(result, json!(42));
    }

    struct Recoverer;

    #[async_trait]
    impl ToolInterceptor for Recoverer {
        fn name(&self) -> &str {
            "recoverer"
        }
        async fn on_error(&self, ctx: &ToolContext, _error: &ToolError) {
            ctx.set_result(json!("fallback"));
        }
    }

    #[tokio::test]
    async fn on_error_can_swallow_and_recover() {
        let mut chain = InterceptorChain::new();
        chain.register(Arc::new(Recoverer));
        let result = chain
            .dispatch(&tool_ctx(), || async {
                Err(ToolError::Execution("boom".into()))
            })
            .await
            .unwrap();
        assert_eq!(result, json!("fallback"));
    }

    #[tokio::test]
    async fn unrecovered_error_walks_hooks_then_reraises() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = recorder_chain(&log);
        let ctx = tool_ctx();

        let err = chain
            .dispatch(&ctx, || async { Err(ToolError::Execution("boom".into())) })
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::Execution(_)));
        assert_eq!(
            *log.lock(),
            vec!["before:a", "before:b", "error:b", "error:a"]
        );
        assert_eq!(ctx.error().as_deref(), Some("tool execution failed: boom"));
    }

    #[tokio::test]
    async fn cached_result_skips_the_executor() {
        let chain = InterceptorChain::new();
        let ctx = tool_ctx();
        ctx.set_result(json!("cached"));
        ctx.mark_cached();

        let result = chain
            .dispatch(&ctx, || async {
                panic!("executor must not run on cache hit")
            })
            .await
            .unwrap();
        assert_eq!(result, json!("cached"));
    }
}
