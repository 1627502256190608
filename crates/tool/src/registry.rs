//! Tool trait and registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use archflow_resilience::{OutputSchema, StrictRetryPolicy};

use crate::ToolError;
use crate::context::ToolContext;

/// A named, side-effectful callable (LLM call, HTTP request, vector search…).
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Human-readable description, surfaced through MCP.
    fn description(&self) -> &str {
        ""
    }

    /// Schema the input must satisfy, when declared.
    fn input_schema(&self) -> Option<&OutputSchema> {
        None
    }

    /// Strict-retry policy applied by the invoker, when declared.
    fn retry_policy(&self) -> Option<&StrictRetryPolicy> {
        None
    }

    /// Execute the tool.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Concurrent name → tool mapping.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name, replacing any previous one.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Look up a tool.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| Arc::clone(&t))
    }

    /// Registered tool names, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(input)
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Echo));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }
}
