//! Workflow definition types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use archflow_resilience::RetryConfig;

/// One node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the workflow.
    pub id: String,
    /// Handler type (`tool`, `transform`, `wait`, `noop`, …).
    #[serde(rename = "type")]
    pub step_type: String,
    /// Handler-specific configuration.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    /// Retry policy applied when the step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Per-step deadline in milliseconds; the engine default applies when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    /// A step with no configuration.
    #[must_use]
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            config: Map::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    /// Set a configuration entry.
    #[must_use]
    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_owned(), value);
        self
    }

    /// Attach a retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Attach a per-step timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A directed edge between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Source step id.
    pub source: String,
    /// Target step id.
    pub target: String,
    /// Optional boolean guard; the edge fires only when it evaluates true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Followed only when the source step failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error_path: bool,
}

impl Connection {
    /// A plain success edge.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            guard: None,
            is_error_path: false,
        }
    }

    /// Attach a guard expression.
    #[must_use]
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    /// Mark this edge as an error path.
    #[must_use]
    pub fn error_path(mut self) -> Self {
        self.is_error_path = true;
        self
    }
}

/// A declared workflow parameter, used to derive external tool schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDecl {
    /// Parameter name.
    pub name: String,
    /// JSON type name (`string`, `number`, `boolean`, `object`, `array`).
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the parameter must be provided.
    #[serde(default)]
    pub required: bool,
    /// Allowed values, when constrained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
}

fn default_param_type() -> String {
    "string".to_owned()
}

/// A declared workflow: steps plus connections, entered at `entry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id (also the default external tool name).
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// What the workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Id of the step execution starts from.
    pub entry: String,
    /// All steps.
    pub steps: Vec<Step>,
    /// All connections.
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Dispatch independent ready steps concurrently.
    #[serde(default)]
    pub parallel_execution: bool,
    /// Declared input parameters (drives MCP tool schemas).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterDecl>,
    /// Whole-run deadline in milliseconds; the engine default applies when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Workflow {
    /// A workflow over the given steps, entered at `entry`.
    #[must_use]
    pub fn new(id: impl Into<String>, entry: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            entry: entry.into(),
            steps,
            connections: Vec::new(),
            parallel_execution: false,
            parameters: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Add connections.
    #[must_use]
    pub fn with_connections(mut self, connections: Vec<Connection>) -> Self {
        self.connections = connections;
        self
    }

    /// Enable parallel dispatch.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.parallel_execution = true;
        self
    }

    /// Look up a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn workflow_json_roundtrip() {
        let workflow = Workflow::new(
            "summarize",
            "A",
            vec![
                Step::new("A", "tool").with_config("tool", json!("search")),
                Step::new("B", "transform").with_timeout_ms(500),
            ],
        )
        .with_connections(vec![
            Connection::new("A", "B").with_guard("step.A.output.ok"),
            Connection::new("A", "B").error_path(),
        ]);

        let json = serde_json::to_string(&workflow).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, workflow);
    }

    #[test]
    fn error_path_flag_is_omitted_when_false() {
        let json = serde_json::to_value(Connection::new("A", "B")).unwrap();
        assert!(json.get("is_error_path").is_none());

        let json = serde_json::to_value(Connection::new("A", "B").error_path()).unwrap();
        assert_eq!(json["is_error_path"], true);
    }

    #[test]
    fn minimal_workflow_deserializes_with_defaults() {
        let workflow: Workflow = serde_json::from_str(
            r#"{
                "id": "wf",
                "entry": "only",
                "steps": [{"id": "only", "type": "noop"}]
            }"#,
        )
        .unwrap();
        assert!(!workflow.parallel_execution);
        assert!(workflow.connections.is_empty());
        assert!(workflow.step("only").unwrap().config.is_empty());
    }

    #[test]
    fn parameter_declarations_deserialize() {
        let decl: ParameterDecl = serde_json::from_str(
            r#"{"name": "text", "description": "input text", "required": true}"#,
        )
        .unwrap();
        assert_eq!(decl.param_type, "string");
        assert!(decl.required);
    }
}
