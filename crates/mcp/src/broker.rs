//! MCP method dispatch and workflow bridging.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use archflow_engine::FlowEngine;
use archflow_execution::{ExecutionContext, FlowStatus};
use archflow_tool::Tool as _;
use archflow_workflow::Workflow;

use crate::McpError;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, error_codes};
use crate::types::{
    InitializeResult, McpPrompt, McpResource, McpTool, McpToolResult, PROTOCOL_VERSION,
    PromptsCapability, ResourceContents, ResourcesCapability, ServerCapabilities, ServerInfo,
    ToolsCapability,
};

/// Produces a resource's current content.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Read the content as text.
    async fn read(&self) -> Result<String, McpError>;
}

/// A resource backed by an in-memory string, updatable at runtime.
#[derive(Default)]
pub struct StaticResource {
    content: parking_lot::RwLock<String>,
}

impl StaticResource {
    /// Create with initial content.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: parking_lot::RwLock::new(content.into()),
        }
    }

    /// Replace the content; subscribers see an update on the next check.
    pub fn set(&self, content: impl Into<String>) {
        *self.content.write() = content.into();
    }
}

#[async_trait]
impl ResourceProvider for StaticResource {
    async fn read(&self) -> Result<String, McpError> {
        Ok(self.content.read().clone())
    }
}

struct ResourceEntry {
    resource: McpResource,
    provider: Arc<dyn ResourceProvider>,
}

struct PromptEntry {
    prompt: McpPrompt,
    template: String,
}

/// The broker: exposes registered workflows (and tools, resources, prompts)
/// over MCP, re-entering the flow engine for `tools/call`.
pub struct McpBroker {
    engine: Arc<FlowEngine>,
    info: ServerInfo,
    resources: DashMap<String, ResourceEntry>,
    prompts: DashMap<String, PromptEntry>,
    // uri -> sha256 of the content as of subscription / last update event
    subscriptions: DashMap<String, String>,
}

impl McpBroker {
    /// Create a broker over an engine.
    #[must_use]
    pub fn new(engine: Arc<FlowEngine>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            engine,
            info: ServerInfo {
                name: name.into(),
                version: version.into(),
            },
            resources: DashMap::new(),
            prompts: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Register a resource.
    pub fn register_resource(&self, resource: McpResource, provider: Arc<dyn ResourceProvider>) {
        self.resources
            .insert(resource.uri.clone(), ResourceEntry { resource, provider });
    }

    /// Register a prompt with a `{placeholder}` template.
    pub fn register_prompt(&self, prompt: McpPrompt, template: impl Into<String>) {
        self.prompts.insert(
            prompt.name.clone(),
            PromptEntry {
                prompt,
                template: template.into(),
            },
        );
    }

    /// Serve a transport until it closes.
    ///
    /// Each request is dispatched on its own task, so a long-running
    /// `tools/call` never blocks the read loop; responses go out as they
    /// complete (JSON-RPC correlates by id).
    ///
    /// # Errors
    ///
    /// [`McpError::Transport`] when the transport fails; an orderly close
    /// returns `Ok`.
    pub async fn serve<T: crate::McpTransport>(
        self: &Arc<Self>,
        mut transport: T,
    ) -> Result<(), McpError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        loop {
            tokio::select! {
                received = transport.recv() => {
                    let Some(frame) = received? else {
                        break;
                    };
                    let broker = Arc::clone(self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(response) = broker.handle(&frame).await {
                            let _ = tx.send(response);
                        }
                        for notification in broker.check_subscriptions().await {
                            let _ = tx.send(notification);
                        }
                    });
                }
                Some(outgoing) = rx.recv() => {
                    transport.send(&outgoing).await?;
                }
            }
        }
        // Flush responses of requests still in flight at end-of-stream.
        drop(tx);
        while let Some(outgoing) = rx.recv().await {
            transport.send(&outgoing).await?;
        }
        Ok(())
    }

    /// Handle one raw frame. `None` means nothing is sent back
    /// (notifications are not answered).
    pub async fn handle(&self, frame: &str) -> Option<String> {
        let request: JsonRpcRequest = match serde_json::from_str(frame) {
            Ok(request) => request,
            Err(error) => {
                let response = JsonRpcResponse::error(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {error}"),
                );
                return serde_json::to_string(&response).ok();
            }
        };
        let response = self.dispatch(request).await?;
        serde_json::to_string(&response).ok()
    }

    /// Dispatch one request. Notifications return `None`.
    pub async fn dispatch(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.method.starts_with("notifications/") {
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                id,
                error_codes::INVALID_REQUEST,
                "Invalid request: jsonrpc must be \"2.0\"",
            ));
        }

        let params = request.params.unwrap_or(Value::Null);
        let outcome = match request.method.as_str() {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(&params).await,
            "resources/list" => Ok(self.list_resources()),
            "resources/read" => self.read_resource(&params).await,
            "resources/subscribe" => self.subscribe_resource(&params).await,
            "prompts/list" => Ok(self.list_prompts()),
            "prompts/get" => self.get_prompt(&params),
            _ => {
                return Some(JsonRpcResponse::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    "Method not found",
                ));
            }
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(McpError::InvalidParams(message)) => {
                JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, message)
            }
            Err(McpError::Unknown { kind, name }) => JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("unknown {kind}: {name}"),
            ),
            Err(error) => {
                JsonRpcResponse::error(id, error_codes::INTERNAL_ERROR, error.to_string())
            }
        })
    }

    fn initialize(&self) -> Value {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            server_info: self.info.clone(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {}),
                resources: Some(ResourcesCapability { subscribe: true }),
                prompts: Some(PromptsCapability {}),
            },
        };
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    fn list_tools(&self) -> Value {
        let mut tools: Vec<McpTool> = self
            .engine
            .workflows()
            .iter()
            .map(|workflow| workflow_tool(workflow))
            .collect();

        // Registered plain tools, where no workflow claims the name.
        for name in self.engine.invoker().registry().names() {
            if tools.iter().any(|t| t.name == name) {
                continue;
            }
            if let Some(tool) = self.engine.invoker().registry().get(&name) {
                let schema = tool
                    .input_schema()
                    .and_then(|s| serde_json::to_value(s).ok())
                    .unwrap_or_else(|| json!({"type": "object"}));
                tools.push(McpTool {
                    name,
                    description: Some(tool.description().to_owned()),
                    input_schema: schema,
                });
            }
        }

        tools.sort_by(|a, b| a.name.cmp(&b.name));
        json!({ "tools": tools })
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, McpError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::InvalidParams("tools/call requires 'name'".into()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let result = if let Some(workflow) = self.engine.workflow(name) {
            self.call_workflow(&workflow, arguments).await
        } else if self.engine.invoker().registry().get(name).is_some() {
            self.call_plain_tool(name, arguments).await
        } else {
            return Err(McpError::Unknown {
                kind: "tool",
                name: name.to_owned(),
            });
        };

        serde_json::to_value(result)
            .map_err(|e| McpError::InvalidParams(format!("unencodable result: {e}")))
    }

    async fn call_workflow(&self, workflow: &Workflow, arguments: Value) -> McpToolResult {
        match self.engine.run(workflow, arguments).await {
            Ok(result) => match result.status {
                FlowStatus::Completed => {
                    let text = match result.output {
                        Some(Value::String(s)) => s,
                        Some(other) => other.to_string(),
                        None => "completed".to_owned(),
                    };
                    McpToolResult::text(text)
                }
                FlowStatus::Suspended => McpToolResult::text(
                    json!({
                        "status": "suspended",
                        "runId": result.run_id,
                        "resumeToken": result.resume_token,
                    })
                    .to_string(),
                ),
                status => {
                    let message = result
                        .errors
                        .first()
                        .map_or_else(|| status.to_string(), |e| e.message.clone());
                    McpToolResult::error(message)
                }
            },
            Err(error) => McpToolResult::error(error.to_string()),
        }
    }

    async fn call_plain_tool(&self, name: &str, arguments: Value) -> McpToolResult {
        let root = archflow_core::ExecutionId::new_root(archflow_core::ExecutionKind::Flow);
        let ctx = ExecutionContext::new(root, format!("mcp:{}", self.info.name));
        match self.engine.invoker().execute(name, arguments, &ctx).await {
            Ok(value) => McpToolResult::text(match value {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            Err(error) => McpToolResult::error(error.to_string()),
        }
    }

    fn list_resources(&self) -> Value {
        let mut resources: Vec<McpResource> = self
            .resources
            .iter()
            .map(|e| e.value().resource.clone())
            .collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        json!({ "resources": resources })
    }

    async fn read_resource(&self, params: &Value) -> Result<Value, McpError> {
        let uri = required_str(params, "uri", "resources/read")?;
        let entry = self.resources.get(uri).ok_or_else(|| McpError::Unknown {
            kind: "resource",
            name: uri.to_owned(),
        })?;
        let (provider, resource) = (Arc::clone(&entry.provider), entry.resource.clone());
        drop(entry);

        let text = provider.read().await?;
        let contents = ResourceContents {
            uri: resource.uri,
            mime_type: resource.mime_type,
            text,
        };
        Ok(json!({ "contents": [contents] }))
    }

    /// Mark a URI subscribed, remembering its current content hash.
    async fn subscribe_resource(&self, params: &Value) -> Result<Value, McpError> {
        let uri = required_str(params, "uri", "resources/subscribe")?;
        let entry = self.resources.get(uri).ok_or_else(|| McpError::Unknown {
            kind: "resource",
            name: uri.to_owned(),
        })?;
        let provider = Arc::clone(&entry.provider);
        drop(entry);

        let hash = content_hash(&provider.read().await?);
        self.subscriptions.insert(uri.to_owned(), hash);
        Ok(json!({}))
    }

    /// Re-read every subscribed resource; emit a
    /// `notifications/resources/updated` frame for each whose content hash
    /// changed since last seen.
    pub async fn check_subscriptions(&self) -> Vec<String> {
        let mut notifications = Vec::new();
        let subscribed: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for uri in subscribed {
            let Some(provider) = self.resources.get(&uri).map(|e| Arc::clone(&e.provider)) else {
                continue;
            };
            let Ok(content) = provider.read().await else {
                tracing::warn!(uri, "subscribed resource failed to read");
                continue;
            };
            let hash = content_hash(&content);
            let changed = self
                .subscriptions
                .get(&uri)
                .is_some_and(|known| *known != hash);
            if changed {
                self.subscriptions.insert(uri.clone(), hash);
                let notification = JsonRpcNotification::new(
                    "notifications/resources/updated",
                    json!({ "uri": uri }),
                );
                if let Ok(frame) = serde_json::to_string(&notification) {
                    notifications.push(frame);
                }
            }
        }
        notifications
    }

    fn list_prompts(&self) -> Value {
        let mut prompts: Vec<McpPrompt> =
            self.prompts.iter().map(|e| e.value().prompt.clone()).collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        json!({ "prompts": prompts })
    }

    fn get_prompt(&self, params: &Value) -> Result<Value, McpError> {
        let name = required_str(params, "name", "prompts/get")?;
        let entry = self.prompts.get(name).ok_or_else(|| McpError::Unknown {
            kind: "prompt",
            name: name.to_owned(),
        })?;

        let arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new);
        let mut text = entry.template.clone();
        for (key, value) in &arguments {
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&format!("{{{key}}}"), &replacement);
        }

        Ok(json!({
            "description": entry.prompt.description,
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": text },
            }],
        }))
    }
}

fn workflow_tool(workflow: &Workflow) -> McpTool {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for parameter in &workflow.parameters {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(parameter.param_type));
        if let Some(description) = &parameter.description {
            schema.insert("description".into(), json!(description));
        }
        if !parameter.enum_values.is_empty() {
            schema.insert("enum".into(), json!(parameter.enum_values));
        }
        properties.insert(parameter.name.clone(), Value::Object(schema));
        if parameter.required {
            required.push(parameter.name.clone());
        }
    }

    McpTool {
        name: workflow.id.clone(),
        description: workflow.description.clone(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

fn required_str<'a>(params: &'a Value, key: &str, method: &str) -> Result<&'a str, McpError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| McpError::InvalidParams(format!("{method} requires '{key}'")))
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
