//! Broker end-to-end tests over an in-process transport.

use std::sync::Arc;

use serde_json::{Value, json};

use archflow_engine::{EngineConfig, FlowEngine, InMemoryStateStore};
use archflow_execution::ExecutionTracker;
use archflow_mcp::{
    ChannelTransport, McpBroker, McpPrompt, McpResource, PromptArgument, StaticResource,
};
use archflow_metrics::{FlowMetricsCollector, MetricsConfig};
use archflow_streaming::{StreamingConfig, StreamingRegistry};
use archflow_tool::{InterceptorChain, ToolInvoker, ToolRegistry};
use archflow_workflow::{Connection, ParameterDecl, Step, Workflow};

fn make_engine() -> Arc<FlowEngine> {
    let tracker = Arc::new(ExecutionTracker::new());
    let invoker = Arc::new(ToolInvoker::new(
        Arc::clone(&tracker),
        ToolRegistry::new(),
        InterceptorChain::new(),
    ));
    Arc::new(FlowEngine::new(
        EngineConfig::default(),
        tracker,
        invoker,
        Arc::new(StreamingRegistry::new(StreamingConfig::default())),
        Arc::new(FlowMetricsCollector::new(MetricsConfig::default())),
        Arc::new(InMemoryStateStore::new()),
    ))
}

fn summarize_workflow() -> Workflow {
    let mut workflow = Workflow::new(
        "summarize",
        "summarize",
        vec![Step::new("summarize", "transform").with_config("expression", json!("flow.input.text"))],
    );
    workflow.description = Some("Summarize the given text".into());
    workflow.parameters = vec![ParameterDecl {
        name: "text".into(),
        param_type: "string".into(),
        description: Some("Text to summarize".into()),
        required: true,
        enum_values: vec![],
    }];
    workflow
}

fn broker() -> McpBroker {
    let engine = make_engine();
    engine.register_workflow(summarize_workflow());
    McpBroker::new(engine, "archflow", "0.1.0")
}

async fn call(broker: &McpBroker, frame: Value) -> Value {
    let response = broker
        .handle(&frame.to_string())
        .await
        .expect("request should be answered");
    serde_json::from_str(&response).unwrap()
}

#[tokio::test]
async fn initialize_advertises_capabilities() {
    let broker = broker();
    let response = call(
        &broker,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;

    assert_eq!(response["id"], 1);
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "archflow");
    assert!(result["capabilities"]["tools"].is_object());
    assert_eq!(result["capabilities"]["resources"]["subscribe"], true);
    assert!(result["capabilities"]["prompts"].is_object());
}

#[tokio::test]
async fn tools_list_derives_workflow_schema() {
    let broker = broker();
    let response = call(
        &broker,
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;

    let tools = response["result"]["tools"].as_array().unwrap();
    let summarize = tools.iter().find(|t| t["name"] == "summarize").unwrap();
    assert_eq!(summarize["description"], "Summarize the given text");
    let schema = &summarize["inputSchema"];
    assert_eq!(schema["type"], "object");
    assert_eq!(schema["properties"]["text"]["type"], "string");
    assert_eq!(schema["required"][0], "text");
}

// S6 — an MCP client calls the summarize workflow as a tool.
#[tokio::test]
async fn call_tool_runs_the_workflow() {
    let broker = broker();
    let response = call(
        &broker,
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "summarize", "arguments": {"text": "hello"}},
        }),
    )
    .await;

    let result = &response["result"];
    assert_eq!(result["isError"], false);
    assert_eq!(result["content"][0]["type"], "text");
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(!text.is_empty());
    assert_eq!(text, "hello");
}

#[tokio::test]
async fn call_tool_failure_sets_is_error() {
    let engine = make_engine();
    // A workflow whose only step's expression references a missing path.
    engine.register_workflow(Workflow::new(
        "failing",
        "boom",
        vec![Step::new("boom", "transform").with_config("expression", json!("step.missing.output"))],
    ));
    let broker = McpBroker::new(engine, "archflow", "0.1.0");

    let response = call(
        &broker,
        json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {"name": "failing", "arguments": {}},
        }),
    )
    .await;

    let result = &response["result"];
    assert_eq!(result["isError"], true);
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(!text.is_empty());
}

#[tokio::test]
async fn unknown_method_returns_32601() {
    let broker = broker();
    let response = call(
        &broker,
        json!({"jsonrpc": "2.0", "id": 5, "method": "workflows/teleport"}),
    )
    .await;

    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["error"]["message"], "Method not found");
}

#[tokio::test]
async fn notifications_are_not_answered() {
    let broker = broker();
    let frame = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    assert!(broker.handle(&frame.to_string()).await.is_none());
}

#[tokio::test]
async fn malformed_json_yields_parse_error() {
    let broker = broker();
    let response = broker.handle("{not json").await.unwrap();
    let response: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["id"], Value::Null);
}

#[tokio::test]
async fn resources_read_and_subscribe_fire_updates_on_change() {
    let broker = broker();
    let provider = Arc::new(StaticResource::new("v1"));
    broker.register_resource(
        McpResource {
            uri: "archflow://status".into(),
            name: "status".into(),
            description: None,
            mime_type: Some("text/plain".into()),
        },
        provider.clone(),
    );

    let read = call(
        &broker,
        json!({
            "jsonrpc": "2.0", "id": 6, "method": "resources/read",
            "params": {"uri": "archflow://status"},
        }),
    )
    .await;
    assert_eq!(read["result"]["contents"][0]["text"], "v1");
    assert_eq!(read["result"]["contents"][0]["mimeType"], "text/plain");

    let subscribed = call(
        &broker,
        json!({
            "jsonrpc": "2.0", "id": 7, "method": "resources/subscribe",
            "params": {"uri": "archflow://status"},
        }),
    )
    .await;
    assert!(subscribed["result"].is_object());

    // Unchanged content: no notification.
    assert!(broker.check_subscriptions().await.is_empty());

    // Changed content: exactly one update, then quiet again.
    provider.set("v2");
    let notifications = broker.check_subscriptions().await;
    assert_eq!(notifications.len(), 1);
    let notification: Value = serde_json::from_str(&notifications[0]).unwrap();
    assert_eq!(notification["method"], "notifications/resources/updated");
    assert_eq!(notification["params"]["uri"], "archflow://status");
    assert!(broker.check_subscriptions().await.is_empty());
}

#[tokio::test]
async fn prompts_interpolate_arguments() {
    let broker = broker();
    broker.register_prompt(
        McpPrompt {
            name: "review".into(),
            description: Some("Review a document".into()),
            arguments: vec![PromptArgument {
                name: "title".into(),
                description: None,
                required: true,
            }],
        },
        "Please review {title} carefully.",
    );

    let listed = call(&broker, json!({"jsonrpc": "2.0", "id": 8, "method": "prompts/list"})).await;
    assert_eq!(listed["result"]["prompts"][0]["name"], "review");

    let got = call(
        &broker,
        json!({
            "jsonrpc": "2.0", "id": 9, "method": "prompts/get",
            "params": {"name": "review", "arguments": {"title": "RFC-7"}},
        }),
    )
    .await;
    assert_eq!(
        got["result"]["messages"][0]["content"]["text"],
        "Please review RFC-7 carefully."
    );
}

#[tokio::test]
async fn serve_loop_answers_over_a_transport() {
    let broker = Arc::new(broker());
    let (transport, to_broker, mut from_broker) = ChannelTransport::pair();

    let server = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.serve(transport).await })
    };

    to_broker
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}).to_string())
        .unwrap();
    to_broker
        .send(
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "summarize", "arguments": {"text": "hi"}},
            })
            .to_string(),
        )
        .unwrap();
    drop(to_broker);

    // Requests are dispatched concurrently; correlate responses by id.
    let mut by_id = std::collections::HashMap::new();
    for _ in 0..2 {
        let response: Value = serde_json::from_str(&from_broker.recv().await.unwrap()).unwrap();
        by_id.insert(response["id"].as_i64().unwrap(), response);
    }
    assert_eq!(by_id[&1]["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(by_id[&2]["result"]["content"][0]["text"], "hi");

    server.await.unwrap().unwrap();
}
