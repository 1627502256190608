//! Event envelope types.
//!
//! An [`ArchflowEvent`] is an envelope (`domain`, `type`, execution id,
//! per-execution sequence, timestamp) around a domain-specific `data` map.
//! Sequences start at zero here; the streaming emitter assigns the real
//! per-execution number at publish time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use archflow_core::ExecutionId;

/// The subsystem an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDomain {
    /// Model-visible conversation output.
    Chat,
    /// Model reasoning traces.
    Thinking,
    /// Tool invocation lifecycle.
    Tool,
    /// Audit traces, spans and metrics.
    Audit,
    /// Human-interaction suspensions and resumes.
    Interaction,
    /// Connection-level bookkeeping.
    System,
}

impl fmt::Display for EventDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Chat => "chat",
            Self::Thinking => "thinking",
            Self::Tool => "tool",
            Self::Audit => "audit",
            Self::Interaction => "interaction",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Domain-specific event type enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Incremental content chunk.
    Delta,
    /// A complete message.
    Message,
    /// Lifecycle start marker.
    Start,
    /// Lifecycle end marker.
    End,
    /// An error surfaced to subscribers.
    Error,
    /// A reasoning step.
    Thinking,
    /// A reflection over prior reasoning.
    Reflection,
    /// A verification pass over reasoning.
    Verification,
    /// A tool invocation has begun.
    ToolStart,
    /// Tool progress report.
    Progress,
    /// Tool result.
    Result,
    /// Audit trace line.
    Trace,
    /// Audit span.
    Span,
    /// Audit metric sample.
    Metric,
    /// Execution suspended awaiting interaction.
    Suspend,
    /// Form requested from a human.
    Form,
    /// Execution resumed with user data.
    Resume,
    /// Subscriber connected.
    Connected,
    /// Keep-alive.
    Heartbeat,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delta => "delta",
            Self::Message => "message",
            Self::Start => "start",
            Self::End => "end",
            Self::Error => "error",
            Self::Thinking => "thinking",
            Self::Reflection => "reflection",
            Self::Verification => "verification",
            Self::ToolStart => "tool_start",
            Self::Progress => "progress",
            Self::Result => "result",
            Self::Trace => "trace",
            Self::Span => "span",
            Self::Metric => "metric",
            Self::Suspend => "suspend",
            Self::Form => "form",
            Self::Resume => "resume",
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(s)
    }
}

/// Envelope + data for one published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchflowEvent {
    /// Which subsystem produced the event.
    pub domain: EventDomain,
    /// Domain-specific type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The execution this event belongs to.
    pub execution_id: String,
    /// Optional cross-execution correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Per-execution sequence, assigned at publish time (strictly monotone).
    pub sequence: u64,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Domain-specific key/value payload.
    pub data: Value,
}

impl ArchflowEvent {
    /// Create a new event with sequence 0 (assigned on publish) and the
    /// current timestamp.
    #[must_use]
    pub fn new(
        domain: EventDomain,
        event_type: EventType,
        execution_id: &ExecutionId,
        data: Value,
    ) -> Self {
        Self {
            domain,
            event_type,
            execution_id: execution_id.to_string(),
            correlation_id: None,
            sequence: 0,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    // -- Chat --

    /// `chat/delta` — incremental content.
    #[must_use]
    pub fn chat_delta(execution_id: &ExecutionId, content: &str, index: Option<u32>) -> Self {
        let mut data = json!({ "content": content });
        if let (Some(i), Some(map)) = (index, data.as_object_mut()) {
            map.insert("index".into(), json!(i));
        }
        Self::new(EventDomain::Chat, EventType::Delta, execution_id, data)
    }

    /// `chat/message` — a complete message.
    #[must_use]
    pub fn chat_message(execution_id: &ExecutionId, content: &str, role: &str, model: &str) -> Self {
        Self::new(
            EventDomain::Chat,
            EventType::Message,
            execution_id,
            json!({ "content": content, "role": role, "model": model }),
        )
    }

    /// `chat/start` — generation began.
    #[must_use]
    pub fn chat_start(execution_id: &ExecutionId) -> Self {
        Self::new(EventDomain::Chat, EventType::Start, execution_id, json!({}))
    }

    /// `chat/end` — generation finished.
    #[must_use]
    pub fn chat_end(execution_id: &ExecutionId, finish_reason: &str, total_tokens: Option<u64>) -> Self {
        let mut data = json!({ "finishReason": finish_reason });
        if let (Some(t), Some(map)) = (total_tokens, data.as_object_mut()) {
            map.insert("totalTokens".into(), json!(t));
        }
        Self::new(EventDomain::Chat, EventType::End, execution_id, data)
    }

    // -- Tool --

    /// `tool/tool_start` — a tool invocation has begun.
    #[must_use]
    pub fn tool_start(execution_id: &ExecutionId, tool_name: &str, tool_call_id: &str, input: Value) -> Self {
        Self::new(
            EventDomain::Tool,
            EventType::ToolStart,
            execution_id,
            json!({ "toolName": tool_name, "toolCallId": tool_call_id, "input": input }),
        )
    }

    /// `tool/progress` — progress report from a running tool.
    #[must_use]
    pub fn tool_progress(
        execution_id: &ExecutionId,
        tool_name: &str,
        message: &str,
        percentage: f64,
        current: u64,
        total: u64,
    ) -> Self {
        Self::new(
            EventDomain::Tool,
            EventType::Progress,
            execution_id,
            json!({
                "toolName": tool_name,
                "message": message,
                "percentage": percentage,
                "current": current,
                "total": total,
            }),
        )
    }

    /// `tool/result` — the tool finished.
    #[must_use]
    pub fn tool_result(
        execution_id: &ExecutionId,
        tool_name: &str,
        tool_call_id: &str,
        result: Value,
        duration_ms: u64,
    ) -> Self {
        Self::new(
            EventDomain::Tool,
            EventType::Result,
            execution_id,
            json!({
                "toolName": tool_name,
                "toolCallId": tool_call_id,
                "result": result,
                "durationMs": duration_ms,
            }),
        )
    }

    // -- Audit --

    /// `audit/trace` — one structured trace line.
    #[must_use]
    pub fn audit_trace(execution_id: &ExecutionId, level: &str, component: &str, message: &str) -> Self {
        Self::new(
            EventDomain::Audit,
            EventType::Trace,
            execution_id,
            json!({ "level": level, "component": component, "message": message }),
        )
    }

    /// `audit/metric` — a metric sample attached to the event stream.
    #[must_use]
    pub fn audit_metric(execution_id: &ExecutionId, name: &str, value: f64, unit: &str) -> Self {
        Self::new(
            EventDomain::Audit,
            EventType::Metric,
            execution_id,
            json!({ "name": name, "value": value, "unit": unit, "tags": [] }),
        )
    }

    // -- Interaction --

    /// `interaction/suspend` — the run is waiting on a human.
    #[must_use]
    pub fn interaction_suspend(
        execution_id: &ExecutionId,
        reason: &str,
        resume_token: &str,
        timeout_ms: u64,
    ) -> Self {
        Self::new(
            EventDomain::Interaction,
            EventType::Suspend,
            execution_id,
            json!({ "reason": reason, "resumeToken": resume_token, "timeoutMs": timeout_ms }),
        )
    }

    /// `interaction/resume` — user data arrived for a suspended run.
    #[must_use]
    pub fn interaction_resume(execution_id: &ExecutionId, resume_token: &str, user_data: Value) -> Self {
        Self::new(
            EventDomain::Interaction,
            EventType::Resume,
            execution_id,
            json!({ "resumeToken": resume_token, "userData": user_data }),
        )
    }

    // -- System --

    /// `system/connected` — a subscriber attached.
    #[must_use]
    pub fn system_connected(execution_id: &ExecutionId, client_id: &str) -> Self {
        Self::new(
            EventDomain::System,
            EventType::Connected,
            execution_id,
            json!({ "clientId": client_id, "timestamp": Utc::now().to_rfc3339() }),
        )
    }

    /// `system/error` — a stream-level error surfaced to one subscriber.
    #[must_use]
    pub fn system_error(execution_id: &ExecutionId, message: &str) -> Self {
        Self::new(
            EventDomain::System,
            EventType::Error,
            execution_id,
            json!({ "message": message }),
        )
    }

    /// `system/end` — terminal marker for a completed emitter.
    #[must_use]
    pub fn system_end(execution_id: &ExecutionId) -> Self {
        Self::new(EventDomain::System, EventType::End, execution_id, json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_core::ExecutionKind;
    use pretty_assertions::assert_eq;

    fn exec_id() -> ExecutionId {
        ExecutionId::new_root(ExecutionKind::Flow).with_sequence(1)
    }

    #[test]
    fn json_uses_wire_field_names() {
        let event = ArchflowEvent::chat_delta(&exec_id(), "hi", Some(0));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["domain"], "chat");
        assert_eq!(value["type"], "delta");
        assert!(value["executionId"].is_string());
        assert!(value.get("correlationId").is_none());
        assert_eq!(value["data"]["content"], "hi");
        assert_eq!(value["data"]["index"], 0);
    }

    #[test]
    fn tool_start_is_snake_cased_on_the_wire() {
        let event = ArchflowEvent::tool_start(&exec_id(), "search", "tc-1", json!({"q": "x"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_start");
        assert_eq!(value["data"]["toolName"], "search");
    }

    #[test]
    fn correlation_id_serialized_when_present() {
        let event = ArchflowEvent::chat_start(&exec_id()).with_correlation("corr-9");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["correlationId"], "corr-9");
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let mut event = ArchflowEvent::interaction_suspend(&exec_id(), "approval", "R", 60_000);
        event.sequence = 17;
        let json = serde_json::to_string(&event).unwrap();
        let back: ArchflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn every_event_type_roundtrips() {
        let types = [
            EventType::Delta,
            EventType::Message,
            EventType::Start,
            EventType::End,
            EventType::Error,
            EventType::Thinking,
            EventType::Reflection,
            EventType::Verification,
            EventType::ToolStart,
            EventType::Progress,
            EventType::Result,
            EventType::Trace,
            EventType::Span,
            EventType::Metric,
            EventType::Suspend,
            EventType::Form,
            EventType::Resume,
            EventType::Connected,
            EventType::Heartbeat,
        ];
        for t in types {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{t}\""));
            let back: EventType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, t);
        }
    }
}
