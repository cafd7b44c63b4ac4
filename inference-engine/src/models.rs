//! # Core Data Model
//!
//! Wire-independent request/response/streaming types shared by every
//! component in the control plane: the routing engine, the execution
//! dispatcher, the plugin pipeline, and the provider SPI all exchange
//! values defined here.
//!
//! These types are intentionally decode-target shaped: an edge handler
//! (out of scope for this crate) decodes wire JSON into an
//! [`InferenceRequest`] and the core never touches raw bytes again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Function,
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), name: None, tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), name: None, tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), name: None, tool_call_id: None }
    }
}

/// A tool the model may call, described as a JSON-schema function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A partial tool-call delta, as seen in a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_fragment: Option<String>,
}

/// Per-request inference parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// Routing hints carried alongside a request, consumed by the routing
/// engine (C7) rather than by the provider itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default)]
    pub cost_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "crate::common::duration_serde::option")]
    pub timeout: Option<std::time::Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<crate::routing::RoutingStrategy>,
}

/// An inference request. Immutable after construction; `id` is unique
/// process-wide (generated at construction time if not supplied by the
/// edge handler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: Uuid,
    pub tenant_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub routing: RoutingHints,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InferenceRequest {
    pub fn new(tenant_id: impl Into<String>, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            model: model.into(),
            messages,
            parameters: Parameters::default(),
            tools: None,
            session_id: None,
            stream: false,
            routing: RoutingHints::default(),
            metadata: HashMap::new(),
        }
    }
}

/// Why a response terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

/// Token accounting for a completed request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A complete (non-streaming) inference response. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: Uuid,
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A fragment of a streaming response. `seq` is strictly increasing per
/// stream, starting at 0; `done` appears exactly once, on the final
/// chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: Uuid,
    pub seq: u64,
    #[serde(default)]
    pub delta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_delta: Option<ToolCallDelta>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
}

/// A terminal error event carried on a stream. Mid-stream failures
/// surface this way; they are never rolled back and never trigger
/// automatic failover (already-emitted tokens cannot be retracted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_role() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::system("x").role, Role::System);
        assert_eq!(Message::assistant("y").role, Role::Assistant);
    }

    #[test]
    fn inference_request_round_trips_through_json() {
        let req = InferenceRequest::new("t1", "m1", vec![Message::user("hi")]);
        let json = serde_json::to_string(&req).unwrap();
        let back: InferenceRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.id, back.id);
        assert_eq!(req.tenant_id, back.tenant_id);
        assert_eq!(req.messages.len(), back.messages.len());
    }

    #[test]
    fn inference_response_round_trips_through_json() {
        let resp = InferenceResponse {
            request_id: Uuid::new_v4(),
            content: "hello".into(),
            model: "m1".into(),
            usage: Usage { input_tokens: 3, output_tokens: 5 },
            duration_ms: 12,
            timestamp: Utc::now(),
            finish_reason: FinishReason::Stop,
            tool_calls: vec![],
            metadata: HashMap::new(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: InferenceResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(resp.request_id, back.request_id);
        assert_eq!(resp.content, back.content);
        assert_eq!(resp.usage.total(), back.usage.total());
    }

    #[test]
    fn stream_chunk_round_trips_through_json() {
        let chunk = StreamChunk {
            request_id: Uuid::new_v4(),
            seq: 4,
            delta: "tok".into(),
            tool_call_delta: None,
            done: false,
            usage: None,
            error: None,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        let back: StreamChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(chunk.seq, back.seq);
        assert_eq!(chunk.done, back.done);
    }
}
