//! A configurable HTTP provider for self-hosted or third-party
//! endpoints that speak an OpenAI-compatible chat-completions wire
//! format but live at an arbitrary base URL (e.g. a local
//! llama.cpp server's OpenAI-compatible shim, or an internal gateway).
//!
//! Native model kernels themselves (llama.cpp, ONNX, PyTorch) are out
//! of scope for this crate; this provider only talks to an HTTP
//! front-end for one.

use crate::error::ProviderError;
use crate::models::{FinishReason, InferenceRequest, InferenceResponse, Role, StreamChunk, ToolCall, Usage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{HealthStatus, Provider, ProviderCapabilities, ProviderConfig, ProviderHealth};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub struct CustomProvider {
    id: String,
    http: HttpProviderClient,
    capabilities: ProviderCapabilities,
    metadata: std::collections::HashMap<String, String>,
}

impl CustomProvider {
    pub fn new(config: ProviderConfig, mut capabilities: ProviderCapabilities) -> Result<Self, ProviderError> {
        validate_config(&config)?;
        let auth = match config.api_key() {
            Some(key) => AuthStrategy::Bearer { token: key.to_string() },
            None => AuthStrategy::None,
        };
        let base_url = config.base_url.clone().expect("validated above");
        let http = HttpProviderClient::new(config.timeout, Some(base_url.clone()), &base_url, &config.properties, auth)?;
        capabilities.priority = config.priority;
        capabilities.cost_per_1k_tokens = config.cost_per_1k_tokens;
        Ok(Self { id: config.id, http, capabilities, metadata: config.metadata })
    }
}

fn validate_config(config: &ProviderConfig) -> Result<(), ProviderError> {
    if config.base_url.is_none() {
        return Err(ProviderError::InitializationFailed { message: "custom provider requires base_url".into() });
    }
    Ok(())
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    model: String,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn to_wire_messages(request: &InferenceRequest) -> Vec<WireMessage> {
    request
        .messages
        .iter()
        .map(|m| WireMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool | Role::Function => "tool",
            }
            .to_string(),
            content: m.content.clone(),
        })
        .collect()
}

#[async_trait]
impl Provider for CustomProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "custom"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn metadata(&self) -> &std::collections::HashMap<String, String> {
        &self.metadata
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn initialize(&self, config: &ProviderConfig) -> Result<(), ProviderError> {
        validate_config(config)
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, ProviderError> {
        let start = Instant::now();
        let wire_request = WireRequest {
            model: &request.model,
            messages: to_wire_messages(request),
            temperature: request.parameters.temperature,
            max_tokens: request.parameters.max_tokens,
            stream: false,
        };

        let resp: WireResponse = self.http.post_json("/chat/completions", &wire_request).await?;
        let choice = resp.choices.into_iter().next().ok_or(ProviderError::InvalidResponse)?;
        let usage = resp
            .usage
            .map(|u| Usage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens })
            .unwrap_or_default();

        Ok(InferenceResponse {
            request_id: request.id,
            content: choice.message.content,
            model: resp.model,
            usage,
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
            finish_reason: match choice.finish_reason.as_deref() {
                Some("length") => FinishReason::Length,
                Some("tool_calls") => FinishReason::ToolCalls,
                _ => FinishReason::Stop,
            },
            tool_calls: Vec::<ToolCall>::new(),
            metadata: Default::default(),
        })
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk, ProviderError>>, ProviderError> {
        if !self.capabilities.streaming {
            return Err(ProviderError::Configuration { message: "streaming not enabled for this custom provider".into() });
        }
        let wire_request = serde_json::json!({
            "model": request.model,
            "messages": to_wire_messages(request),
            "stream": true,
        });
        let response = self.http.post_json_raw("/chat/completions", &wire_request).await?;
        if !response.status().is_success() {
            return Err(crate::providers::http_client::map_error_response(response).await);
        }
        let request_id = request.id;
        let stream = async_stream::stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut seq = 0u64;
            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                let Ok(chunk) = chunk_result else { return };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);
                    let Some(json_str) = line.strip_prefix("data: ") else { continue };
                    if json_str == "[DONE]" {
                        yield Ok(StreamChunk { request_id, seq, delta: String::new(), tool_call_delta: None, done: true, usage: None, error: None });
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(json_str) {
                        let delta = parsed["choices"][0]["delta"]["content"].as_str().unwrap_or_default().to_string();
                        yield Ok(StreamChunk { request_id, seq, delta, tool_call_delta: None, done: false, usage: None, error: None });
                        seq += 1;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn health(&self) -> ProviderHealth {
        let start = Instant::now();
        match self.http.get_json::<serde_json::Value>("/health").await {
            Ok(_) => ProviderHealth {
                status: HealthStatus::Up,
                message: format!("{}ms", start.elapsed().as_millis()),
                timestamp: chrono::Utc::now(),
                details: Default::default(),
            },
            Err(e) => ProviderHealth {
                status: HealthStatus::Degraded,
                message: e.to_string(),
                timestamp: chrono::Utc::now(),
                details: Default::default(),
            },
        }
    }
}
