//! Anthropic Messages API provider.

use crate::error::ProviderError;
use crate::models::{FinishReason, InferenceRequest, InferenceResponse, Role, StreamChunk, ToolCall, Usage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{HealthStatus, Provider, ProviderCapabilities, ProviderConfig, ProviderHealth};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Instant;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub struct AnthropicProvider {
    id: String,
    http: HttpProviderClient,
    capabilities: ProviderCapabilities,
    metadata: std::collections::HashMap<String, String>,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        validate_config(&config)?;
        let api_key = config.api_key().expect("validated above");
        let mut headers = config.properties.clone();
        headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE_URL,
            &headers,
            AuthStrategy::Header { name: "x-api-key".to_string(), value: api_key.to_string() },
        )?;
        Ok(Self {
            id: config.id,
            http,
            capabilities: ProviderCapabilities {
                streaming: true,
                function_calling: true,
                tool_calling: true,
                max_context_tokens: 200_000,
                max_output_tokens: 8_192,
                priority: config.priority,
                cost_per_1k_tokens: config.cost_per_1k_tokens,
                ..Default::default()
            },
            metadata: config.metadata,
        })
    }
}

fn validate_config(config: &ProviderConfig) -> Result<(), ProviderError> {
    if config.api_key().is_none() {
        return Err(ProviderError::InitializationFailed { message: "missing api_key secret".into() });
    }
    Ok(())
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize, Clone)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn split_system(request: &InferenceRequest) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system = None;
    let mut messages = Vec::with_capacity(request.messages.len());
    for m in &request.messages {
        match m.role {
            Role::System => system = Some(m.content.clone()),
            Role::User => messages.push(AnthropicMessage { role: "user".into(), content: m.content.clone() }),
            Role::Assistant => {
                messages.push(AnthropicMessage { role: "assistant".into(), content: m.content.clone() })
            }
            Role::Tool | Role::Function => {
                messages.push(AnthropicMessage { role: "user".into(), content: m.content.clone() })
            }
        }
    }
    (system, messages)
}

fn finish_reason_from(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "anthropic"
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
        let (system, messages) = split_system(request);
        let wire_request = AnthropicRequest {
            model: &request.model,
            max_tokens: request.parameters.max_tokens.unwrap_or(1024),
            messages,
            system,
            temperature: request.parameters.temperature,
            stream: false,
        };

        let resp: AnthropicResponse = self.http.post_json("/v1/messages", &wire_request).await?;
        let content = resp.content.into_iter().next().map(|c| c.text).unwrap_or_default();

        Ok(InferenceResponse {
            request_id: request.id,
            content,
            model: resp.model,
            usage: Usage { input_tokens: resp.usage.input_tokens, output_tokens: resp.usage.output_tokens },
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
            finish_reason: finish_reason_from(resp.stop_reason.as_deref()),
            tool_calls: Vec::<ToolCall>::new(),
            metadata: Default::default(),
        })
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk, ProviderError>>, ProviderError> {
        let (system, messages) = split_system(request);
        let wire_request = AnthropicRequest {
            model: &request.model,
            max_tokens: request.parameters.max_tokens.unwrap_or(1024),
            messages,
            system,
            temperature: request.parameters.temperature,
            stream: true,
        };

        let response = self.http.post_json_raw("/v1/messages", &wire_request).await?;
        if !response.status().is_success() {
            return Err(crate::providers::http_client::map_error_response(response).await);
        }

        let request_id = request.id;
        let stream = async_stream::stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut seq = 0u64;

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Ok(StreamChunk {
                            request_id, seq, delta: String::new(), tool_call_delta: None,
                            done: true, usage: None,
                            error: Some(crate::models::StreamError {
                                code: "PROVIDER_UNAVAILABLE".into(), message: e.to_string(), retryable: true,
                            }),
                        });
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);
                    let Some(json_str) = line.strip_prefix("data: ") else { continue };
                    let parsed: serde_json::Value = match serde_json::from_str(json_str) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    match parsed["type"].as_str() {
                        Some("content_block_delta") => {
                            let delta = parsed["delta"]["text"].as_str().unwrap_or_default().to_string();
                            yield Ok(StreamChunk {
                                request_id, seq, delta, tool_call_delta: None,
                                done: false, usage: None, error: None,
                            });
                            seq += 1;
                        }
                        Some("message_stop") => {
                            yield Ok(StreamChunk {
                                request_id, seq, delta: String::new(), tool_call_delta: None,
                                done: true, usage: None, error: None,
                            });
                            return;
                        }
                        _ => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn health(&self) -> ProviderHealth {
        let start = Instant::now();
        match self.http.get_json::<serde_json::Value>("/v1/models").await {
            Ok(_) => ProviderHealth {
                status: HealthStatus::Up,
                message: format!("{}ms", start.elapsed().as_millis()),
                timestamp: chrono::Utc::now(),
                details: Default::default(),
            },
            Err(e) => ProviderHealth {
                status: HealthStatus::Down,
                message: e.to_string(),
                timestamp: chrono::Utc::now(),
                details: Default::default(),
            },
        }
    }
}
