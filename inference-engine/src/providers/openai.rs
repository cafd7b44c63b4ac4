//! OpenAI-compatible remote HTTP provider. Also the default backend
//! for any endpoint that speaks the OpenAI chat-completions wire
//! format (many self-hosted and third-party gateways do).

use crate::error::ProviderError;
use crate::models::{FinishReason, InferenceRequest, InferenceResponse, Role, StreamChunk, ToolCall, Usage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{HealthStatus, Provider, ProviderCapabilities, ProviderConfig, ProviderHealth};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    id: String,
    http: HttpProviderClient,
    capabilities: ProviderCapabilities,
    metadata: std::collections::HashMap<String, String>,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        validate_config(&config)?;
        let api_key = config.api_key().expect("validated above");
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            DEFAULT_BASE_URL,
            &config.properties,
            AuthStrategy::Bearer { token: api_key.to_string() },
        )?;
        Ok(Self {
            id: config.id,
            http,
            capabilities: ProviderCapabilities {
                streaming: true,
                function_calling: true,
                tool_calling: true,
                max_context_tokens: 128_000,
                max_output_tokens: 16_384,
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
struct ChatCompletionRequest<'a> {
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
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
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

fn finish_reason_from(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some("stop") | None => FinishReason::Stop,
        Some(_) => FinishReason::Stop,
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "openai"
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
        let wire_request = ChatCompletionRequest {
            model: &request.model,
            messages: to_wire_messages(request),
            temperature: request.parameters.temperature,
            max_tokens: request.parameters.max_tokens,
            stream: false,
        };

        let resp: ChatCompletionResponse =
            self.http.post_json("/chat/completions", &wire_request).await?;

        let choice = resp.choices.into_iter().next().ok_or(ProviderError::InvalidResponse)?;
        let usage = resp.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }).unwrap_or_default();

        Ok(InferenceResponse {
            request_id: request.id,
            content: choice.message.content,
            model: resp.model,
            usage,
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
            finish_reason: finish_reason_from(choice.finish_reason.as_deref()),
            tool_calls: Vec::<ToolCall>::new(),
            metadata: Default::default(),
        })
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk, ProviderError>>, ProviderError> {
        let wire_request = json!({
            "model": request.model,
            "messages": to_wire_messages(request),
            "temperature": request.parameters.temperature,
            "max_tokens": request.parameters.max_tokens,
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
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Ok(StreamChunk {
                            request_id,
                            seq,
                            delta: String::new(),
                            tool_call_delta: None,
                            done: true,
                            usage: None,
                            error: Some(crate::models::StreamError {
                                code: "PROVIDER_UNAVAILABLE".into(),
                                message: e.to_string(),
                                retryable: true,
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
                    if json_str == "[DONE]" {
                        yield Ok(StreamChunk {
                            request_id,
                            seq,
                            delta: String::new(),
                            tool_call_delta: None,
                            done: true,
                            usage: None,
                            error: None,
                        });
                        return;
                    }
                    let parsed: serde_json::Value = match serde_json::from_str(json_str) {
                        Ok(v) => v,
                        Err(e) => {
                            yield Err(ProviderError::Serialization(e));
                            continue;
                        }
                    };
                    let delta = parsed["choices"][0]["delta"]["content"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    yield Ok(StreamChunk {
                        request_id,
                        seq,
                        delta,
                        tool_call_delta: None,
                        done: false,
                        usage: None,
                        error: None,
                    });
                    seq += 1;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn health(&self) -> ProviderHealth {
        let start = Instant::now();
        match self.http.get_json::<serde_json::Value>("/models").await {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fails_without_api_key_secret() {
        let config = ProviderConfig { secrets: Default::default(), ..ProviderConfig::new("openai", "sk-test") };
        let err = OpenAiProvider::new(config).unwrap_err();
        assert!(matches!(err, ProviderError::InitializationFailed { .. }));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let config = ProviderConfig::new("openai", "sk-test");
        let provider = OpenAiProvider::new(config.clone()).unwrap();
        provider.initialize(&config).await.unwrap();
        provider.initialize(&config).await.unwrap();
    }
}
