//! # Provider SPI (C1)
//!
//! The uniform contract every inference backend implements, whether it
//! wraps a remote HTTP API (OpenAI, Anthropic, a custom endpoint) or —
//! outside this crate's scope — a native kernel such as llama.cpp.
//! The registry (C2), the circuit breaker (C3), and the dispatcher
//! (C8) only ever hold a `Arc<dyn Provider>`; they never know which
//! concrete backend they are driving.
//!
//! Implementations must be thread-safe and must never retain a
//! reference to a request past the call that received it.

use crate::error::ProviderError;
use crate::models::{InferenceRequest, InferenceResponse, StreamChunk};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

pub mod anthropic;
pub mod custom;
pub mod http_client;
pub mod openai;

/// Static capability advertisement, consulted by the routing engine
/// (C7) to filter candidates before scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub function_calling: bool,
    pub tool_calling: bool,
    pub multimodal: bool,
    pub vision: bool,
    pub audio: bool,
    pub embedding: bool,
    pub max_context_tokens: u32,
    pub max_output_tokens: u32,
    /// Empty set means "any model id is supported".
    pub supported_models: HashSet<String>,
    pub supported_devices: HashSet<String>,
    pub supported_formats: HashSet<String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
    /// Routing weight copied from `ProviderConfig.priority` at
    /// construction time; consulted by the `Priority` strategy.
    #[serde(default)]
    pub priority: i32,
    /// Estimated per-1k-token cost copied from
    /// `ProviderConfig.cost_per_1k_tokens` at construction time;
    /// consulted by the `Cheapest` strategy.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

impl ProviderCapabilities {
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.contains(model)
    }

    pub fn supports_device(&self, device: &str) -> bool {
        self.supported_devices.is_empty() || self.supported_devices.contains(device)
    }
}

/// Provider health status, refreshed on demand and on breaker
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub details: std::collections::HashMap<String, String>,
}

impl ProviderHealth {
    pub fn up() -> Self {
        Self {
            status: HealthStatus::Up,
            message: "ok".into(),
            timestamp: chrono::Utc::now(),
            details: Default::default(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: message.into(),
            timestamp: chrono::Utc::now(),
            details: Default::default(),
        }
    }
}

/// Per-provider-instance configuration. Secrets are held in a
/// dedicated map so callers can redact them uniformly before logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub enabled: bool,
    pub priority: i32,
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub secrets: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
    /// Estimated per-1k-token cost, used by the `CHEAPEST` routing strategy.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut secrets = std::collections::HashMap::new();
        secrets.insert("api_key".to_string(), api_key.into());
        Self {
            id: id.into(),
            enabled: true,
            priority: 0,
            timeout: Duration::from_secs(30),
            base_url: None,
            properties: Default::default(),
            secrets,
            metadata: Default::default(),
            cost_per_1k_tokens: 0.0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn api_key(&self) -> Option<&str> {
        self.secrets.get("api_key").map(String::as_str)
    }
}

/// The Provider SPI (C1). Every backend — remote HTTP or (outside this
/// crate) a native kernel adapter — implements this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Backend implementation version, surfaced in health/diagnostic
    /// output. Remote HTTP backends report this crate's own version
    /// since they have no separate build of their own.
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// Opaque descriptive metadata (vendor, region, deployment tier)
    /// set at construction time from `ProviderConfig.metadata`. Empty
    /// by default.
    fn metadata(&self) -> &std::collections::HashMap<String, String> {
        static EMPTY: std::sync::OnceLock<std::collections::HashMap<String, String>> = std::sync::OnceLock::new();
        EMPTY.get_or_init(std::collections::HashMap::new)
    }

    fn capabilities(&self) -> &ProviderCapabilities;

    /// Pre-check used by the registry's capability index; must agree
    /// with `capabilities()` but may also reject on request shape
    /// (e.g. tool calls requested but unsupported).
    fn supports(&self, model: &str, request: &InferenceRequest) -> bool {
        let caps = self.capabilities();
        if !caps.supports_model(model) {
            return false;
        }
        if request.stream && !caps.streaming {
            return false;
        }
        if request.tools.is_some() && !caps.tool_calling {
            return false;
        }
        true
    }

    /// Validates `config` against this instance's mandatory
    /// requirements. Idempotent: callers may invoke it any number of
    /// times (config reload, health probe) without side effects beyond
    /// the check itself. Fails with `ProviderError::InitializationFailed`
    /// if mandatory config (e.g. an API key or base URL) is absent.
    /// Backends with no mandatory config accept the default no-op.
    async fn initialize(&self, _config: &ProviderConfig) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Blocking (up to the request's timeout) single-shot inference call.
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, ProviderError>;

    /// Streaming inference. Only called when `capabilities().streaming`.
    async fn infer_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk, ProviderError>>, ProviderError>;

    /// Must return within 2s or the caller treats the provider as
    /// `Unknown`; implementations should apply their own internal
    /// timeout rather than relying on the caller to enforce it.
    async fn health(&self) -> ProviderHealth;

    /// Releases any held resources (connections, native handles).
    /// Must be idempotent.
    async fn shutdown(&self) {}
}
