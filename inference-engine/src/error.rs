//! # Error Taxonomy
//!
//! A closed set of error kinds spanning admission, routing, provider,
//! pipeline, and runtime failures. Every variant carries whether it is
//! retryable so the dispatcher (C8) and the circuit breaker (C3) can
//! classify outcomes without guessing from error text.
//!
//! [`ProviderError`] is the narrower error surface a [`crate::providers::Provider`]
//! implementation returns; it converts into [`EngineError`] at the
//! dispatcher boundary. [`EngineError::retryable`] is the single
//! source of truth consulted everywhere else in the crate.

use thiserror::Error;

/// Errors a provider implementation can return from `infer`/`infer_stream`/`health`.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    #[error("provider rate limit exceeded")]
    RateLimit,

    #[error("provider quota exceeded")]
    QuotaExceeded,

    #[error("provider service unavailable")]
    ServiceUnavailable,

    #[error("provider timeout")]
    Timeout,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid response format")]
    InvalidResponse,

    #[error("provider configuration error: {message}")]
    Configuration { message: String },

    #[error("content policy violation: {message}")]
    ContentPolicy { message: String },

    #[error("provider initialization failed: {message}")]
    InitializationFailed { message: String },
}

impl ProviderError {
    /// Whether this outcome should count toward the circuit breaker's
    /// failure threshold and drive a retry/failover attempt, per the
    /// classification in the error handling design.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Http(_)
                | ProviderError::ServiceUnavailable
                | ProviderError::Timeout
                | ProviderError::RateLimit
        )
    }
}

/// The engine-wide error taxonomy. One variant family per category in
/// the error handling design; every leaf knows its own retryability.
#[derive(Error, Debug)]
pub enum EngineError {
    // --- Admission errors ---
    #[error("missing tenant header")]
    AuthMissingTenant,
    #[error("invalid authentication: {message}")]
    AuthInvalid { message: String },
    #[error("quota exceeded for tenant {tenant_id}")]
    QuotaExceeded { tenant_id: String },
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("concurrency limit exceeded for tenant {tenant_id}")]
    ConcurrencyExceeded { tenant_id: String },

    // --- Routing errors ---
    #[error("no provider available for model {model}")]
    NoProviderAvailable { model: String },
    #[error("model not found: {model}")]
    ModelNotFound { model: String },
    #[error("capability mismatch: {message}")]
    CapabilityMismatch { message: String },

    // --- Provider errors ---
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(#[source] ProviderError),
    #[error("provider timeout: {0}")]
    ProviderTimeout(#[source] ProviderError),
    #[error("provider auth failed: {0}")]
    ProviderAuthFailed(#[source] ProviderError),
    #[error("provider rate limited: {0}")]
    ProviderRateLimited(#[source] ProviderError),
    #[error("provider init failed: {0}")]
    ProviderInitFailed(#[source] ProviderError),
    #[error("circuit open for provider {provider_id}")]
    CircuitOpen { provider_id: String },

    // --- Pipeline errors ---
    #[error("plugin {plugin_id} failed: {message}")]
    PluginFailed { plugin_id: String, message: String },
    #[error("content policy blocked: {message}")]
    ContentPolicyBlocked { message: String },

    // --- Runtime errors ---
    #[error("inference failed: {message}")]
    InferenceFailed { message: String },
    #[error("invalid request: {message}")]
    BadRequest { message: String },
    #[error("resource exhausted, retry after {retry_after_ms}ms")]
    ResourceExhausted { retry_after_ms: u64 },
    #[error("internal error: {message}")]
    Internal { message: String },

    // --- Cancellation ---
    #[error("request cancelled")]
    Cancelled,

    // --- Aggregate ---
    #[error("all providers failed; last error: {source}")]
    AllProvidersFailed { source: Box<EngineError> },
}

impl EngineError {
    /// The closed taxonomy code, used in the uniform error payload.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::AuthMissingTenant => "AUTH_MISSING_TENANT",
            EngineError::AuthInvalid { .. } => "AUTH_INVALID",
            EngineError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            EngineError::RateLimited { .. } => "RATE_LIMITED",
            EngineError::ConcurrencyExceeded { .. } => "CONCURRENCY_EXCEEDED",
            EngineError::NoProviderAvailable { .. } => "NO_PROVIDER_AVAILABLE",
            EngineError::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            EngineError::CapabilityMismatch { .. } => "CAPABILITY_MISMATCH",
            EngineError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            EngineError::ProviderTimeout(_) => "PROVIDER_TIMEOUT",
            EngineError::ProviderAuthFailed(_) => "PROVIDER_AUTH_FAILED",
            EngineError::ProviderRateLimited(_) => "PROVIDER_RATE_LIMITED",
            EngineError::ProviderInitFailed(_) => "PROVIDER_INIT_FAILED",
            EngineError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            EngineError::PluginFailed { .. } => "PLUGIN_FAILED",
            EngineError::ContentPolicyBlocked { .. } => "CONTENT_POLICY_BLOCKED",
            EngineError::InferenceFailed { .. } => "INFERENCE_FAILED",
            EngineError::BadRequest { .. } => "BAD_REQUEST",
            EngineError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            EngineError::Internal { .. } => "INTERNAL_ERROR",
            EngineError::Cancelled => "CANCELLED",
            EngineError::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
        }
    }

    /// Whether a caller may usefully retry the same request. Mirrors
    /// the admission/routing/provider/pipeline/runtime classification;
    /// `RATE_LIMITED` and the retryable provider kinds are the only
    /// admission/provider-level errors a caller should retry.
    pub fn retryable(&self) -> bool {
        match self {
            EngineError::RateLimited { .. } => true,
            EngineError::ProviderUnavailable(_)
            | EngineError::ProviderTimeout(_)
            | EngineError::ProviderRateLimited(_)
            | EngineError::CircuitOpen { .. }
            | EngineError::ResourceExhausted { .. } => true,
            _ => false,
        }
    }

    /// Builds the correctly-classified `EngineError` variant for a raw
    /// provider error, used by the dispatcher when wrapping an
    /// `infer`/`infer_stream` failure.
    pub fn from_provider_error(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidApiKey | ProviderError::ContentPolicy { .. } => {
                EngineError::ProviderAuthFailed(err)
            }
            ProviderError::RateLimit | ProviderError::QuotaExceeded => {
                EngineError::ProviderRateLimited(err)
            }
            ProviderError::Timeout => EngineError::ProviderTimeout(err),
            ProviderError::ServiceUnavailable | ProviderError::Http(_) => {
                EngineError::ProviderUnavailable(err)
            }
            ProviderError::InitializationFailed { .. } => EngineError::ProviderInitFailed(err),
            ProviderError::ModelNotFound { ref model } => {
                EngineError::ModelNotFound { model: model.clone() }
            }
            ProviderError::Serialization(_)
            | ProviderError::InvalidResponse
            | ProviderError::Configuration { .. } => {
                EngineError::InferenceFailed { message: err.to_string() }
            }
        }
    }
}

/// The uniform wire error payload described in the external
/// interfaces design: `{code, type, message, retryable, details?}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_node: Option<String>,
}

impl From<&EngineError> for ErrorPayload {
    fn from(err: &EngineError) -> Self {
        ErrorPayload {
            code: err.code().to_string(),
            kind: category(err),
            message: err.to_string(),
            retryable: err.retryable(),
            origin_node: None,
        }
    }
}

fn category(err: &EngineError) -> &'static str {
    match err {
        EngineError::AuthMissingTenant
        | EngineError::AuthInvalid { .. }
        | EngineError::QuotaExceeded { .. }
        | EngineError::RateLimited { .. }
        | EngineError::ConcurrencyExceeded { .. } => "admission_error",
        EngineError::NoProviderAvailable { .. }
        | EngineError::ModelNotFound { .. }
        | EngineError::CapabilityMismatch { .. } => "routing_error",
        EngineError::ProviderUnavailable(_)
        | EngineError::ProviderTimeout(_)
        | EngineError::ProviderAuthFailed(_)
        | EngineError::ProviderRateLimited(_)
        | EngineError::ProviderInitFailed(_)
        | EngineError::CircuitOpen { .. } => "provider_error",
        EngineError::PluginFailed { .. } | EngineError::ContentPolicyBlocked { .. } => "pipeline_error",
        EngineError::InferenceFailed { .. }
        | EngineError::BadRequest { .. }
        | EngineError::ResourceExhausted { .. }
        | EngineError::Internal { .. } => "runtime_error",
        EngineError::Cancelled => "cancellation",
        EngineError::AllProvidersFailed { .. } => "provider_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_timeout_is_retryable() {
        assert!(ProviderError::Timeout.retryable());
        assert!(!ProviderError::InvalidApiKey.retryable());
    }

    #[test]
    fn engine_error_classification_matches_taxonomy() {
        let e = EngineError::from_provider_error(ProviderError::Timeout);
        assert!(matches!(e, EngineError::ProviderTimeout(_)));
        assert!(e.retryable());
        assert_eq!(e.code(), "PROVIDER_TIMEOUT");

        let e = EngineError::from_provider_error(ProviderError::InvalidApiKey);
        assert!(!e.retryable());
        assert_eq!(e.code(), "PROVIDER_AUTH_FAILED");
    }

    #[test]
    fn error_payload_never_includes_stack_details() {
        let e = EngineError::QuotaExceeded { tenant_id: "t1".into() };
        let payload = ErrorPayload::from(&e);
        assert_eq!(payload.code, "QUOTA_EXCEEDED");
        assert!(payload.retryable == false);
    }
}
