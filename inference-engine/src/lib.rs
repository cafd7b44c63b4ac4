//! # Inference Engine
//!
//! A multi-tenant control plane for routing, executing, and
//! safeguarding LLM inference calls across a pool of providers. The
//! engine provides:
//!
//! - **Provider SPI & Registry**: a uniform backend contract plus a
//!   concurrent catalog of live instances (see [`providers`], [`registry`]).
//! - **Circuit Breaking**: per-provider failure isolation with
//!   closed/open/half-open states (see [`circuit_breaker`]).
//! - **Quota & Rate Limiting**: token-bucket, sliding-window, and
//!   persistent-period admission plus per-tenant concurrency slots
//!   (see [`quota`]).
//! - **Session / Warm Pool**: single-flight, LRU-bounded caching of
//!   resolved provider handles (see [`session_pool`]).
//! - **Plugin Pipeline**: phase-ordered request/response hooks (see [`plugins`]).
//! - **Routing Engine**: filter-then-score candidate selection across
//!   several strategies (see [`routing`]).
//! - **Execution Dispatcher**: the orchestrator tying all of the above
//!   together for synchronous, streaming, and asynchronous dispatch
//!   (see [`dispatcher`]).
//! - **Metrics & Audit**: lock-free counters, latency percentiles, and
//!   structured audit logging (see [`metrics`]).
//! - **Async Job Store**: a background-job index for the async
//!   dispatch variant (see [`jobs`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use inference_engine::{Engine, EngineConfig};
//! use inference_engine::models::{InferenceRequest, Message};
//! use std::sync::Arc;
//!
//! # async fn run(provider: Arc<dyn inference_engine::providers::Provider>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineConfig::default());
//! engine.registry().register(provider).await;
//!
//! let request = InferenceRequest::new("tenant-a", "gpt-4", vec![Message::user("hello")]);
//! let response = engine.dispatcher().dispatch_sync(request).await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod common;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod plugins;
pub mod providers;
pub mod quota;
pub mod registry;
pub mod routing;
pub mod session_pool;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{EngineError, ErrorPayload, ProviderError};
pub use jobs::{JobId, JobStore, JobStoreConfig};
pub use metrics::MetricsRegistry;
pub use models::{InferenceRequest, InferenceResponse, Message, Role, StreamChunk};
pub use plugins::{ExecutionContext, Plugin, PluginPhase, PluginPipeline};
pub use providers::{Provider, ProviderCapabilities, ProviderConfig};
pub use quota::{QuotaConfig, QuotaManager};
pub use registry::ProviderRegistry;
pub use routing::{HealthTracker, Router, RoutingStrategy};
pub use session_pool::{SessionPool, SessionPoolConfig};

use dashmap::DashMap;
use std::sync::Arc;

/// Construction-time configuration for the root [`Engine`]. Each field
/// maps to one component's own config type; defaults match what that
/// component documents as its own default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub quota: QuotaConfig,
    pub session_pool: SessionPoolConfig,
    pub jobs: JobStoreConfig,
    pub redis: Option<redis::Client>,
    /// How often the background sweeper reclaims expired jobs and idle
    /// warm-pool entries. See [`Engine::spawn_sweeper`].
    pub sweep_interval: std::time::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            quota: QuotaConfig::default(),
            session_pool: SessionPoolConfig::default(),
            jobs: JobStoreConfig::default(),
            redis: None,
            sweep_interval: std::time::Duration::from_secs(60),
        }
    }
}

/// The root value wiring the registry, breaker table, quota manager,
/// session pool, plugin pipeline, routing engine, metrics registry,
/// job store, and dispatcher together once at construction. Holding
/// an `Engine` and cloning the `Arc`s it exposes is the only supported
/// way to stand up the control plane; there is no global singleton.
pub struct Engine {
    registry: Arc<ProviderRegistry>,
    pipeline: Arc<PluginPipeline>,
    metrics: Arc<MetricsRegistry>,
    jobs: Arc<JobStore>,
    session_pool: Arc<SessionPool>,
    dispatcher: Arc<Dispatcher>,
    sweep_interval: std::time::Duration,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(ProviderRegistry::new());
        let breakers = Arc::new(DashMap::new());
        let quota = Arc::new(QuotaManager::new(config.quota, config.redis));
        let session_pool = Arc::new(SessionPool::new(config.session_pool));
        let metrics = Arc::new(MetricsRegistry::new());
        let pipeline = Arc::new(PluginPipeline::new(metrics.clone()));
        let router = Arc::new(Router::new(registry.clone(), breakers.clone()));
        let health = Arc::new(HealthTracker::default());
        let jobs = Arc::new(JobStore::new(config.jobs));

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher,
            config.circuit_breaker,
            registry.clone(),
            breakers,
            quota,
            session_pool.clone(),
            pipeline.clone(),
            router,
            health,
            metrics.clone(),
            jobs.clone(),
        ));

        Self { registry, pipeline, metrics, jobs, session_pool, dispatcher, sweep_interval: config.sweep_interval }
    }

    /// Spawns the background task that periodically reclaims terminal
    /// jobs past `JobStoreConfig.ttl` (C10) and idle warm-pool entries
    /// past `SessionPoolConfig.idle_ttl` (C5). Must be called from
    /// within a Tokio runtime; detached, so the caller does not need to
    /// hold the returned handle, but may use it to await a clean
    /// shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let jobs = self.jobs.clone();
        let session_pool = self.session_pool.clone();
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                jobs.sweep_expired();
                session_pool.sweep_idle().await;
            }
        })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<PluginPipeline> {
        &self.pipeline
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn session_pool(&self) -> &Arc<SessionPool> {
        &self.session_pool
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_wires_up_with_defaults() {
        let engine = Engine::new(EngineConfig::default());
        assert!(engine.registry().is_empty());
        assert_eq!(engine.metrics().snapshot().requests_success, 0);
    }
}
