//! # Execution Dispatcher (C8)
//!
//! The orchestrator tying the registry (C2), circuit breaker (C3),
//! quota manager (C4), session pool (C5), plugin pipeline (C6), and
//! routing engine (C7) together. Grounded in the teacher's
//! `client.rs::execute_with_enhanced_retry` (attempt counting,
//! exponential backoff with jitter, `should_retry` classification) but
//! generalized from same-provider retry to the spec's
//! candidate-list-with-failover model, and from a narrow
//! `ProviderError` check to the full `EngineError::retryable`
//! taxonomy.
//!
//! INFERENCE-phase plugins run immediately before the dispatcher's own
//! provider call rather than making the call themselves: they decorate
//! shared context (prompt construction, tool injection) while the
//! actual `infer`/`infer_stream` invocation stays a single call site
//! the dispatcher owns, so retry/breaker/metrics bookkeeping never
//! has to guess whether a plugin already called the provider.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, Outcome};
use crate::common::jitter;
use crate::error::{EngineError, ProviderError};
use crate::jobs::{JobId, JobStore};
use crate::metrics::{MetricsRegistry, Severity};
use crate::models::{InferenceRequest, InferenceResponse, StreamChunk};
use crate::plugins::{ExecutionContext, PluginPhase, PluginPipeline};
use crate::quota::{QuotaError, QuotaManager};
use crate::registry::ProviderRegistry;
use crate::routing::{HealthTracker, Router, RoutingContext};
use crate::session_pool::{PoolKey, SessionPool};
use dashmap::DashMap;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatcherConfig {
    pub max_attempts: u32,
    #[serde(with = "crate::common::duration_serde")]
    pub backoff_base: Duration,
    #[serde(with = "crate::common::duration_serde")]
    pub backoff_max: Duration,
    #[serde(with = "crate::common::duration_serde")]
    pub default_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// `base * 2^(attempt-1) * rand(0.5..1.5)`, capped at `backoff_max`.
fn backoff_delay(config: &DispatcherConfig, attempt: u32) -> Duration {
    let base_ms = config.backoff_base.as_millis() as f64;
    let exponent = 2f64.powi(attempt as i32 - 1);
    let ms = (base_ms * exponent * jitter()).min(config.backoff_max.as_millis() as f64);
    Duration::from_millis(ms as u64)
}

fn quota_to_engine_error(err: QuotaError, tenant_id: &str) -> EngineError {
    match err {
        QuotaError::RateLimited { retry_after_ms } => EngineError::RateLimited { retry_after_ms },
        QuotaError::QuotaExceeded { .. } => EngineError::QuotaExceeded { tenant_id: tenant_id.to_string() },
        QuotaError::ConcurrencyExceeded => EngineError::ConcurrencyExceeded { tenant_id: tenant_id.to_string() },
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    breaker_config: CircuitBreakerConfig,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    quota: Arc<QuotaManager>,
    session_pool: Arc<SessionPool>,
    pipeline: Arc<PluginPipeline>,
    router: Arc<Router>,
    health: Arc<HealthTracker>,
    metrics: Arc<MetricsRegistry>,
    jobs: Arc<JobStore>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        breaker_config: CircuitBreakerConfig,
        registry: Arc<ProviderRegistry>,
        breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
        quota: Arc<QuotaManager>,
        session_pool: Arc<SessionPool>,
        pipeline: Arc<PluginPipeline>,
        router: Arc<Router>,
        health: Arc<HealthTracker>,
        metrics: Arc<MetricsRegistry>,
        jobs: Arc<JobStore>,
    ) -> Self {
        Self { config, breaker_config, registry, breakers, quota, session_pool, pipeline, router, health, metrics, jobs }
    }

    fn breaker_for(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider_id, self.breaker_config.clone())))
            .clone()
    }

    fn validate(&self, request: &InferenceRequest) -> Result<(), EngineError> {
        if request.messages.is_empty() {
            return Err(EngineError::BadRequest { message: "messages must not be empty".into() });
        }
        if let Some(max_tokens) = request.parameters.max_tokens {
            let candidates = self.registry.candidates_for(request);
            if !candidates.is_empty()
                && candidates.iter().all(|p| {
                    let limit = p.capabilities().max_output_tokens;
                    limit > 0 && max_tokens > limit
                })
            {
                return Err(EngineError::CapabilityMismatch {
                    message: format!("max_tokens {max_tokens} exceeds every candidate's max_output_tokens"),
                });
            }
        }
        Ok(())
    }

    async fn run_error_phase(&self, ctx: &mut ExecutionContext) {
        if let Err(err) = self.pipeline.run_phase(PluginPhase::Error, ctx).await {
            tracing::warn!(error = %err, "error-phase plugin itself failed");
        }
    }

    /// Runs a single request to completion, with failover across the
    /// routed candidate list on retryable failure.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id, tenant_id = %request.tenant_id))]
    pub async fn dispatch_sync(&self, request: InferenceRequest) -> Result<InferenceResponse, EngineError> {
        let dispatch_start = Instant::now();
        self.validate(&request)?;

        let tenant_id = request.tenant_id.clone();
        let _concurrency = self.quota.admit(&tenant_id, 1.0).await.map_err(|e| quota_to_engine_error(e, &tenant_id))?;

        let mut ctx = ExecutionContext::new(request.clone());
        if let Err(err) = self.pipeline.run_phase(PluginPhase::PreProcessing, &mut ctx).await {
            self.run_error_phase(&mut ctx).await;
            self.metrics.record_failure(err.code());
            return Err(err);
        }

        let routing_context = RoutingContext {
            device_hint: request.routing.device.clone(),
            cost_sensitive: request.routing.cost_sensitive,
            ..Default::default()
        };

        let candidates = match self.router.select(&request, &routing_context, &self.health, self.metrics.as_ref()).await {
            Ok(c) => c,
            Err(err) => {
                self.metrics.record_failure(err.code());
                return Err(err);
            }
        };

        let mut attempt: u32 = 0;
        let mut last_error: Option<EngineError> = None;

        for candidate in &candidates {
            if attempt >= self.config.max_attempts {
                break;
            }

            let breaker = self.breaker_for(&candidate.provider_id);
            let transition = match breaker.try_acquire().await {
                Ok(t) => t,
                Err(_) => {
                    tracing::debug!(provider_id = %candidate.provider_id, "circuit open, skipping candidate");
                    continue;
                }
            };
            if let Some(event) = transition {
                self.metrics.audit(&request.id.to_string(), &tenant_id, &format!("breaker {:?}->{:?}", event.from, event.to), Severity::Info);
            }

            attempt += 1;

            let provider_id = candidate.provider_id.clone();
            let session = match self
                .session_pool
                .acquire(PoolKey { tenant_id: tenant_id.clone(), model_id: request.model.clone() }, || async {
                    self.registry
                        .lookup(&provider_id)
                        .ok_or_else(|| ProviderError::InitializationFailed { message: format!("provider {provider_id} not registered") })
                })
                .await
            {
                Ok(guard) => guard,
                Err(err) => {
                    let engine_err = EngineError::from_provider_error(err);
                    self.metrics.record_error(engine_err.code());
                    if engine_err.retryable() {
                        breaker.report(Outcome::RetryableFailure).await;
                        self.metrics.record_retry(attempt);
                        last_error = Some(engine_err);
                        tokio::time::sleep(backoff_delay(&self.config, attempt)).await;
                        continue;
                    } else {
                        breaker.report(Outcome::FatalFailure).await;
                        self.run_error_phase(&mut ctx).await;
                        self.metrics.record_failure(engine_err.code());
                        return Err(engine_err);
                    }
                }
            };

            ctx.provider_id = Some(candidate.provider_id.clone());
            if let Err(err) = self.pipeline.run_phase(PluginPhase::Inference, &mut ctx).await {
                breaker.report(Outcome::FatalFailure).await;
                self.run_error_phase(&mut ctx).await;
                self.metrics.record_failure(err.code());
                return Err(err);
            }

            let phase_start = Instant::now();
            let result = session.provider().infer(&ctx.request).await;

            match result {
                Ok(mut response) => {
                    breaker.report(Outcome::Success).await;
                    self.metrics.record_success(&candidate.provider_id, dispatch_start.elapsed());
                    self.metrics.record_phase_duration("inference", true, phase_start.elapsed());

                    response.metadata.insert("provider".into(), candidate.provider_id.clone());
                    response.metadata.insert("session_loaded".into(), session.loaded().to_string());
                    ctx.response = Some(response.clone());

                    if let Err(err) = self.pipeline.run_phase(PluginPhase::PostProcessing, &mut ctx).await {
                        self.metrics.record_failure(err.code());
                        return Err(err);
                    }
                    return Ok(response);
                }
                Err(provider_err) => {
                    self.metrics.record_phase_duration("inference", false, phase_start.elapsed());
                    let engine_err = EngineError::from_provider_error(provider_err);
                    self.metrics.record_error(engine_err.code());

                    if engine_err.retryable() {
                        breaker.report(Outcome::RetryableFailure).await;
                        self.metrics.record_retry(attempt);
                        last_error = Some(engine_err);
                        tokio::time::sleep(backoff_delay(&self.config, attempt)).await;
                        continue;
                    } else {
                        breaker.report(Outcome::FatalFailure).await;
                        self.run_error_phase(&mut ctx).await;
                        self.metrics.record_failure(engine_err.code());
                        return Err(engine_err);
                    }
                }
            }
        }

        let final_error = last_error.unwrap_or(EngineError::NoProviderAvailable { model: request.model.clone() });
        self.run_error_phase(&mut ctx).await;
        self.metrics.record_failure("ALL_PROVIDERS_FAILED");
        Err(EngineError::AllProvidersFailed { source: Box::new(final_error) })
    }

    /// Establishes a stream against the first admissible candidate.
    /// Once subscribed, chunks forward in order; a mid-stream failure
    /// becomes a terminal error chunk and is reported to the breaker,
    /// but never triggers automatic failover to another candidate.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id, tenant_id = %request.tenant_id))]
    pub async fn dispatch_stream(&self, request: InferenceRequest) -> Result<BoxStream<'static, Result<StreamChunk, EngineError>>, EngineError> {
        self.validate(&request)?;

        let tenant_id = request.tenant_id.clone();
        let concurrency = self.quota.admit(&tenant_id, 1.0).await.map_err(|e| quota_to_engine_error(e, &tenant_id))?;

        let mut ctx = ExecutionContext::new(request.clone());
        self.pipeline.run_phase(PluginPhase::PreProcessing, &mut ctx).await?;

        let routing_context = RoutingContext {
            device_hint: request.routing.device.clone(),
            cost_sensitive: request.routing.cost_sensitive,
            ..Default::default()
        };
        let candidates = self.router.select(&request, &routing_context, &self.health, self.metrics.as_ref()).await?;

        let mut chosen = None;
        for candidate in &candidates {
            let breaker = self.breaker_for(&candidate.provider_id);
            if breaker.try_acquire().await.is_ok() {
                chosen = Some((candidate.provider_id.clone(), breaker));
                break;
            }
        }
        let (provider_id, breaker) = chosen.ok_or_else(|| EngineError::NoProviderAvailable { model: request.model.clone() })?;

        let session = self
            .session_pool
            .acquire(PoolKey { tenant_id: tenant_id.clone(), model_id: request.model.clone() }, || async {
                self.registry
                    .lookup(&provider_id)
                    .ok_or_else(|| ProviderError::InitializationFailed { message: format!("provider {provider_id} not registered") })
            })
            .await
            .map_err(EngineError::from_provider_error)?;

        let inner = session.provider().infer_stream(&request).await.map_err(EngineError::from_provider_error)?;
        let metrics = self.metrics.clone();

        let stream = async_stream::stream! {
            // Held for the stream's lifetime so the concurrency slot
            // and warm session outlive the last yielded chunk.
            let _concurrency = concurrency;
            let _session = session;
            let breaker = breaker;
            let mut inner = inner;

            loop {
                match futures::StreamExt::next(&mut inner).await {
                    Some(Ok(chunk)) => {
                        let done = chunk.done;
                        yield Ok(chunk);
                        if done {
                            breaker.report(Outcome::Success).await;
                            break;
                        }
                    }
                    Some(Err(provider_err)) => {
                        let engine_err = EngineError::from_provider_error(provider_err);
                        metrics.record_error(engine_err.code());
                        if engine_err.retryable() {
                            breaker.report(Outcome::RetryableFailure).await;
                        } else {
                            breaker.report(Outcome::FatalFailure).await;
                        }
                        yield Err(engine_err);
                        break;
                    }
                    None => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Records a `Pending` job, spawns the work, and returns
    /// immediately. The caller polls status via `JobStore::get`.
    pub async fn dispatch_async(self: &Arc<Self>, request: InferenceRequest) -> JobId {
        let (job_id, cancellation) = self.jobs.submit(request.tenant_id.clone());
        let dispatcher = self.clone();
        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            jobs.mark_running(&job_id);
            tokio::select! {
                result = dispatcher.dispatch_sync(request) => {
                    match result {
                        Ok(response) => jobs.complete(&job_id, response),
                        Err(err) => jobs.fail(&job_id, err.to_string()),
                    }
                }
                _ = cancellation.cancelled() => {
                    jobs.mark_cancelled(&job_id);
                }
            }
        });

        job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::ProviderError;
    use crate::models::{FinishReason, Message, Usage};
    use crate::providers::{Provider, ProviderCapabilities, ProviderHealth};
    use crate::quota::QuotaConfig;
    use crate::session_pool::SessionPoolConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        id: String,
        caps: ProviderCapabilities,
        attempts: Arc<AtomicUsize>,
        fail_times: usize,
        fatal: bool,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            "flaky"
        }
        fn capabilities(&self) -> &ProviderCapabilities {
            &self.caps
        }
        async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, ProviderError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(if self.fatal { ProviderError::InvalidApiKey } else { ProviderError::Timeout });
            }
            Ok(InferenceResponse {
                request_id: request.id,
                content: "hello".into(),
                model: request.model.clone(),
                usage: Usage::default(),
                duration_ms: 1,
                timestamp: Utc::now(),
                finish_reason: FinishReason::Stop,
                tool_calls: vec![],
                metadata: Default::default(),
            })
        }
        async fn infer_stream(
            &self,
            _request: &InferenceRequest,
        ) -> Result<BoxStream<'static, Result<StreamChunk, ProviderError>>, ProviderError> {
            unimplemented!()
        }
        async fn health(&self) -> ProviderHealth {
            ProviderHealth::up()
        }
    }

    async fn build_dispatcher(provider: Arc<dyn Provider>) -> Dispatcher {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(provider).await;
        let breakers = Arc::new(DashMap::new());
        let quota = Arc::new(QuotaManager::new(QuotaConfig::default(), None));
        let session_pool = Arc::new(SessionPool::new(SessionPoolConfig::default()));
        let metrics = Arc::new(MetricsRegistry::new());
        let pipeline = Arc::new(PluginPipeline::new(metrics.clone()));
        let router = Arc::new(Router::new(registry.clone(), breakers.clone()));
        let health = Arc::new(HealthTracker::default());
        let jobs = Arc::new(JobStore::new(Default::default()));

        Dispatcher::new(
            DispatcherConfig { max_attempts: 3, backoff_base: Duration::from_millis(1), backoff_max: Duration::from_millis(20), default_timeout: Duration::from_secs(5) },
            CircuitBreakerConfig::default(),
            registry,
            breakers,
            quota,
            session_pool,
            pipeline,
            router,
            health,
            metrics,
            jobs,
        )
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("t1", "m1", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn empty_messages_are_rejected_before_admission() {
        let provider = Arc::new(FlakyProvider { id: "p1".into(), caps: ProviderCapabilities::default(), attempts: Arc::new(AtomicUsize::new(0)), fail_times: 0, fatal: false });
        let dispatcher = build_dispatcher(provider).await;
        let mut req = request();
        req.messages.clear();
        let err = dispatcher.dispatch_sync(req).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest { .. }));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let provider = Arc::new(FlakyProvider { id: "p1".into(), caps: ProviderCapabilities::default(), attempts: Arc::new(AtomicUsize::new(0)), fail_times: 0, fatal: false });
        let dispatcher = build_dispatcher(provider).await;
        let response = dispatcher.dispatch_sync(request()).await.unwrap();
        assert_eq!(response.metadata.get("provider").unwrap(), "p1");
        assert_eq!(response.metadata.get("session_loaded").unwrap(), "true");
    }

    #[tokio::test]
    async fn retries_retryable_failure_then_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(FlakyProvider { id: "p1".into(), caps: ProviderCapabilities::default(), attempts: attempts.clone(), fail_times: 1, fatal: false });
        let dispatcher = build_dispatcher(provider).await;
        let response = dispatcher.dispatch_sync(request()).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_failure_surfaces_immediately_without_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(FlakyProvider { id: "p1".into(), caps: ProviderCapabilities::default(), attempts: attempts.clone(), fail_times: 100, fatal: true });
        let dispatcher = build_dispatcher(provider).await;
        let err = dispatcher.dispatch_sync(request()).await.unwrap_err();
        assert!(matches!(err, EngineError::ProviderAuthFailed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_all_attempts_surfaces_all_providers_failed() {
        let provider = Arc::new(FlakyProvider { id: "p1".into(), caps: ProviderCapabilities::default(), attempts: Arc::new(AtomicUsize::new(0)), fail_times: 100, fatal: false });
        let dispatcher = build_dispatcher(provider).await;
        let err = dispatcher.dispatch_sync(request()).await.unwrap_err();
        assert!(matches!(err, EngineError::AllProvidersFailed { .. }));
    }

    #[tokio::test]
    async fn open_breaker_skips_candidate_and_fails_with_no_provider() {
        let provider = Arc::new(FlakyProvider { id: "p1".into(), caps: ProviderCapabilities::default(), attempts: Arc::new(AtomicUsize::new(0)), fail_times: 0, fatal: false });
        let dispatcher = build_dispatcher(provider).await;
        dispatcher.breaker_for("p1").force_open().await;
        let err = dispatcher.dispatch_sync(request()).await.unwrap_err();
        assert!(matches!(err, EngineError::AllProvidersFailed { .. }) || matches!(err, EngineError::NoProviderAvailable { .. }));
        assert_eq!(dispatcher.health.is_down("p1"), false);
    }

    #[tokio::test]
    async fn async_dispatch_completes_job() {
        let provider = Arc::new(FlakyProvider { id: "p1".into(), caps: ProviderCapabilities::default(), attempts: Arc::new(AtomicUsize::new(0)), fail_times: 0, fatal: false });
        let dispatcher = Arc::new(build_dispatcher(provider).await);
        let job_id = dispatcher.dispatch_async(request()).await;

        for _ in 0..50 {
            if dispatcher.jobs.get(&job_id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = dispatcher.jobs.get(&job_id).unwrap();
        assert_eq!(snapshot.status, crate::jobs::JobStatus::Completed);
    }
}
