//! # Routing Engine (C7)
//!
//! Turns a `RoutingContext` into an ordered list of provider
//! candidates the dispatcher (C8) attempts head-to-tail. Filtering
//! (capability, exclusions, breaker state, health, quota) always runs
//! first; scoring only ranks what survives the filter.

use crate::error::EngineError;
use crate::models::InferenceRequest;
use crate::providers::{HealthStatus, Provider};
use crate::registry::ProviderRegistry;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    UserSelected,
    LeastLatency,
    Cheapest,
    RoundRobin,
    Priority,
}

/// Per-request routing input. Filtering state (exclusions) is
/// threaded through via [`Self::exclude_provider`], which returns a
/// new context rather than mutating in place — each dispatcher retry
/// attempt owns its own exclusion set.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub excluded_providers: HashSet<String>,
    pub quota_exhausted_providers: HashSet<String>,
    pub device_hint: Option<String>,
    pub cost_sensitive: bool,
    pub tenant_default_strategy: Option<RoutingStrategy>,
}

impl RoutingContext {
    pub fn exclude_provider(&self, provider_id: &str) -> Self {
        let mut next = self.clone();
        next.excluded_providers.insert(provider_id.to_string());
        next
    }
}

#[derive(Clone)]
pub struct ProviderCandidate {
    pub provider_id: String,
    pub provider: Arc<dyn Provider>,
    pub score: f64,
    pub estimated_latency_ms: f64,
    pub estimated_cost: f64,
    pub priority: i32,
}

/// Tracks provider health independently of the registry, since health
/// is live state refreshed by a background prober rather than part of
/// the static catalog.
#[derive(Default)]
pub struct HealthTracker {
    status: DashMap<String, HealthStatus>,
}

impl HealthTracker {
    pub fn set(&self, provider_id: &str, status: HealthStatus) {
        self.status.insert(provider_id.to_string(), status);
    }

    /// Unknown (never probed) providers are treated as admissible;
    /// only a confirmed `Down` excludes a candidate.
    pub fn is_down(&self, provider_id: &str) -> bool {
        matches!(self.status.get(provider_id).map(|e| *e), Some(HealthStatus::Down))
    }
}

/// Supplies the p95 latency samples the `LeastLatency` strategy and
/// the routing tie-break consult. Implemented by the metrics layer
/// (C9); a zero-filled stub is fine before any samples exist.
pub trait LatencyOracle: Send + Sync {
    fn p95_latency_ms(&self, provider_id: &str) -> f64;
}

pub struct NoSamplesLatencyOracle;

impl LatencyOracle for NoSamplesLatencyOracle {
    fn p95_latency_ms(&self, _provider_id: &str) -> f64 {
        0.0
    }
}

pub struct Router {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    round_robin_cursor: AtomicUsize,
}

impl Router {
    pub fn new(registry: Arc<ProviderRegistry>, breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>) -> Self {
        Self { registry, breakers, round_robin_cursor: AtomicUsize::new(0) }
    }

    fn effective_strategy(&self, request: &InferenceRequest, context: &RoutingContext) -> RoutingStrategy {
        if context.cost_sensitive {
            return RoutingStrategy::Cheapest;
        }
        if let Some(strategy) = request.routing.strategy {
            return strategy;
        }
        context.tenant_default_strategy.unwrap_or(RoutingStrategy::LeastLatency)
    }

    /// Filters then scores candidates for `request`, returning them in
    /// dispatch order (best first).
    pub async fn select(
        &self,
        request: &InferenceRequest,
        context: &RoutingContext,
        health: &HealthTracker,
        latency: &dyn LatencyOracle,
    ) -> Result<Vec<ProviderCandidate>, EngineError> {
        let mut filtered = Vec::new();
        for provider in self.registry.candidates_for(request) {
            let id = provider.id().to_string();
            if context.excluded_providers.contains(&id) || context.quota_exhausted_providers.contains(&id) {
                continue;
            }
            if health.is_down(&id) {
                continue;
            }
            if let Some(device) = &context.device_hint {
                if !provider.capabilities().supports_device(device) {
                    continue;
                }
            }
            if let Some(breaker) = self.breakers.get(&id) {
                if breaker.state().await == CircuitState::Open {
                    continue;
                }
            }
            filtered.push(provider);
        }

        let strategy = self.effective_strategy(request, context);

        if let RoutingStrategy::UserSelected = strategy {
            let preferred = request
                .routing
                .preferred_provider
                .as_deref()
                .ok_or_else(|| EngineError::NoProviderAvailable { model: request.model.clone() })?;
            let chosen = filtered
                .into_iter()
                .find(|p| p.id() == preferred)
                .ok_or_else(|| EngineError::NoProviderAvailable { model: request.model.clone() })?;
            return Ok(vec![self.candidate(chosen, 0.0, latency)]);
        }

        if filtered.is_empty() {
            return Err(EngineError::NoProviderAvailable { model: request.model.clone() });
        }

        let mut candidates: Vec<ProviderCandidate> = match strategy {
            RoutingStrategy::LeastLatency => {
                filtered.into_iter().map(|p| { let score = -latency.p95_latency_ms(p.id()); self.candidate(p, score, latency) }).collect()
            }
            RoutingStrategy::Cheapest | RoutingStrategy::Priority => {
                filtered.into_iter().map(|p| self.candidate(p, 0.0, latency)).collect()
            }
            RoutingStrategy::RoundRobin => {
                let cursor = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst);
                let len = filtered.len();
                filtered
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let position = (i + len - (cursor % len)) % len;
                        self.candidate(p, -(position as f64), latency)
                    })
                    .collect()
            }
            RoutingStrategy::UserSelected => unreachable!(),
        };

        // Score already encodes the strategy's primary ordering, except
        // for cost/priority which need their own field populated above.
        for c in candidates.iter_mut() {
            match strategy {
                RoutingStrategy::Cheapest => c.score = -c.estimated_cost,
                RoutingStrategy::Priority => c.score = c.priority as f64,
                _ => {}
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.estimated_latency_ms.partial_cmp(&b.estimated_latency_ms).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });

        Ok(candidates)
    }

    fn candidate(&self, provider: Arc<dyn Provider>, score: f64, latency: &dyn LatencyOracle) -> ProviderCandidate {
        let id = provider.id().to_string();
        let estimated_latency_ms = latency.p95_latency_ms(&id);
        let caps = provider.capabilities();
        let estimated_cost = caps.cost_per_1k_tokens;
        let priority = caps.priority;
        ProviderCandidate { provider_id: id, provider, score, estimated_latency_ms, estimated_cost, priority }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::models::{InferenceResponse, StreamChunk};
    use crate::providers::{ProviderCapabilities, ProviderHealth};
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    struct StubProvider {
        id: String,
        caps: ProviderCapabilities,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            "stub"
        }
        fn capabilities(&self) -> &ProviderCapabilities {
            &self.caps
        }
        async fn infer(&self, _request: &InferenceRequest) -> Result<InferenceResponse, ProviderError> {
            unimplemented!()
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

    async fn router_with(ids: &[&str]) -> Router {
        let registry = Arc::new(ProviderRegistry::new());
        for id in ids {
            registry.register(Arc::new(StubProvider { id: id.to_string(), caps: ProviderCapabilities::default() })).await;
        }
        Router::new(registry, Arc::new(DashMap::new()))
    }

    async fn router_with_caps(entries: &[(&str, ProviderCapabilities)]) -> Router {
        let registry = Arc::new(ProviderRegistry::new());
        for (id, caps) in entries {
            registry.register(Arc::new(StubProvider { id: id.to_string(), caps: caps.clone() })).await;
        }
        Router::new(registry, Arc::new(DashMap::new()))
    }

    #[tokio::test]
    async fn no_candidates_yields_no_provider_available() {
        let router = router_with(&[]).await;
        let request = InferenceRequest::new("t1", "gpt-4", vec![]);
        let err = router
            .select(&request, &RoutingContext::default(), &HealthTracker::default(), &NoSamplesLatencyOracle)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoProviderAvailable { .. }));
    }

    #[tokio::test]
    async fn excluded_providers_are_filtered_out() {
        let router = router_with(&["p1", "p2"]).await;
        let request = InferenceRequest::new("t1", "gpt-4", vec![]);
        let context = RoutingContext::default().exclude_provider("p1");
        let candidates = router.select(&request, &context, &HealthTracker::default(), &NoSamplesLatencyOracle).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_id, "p2");
    }

    #[tokio::test]
    async fn down_health_excludes_candidate() {
        let router = router_with(&["p1", "p2"]).await;
        let health = HealthTracker::default();
        health.set("p1", HealthStatus::Down);
        let request = InferenceRequest::new("t1", "gpt-4", vec![]);
        let candidates = router.select(&request, &RoutingContext::default(), &health, &NoSamplesLatencyOracle).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_id, "p2");
    }

    #[tokio::test]
    async fn tie_break_is_deterministic_by_id() {
        let router = router_with(&["zeta", "alpha"]).await;
        let request = InferenceRequest::new("t1", "gpt-4", vec![]);
        let candidates = router.select(&request, &RoutingContext::default(), &HealthTracker::default(), &NoSamplesLatencyOracle).await.unwrap();
        assert_eq!(candidates[0].provider_id, "alpha");
    }

    #[tokio::test]
    async fn cheapest_strategy_orders_by_configured_cost() {
        let cheap = ProviderCapabilities { cost_per_1k_tokens: 0.001, ..Default::default() };
        let expensive = ProviderCapabilities { cost_per_1k_tokens: 0.05, ..Default::default() };
        let router = router_with_caps(&[("expensive", expensive), ("cheap", cheap)]).await;
        let mut request = InferenceRequest::new("t1", "gpt-4", vec![]);
        request.routing.strategy = Some(RoutingStrategy::Cheapest);
        let candidates = router.select(&request, &RoutingContext::default(), &HealthTracker::default(), &NoSamplesLatencyOracle).await.unwrap();
        assert_eq!(candidates[0].provider_id, "cheap");
    }

    #[tokio::test]
    async fn priority_strategy_orders_by_configured_priority() {
        let low = ProviderCapabilities { priority: 1, ..Default::default() };
        let high = ProviderCapabilities { priority: 10, ..Default::default() };
        let router = router_with_caps(&[("low", low), ("high", high)]).await;
        let mut request = InferenceRequest::new("t1", "gpt-4", vec![]);
        request.routing.strategy = Some(RoutingStrategy::Priority);
        let candidates = router.select(&request, &RoutingContext::default(), &HealthTracker::default(), &NoSamplesLatencyOracle).await.unwrap();
        assert_eq!(candidates[0].provider_id, "high");
    }
}
