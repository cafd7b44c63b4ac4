//! # Metrics & Audit (C9)
//!
//! Lock-free counters and latency samples, `DashMap`-backed, mirroring
//! the teacher's `metrics.rs` shape (a process-wide registry behind
//! read/write-cheap collections) but keyed the way the dispatcher (C8)
//! and routing engine (C7) need: by error type, retry attempt, phase,
//! and plugin id rather than by HTTP route.
//!
//! This registry also implements [`crate::routing::LatencyOracle`] so
//! the router can consult live p95 numbers without depending on this
//! module directly — it only depends on the trait.

use crate::routing::LatencyOracle;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const LATENCY_SAMPLE_CAP: usize = 256;

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A bounded ring of recent latency samples, used to compute p95 on
/// demand. Not a true streaming percentile estimator; fine at the
/// sample counts a single provider sees between scrapes.
struct LatencySamples {
    samples: Mutex<VecDeque<f64>>,
}

impl LatencySamples {
    fn new() -> Self {
        Self { samples: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLE_CAP)) }
    }

    fn record(&self, ms: f64) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == LATENCY_SAMPLE_CAP {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    fn p95(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64) * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn mean(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    fn count(&self) -> usize {
        self.samples.lock().unwrap().len()
    }
}

/// Severity of a structured audit event, mapped onto the matching
/// `tracing` macro at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Process-wide metrics and audit registry. One instance lives on the
/// root `Engine` and is shared by `Arc` with the dispatcher, plugin
/// pipeline, and routing engine.
#[derive(Default)]
pub struct MetricsRegistry {
    requests_success: Counter,
    requests_failure: DashMap<String, Counter>,
    retries: DashMap<u32, Counter>,
    errors: DashMap<String, Counter>,
    request_duration: LatencySamples,
    phase_duration: DashMap<(String, bool), LatencySamples>,
    plugin_duration: DashMap<(String, String, bool), LatencySamples>,
    provider_latency: DashMap<String, LatencySamples>,
    loaded_sessions: AtomicU64,
    active_concurrency: DashMap<String, AtomicU64>,
}

impl Default for LatencySamples {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, provider_id: &str, duration: Duration) {
        self.requests_success.incr();
        self.provider_latency.entry(provider_id.to_string()).or_insert_with(LatencySamples::new).record(duration.as_secs_f64() * 1000.0);
        self.request_duration.record(duration.as_secs_f64() * 1000.0);
    }

    pub fn record_failure(&self, error_type: &str) {
        self.requests_failure.entry(error_type.to_string()).or_default().incr();
    }

    pub fn record_retry(&self, attempt: u32) {
        self.retries.entry(attempt).or_default().incr();
    }

    pub fn record_error(&self, error_type: &str) {
        self.errors.entry(error_type.to_string()).or_default().incr();
    }

    pub fn record_phase_duration(&self, phase: &str, success: bool, duration: Duration) {
        self.phase_duration
            .entry((phase.to_string(), success))
            .or_insert_with(LatencySamples::new)
            .record(duration.as_secs_f64() * 1000.0);
    }

    pub fn record_plugin_duration(&self, plugin_id: &str, phase: &str, success: bool, duration: Duration) {
        self.plugin_duration
            .entry((plugin_id.to_string(), phase.to_string(), success))
            .or_insert_with(LatencySamples::new)
            .record(duration.as_secs_f64() * 1000.0);
    }

    pub fn set_loaded_sessions(&self, n: u64) {
        self.loaded_sessions.store(n, Ordering::Relaxed);
    }

    pub fn loaded_sessions(&self) -> u64 {
        self.loaded_sessions.load(Ordering::Relaxed)
    }

    pub fn set_active_concurrency(&self, tenant_id: &str, n: u64) {
        self.active_concurrency.entry(tenant_id.to_string()).or_default().store(n, Ordering::Relaxed);
    }

    pub fn active_concurrency(&self, tenant_id: &str) -> u64 {
        self.active_concurrency.get(tenant_id).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_success: self.requests_success.get(),
            requests_failure: self.requests_failure.iter().map(|e| (e.key().clone(), e.value().get())).collect(),
            retries: self.retries.iter().map(|e| (*e.key(), e.value().get())).collect(),
            errors: self.errors.iter().map(|e| (e.key().clone(), e.value().get())).collect(),
            request_duration_p95_ms: self.request_duration.p95(),
            request_duration_mean_ms: self.request_duration.mean(),
            loaded_sessions: self.loaded_sessions(),
        }
    }

    /// Emits a structured record for a state-changing event (breaker
    /// transition, job completion, eviction). Never includes stack
    /// traces or secrets; those belong in logs, not audit records.
    pub fn audit(&self, request_id: &str, tenant_id: &str, event: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!(request_id, tenant_id, event, "audit"),
            Severity::Warn => tracing::warn!(request_id, tenant_id, event, "audit"),
            Severity::Error => tracing::error!(request_id, tenant_id, event, "audit"),
        }
    }
}

impl LatencyOracle for MetricsRegistry {
    fn p95_latency_ms(&self, provider_id: &str) -> f64 {
        self.provider_latency.get(provider_id).map(|s| s.p95()).unwrap_or(0.0)
    }
}

/// A point-in-time snapshot suitable for a `/metrics`-style introspection endpoint.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub requests_success: u64,
    pub requests_failure: Vec<(String, u64)>,
    pub retries: Vec<(u32, u64)>,
    pub errors: Vec<(String, u64)>,
    pub request_duration_p95_ms: f64,
    pub request_duration_mean_ms: f64,
    pub loaded_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_updates_provider_latency() {
        let registry = MetricsRegistry::new();
        registry.record_success("p1", Duration::from_millis(50));
        registry.record_success("p1", Duration::from_millis(150));
        assert_eq!(registry.snapshot().requests_success, 2);
        assert!(registry.p95_latency_ms("p1") > 0.0);
    }

    #[test]
    fn failure_and_error_counters_key_by_type() {
        let registry = MetricsRegistry::new();
        registry.record_failure("PROVIDER_TIMEOUT");
        registry.record_failure("PROVIDER_TIMEOUT");
        registry.record_error("PROVIDER_TIMEOUT");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.requests_failure.iter().find(|(k, _)| k == "PROVIDER_TIMEOUT").unwrap().1, 2);
        assert_eq!(snapshot.errors.iter().find(|(k, _)| k == "PROVIDER_TIMEOUT").unwrap().1, 1);
    }

    #[test]
    fn retries_key_by_attempt_number() {
        let registry = MetricsRegistry::new();
        registry.record_retry(1);
        registry.record_retry(1);
        registry.record_retry(2);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.retries.iter().find(|(a, _)| *a == 1).unwrap().1, 2);
        assert_eq!(snapshot.retries.iter().find(|(a, _)| *a == 2).unwrap().1, 1);
    }

    #[test]
    fn unsampled_provider_reports_zero_latency() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.p95_latency_ms("never-seen"), 0.0);
    }

    #[test]
    fn concurrency_gauge_tracks_per_tenant() {
        let registry = MetricsRegistry::new();
        registry.set_active_concurrency("t1", 3);
        registry.set_active_concurrency("t2", 1);
        assert_eq!(registry.active_concurrency("t1"), 3);
        assert_eq!(registry.active_concurrency("t2"), 1);
    }
}
