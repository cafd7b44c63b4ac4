//! # Plugin Pipeline (C6)
//!
//! Phase-ordered, process-wide singleton plugins contributing to a
//! shared [`ExecutionContext`]. Grounded in the teacher's
//! `plugins::PluginManager` (a `DashMap` of managed plugins plus a
//! sorted execution order) but generalized from HTTP
//! `Request<Body>`/`Response<Body>` hooks to phase-scoped hooks over
//! an engine-native context, since this crate never touches raw wire
//! bytes.

use crate::error::EngineError;
use crate::metrics::MetricsRegistry;
use crate::models::{InferenceRequest, InferenceResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// The four points in the dispatcher's lifecycle a plugin can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginPhase {
    PreProcessing,
    Inference,
    PostProcessing,
    Error,
}

impl PluginPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginPhase::PreProcessing => "pre_processing",
            PluginPhase::Inference => "inference",
            PluginPhase::PostProcessing => "post_processing",
            PluginPhase::Error => "error",
        }
    }
}

/// Shared, mutable state threaded through a single request's plugin
/// invocations. `variables` is the generic scratch space plugins use
/// to pass data to each other (e.g. a PRE_PROCESSING plugin stashing
/// `"built_prompt"` for the INFERENCE-phase plugin that calls the
/// provider).
pub struct ExecutionContext {
    pub request: InferenceRequest,
    pub variables: HashMap<String, Value>,
    pub provider_id: Option<String>,
    pub response: Option<InferenceResponse>,
}

impl ExecutionContext {
    pub fn new(request: InferenceRequest) -> Self {
        Self { request, variables: HashMap::new(), provider_id: None, response: None }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }
}

/// What the pipeline does after a plugin's `execute` returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Continue,
    Halt,
}

/// A single pipeline stage. Implementations are process-wide
/// singletons; dynamic config updates should validate a replacement
/// plugin before swapping it into the pipeline (validate-then-apply).
#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;
    fn phase(&self) -> PluginPhase;
    /// Execution order within `phase`, ascending; ties break by `id`.
    fn order(&self) -> i32;

    /// Cheap pre-check; skipped plugins do not count toward latency
    /// or success/failure metrics.
    async fn should_execute(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError>;

    /// Default halts the pipeline on any error. ERROR-phase plugins
    /// still run afterward regardless of this return value.
    fn on_failure(&self, _ctx: &ExecutionContext, _err: &EngineError) -> FailureAction {
        FailureAction::Halt
    }
}

/// Ordered collection of plugins, executed phase-by-phase by the
/// dispatcher (C8). Registration re-sorts the whole list; lookups at
/// run time filter to the requested phase.
pub struct PluginPipeline {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    metrics: Arc<MetricsRegistry>,
}

impl PluginPipeline {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { plugins: RwLock::new(Vec::new()), metrics }
    }

    pub async fn register(&self, plugin: Arc<dyn Plugin>) {
        let mut plugins = self.plugins.write().await;
        plugins.push(plugin);
        plugins.sort_by(|a, b| a.order().cmp(&b.order()).then_with(|| a.id().cmp(b.id())));
    }

    /// Runs every plugin registered for `phase`, in order. Stops at
    /// the first plugin whose `on_failure` returns `Halt` and
    /// propagates its error; a `Continue` failure is recorded but does
    /// not stop the phase.
    pub async fn run_phase(&self, phase: PluginPhase, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        let plugins: Vec<Arc<dyn Plugin>> = {
            let all = self.plugins.read().await;
            all.iter().filter(|p| p.phase() == phase).cloned().collect()
        };

        for plugin in plugins {
            if !plugin.should_execute(ctx).await {
                continue;
            }
            let start = Instant::now();
            let result = plugin.execute(ctx).await;
            let success = result.is_ok();
            self.metrics.record_plugin_duration(plugin.id(), phase.as_str(), success, start.elapsed());

            if let Err(err) = result {
                tracing::warn!(plugin_id = plugin.id(), phase = phase.as_str(), error = %err, "plugin failed");
                match plugin.on_failure(ctx, &err) {
                    FailureAction::Continue => continue,
                    FailureAction::Halt => return Err(err),
                }
            }
        }
        Ok(())
    }
}
