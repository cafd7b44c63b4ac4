//! # Provider Registry (C2)
//!
//! A concurrent directory of live provider instances. The router (C7)
//! and dispatcher (C8) never hold a provider directly; they ask the
//! registry for the current candidate set instead, so a provider can
//! be swapped out (config reload, credential rotation) without
//! disturbing in-flight requests that already hold an `Arc` to the
//! old instance.

use crate::models::InferenceRequest;
use crate::providers::Provider;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent `id -> Arc<dyn Provider>` directory.
///
/// Registering under an id that already exists replaces the prior
/// instance and shuts it down; in-flight calls that already cloned the
/// old `Arc` keep running against it until they finish.
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: DashMap::new() }
    }

    /// Registers `provider`, replacing any prior instance with the same
    /// id and shutting it down. In-flight calls that already cloned the
    /// old `Arc` keep running against it; `shutdown` only runs once this
    /// call's replacement is visible to new lookups.
    pub async fn register(&self, provider: Arc<dyn Provider>) -> Option<Arc<dyn Provider>> {
        let id = provider.id().to_string();
        let replaced = self.providers.insert(id.clone(), provider);
        if let Some(old) = &replaced {
            tracing::info!(provider_id = %id, "provider registration replaced");
            old.shutdown().await;
        } else {
            tracing::info!(provider_id = %id, "provider registered");
        }
        replaced
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.remove(id).map(|(_, p)| p)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Providers whose static capabilities and `supports()` pre-check
    /// accept `request`. The routing engine (C7) further filters this
    /// set on live state (breaker, health, quota) that the registry
    /// does not track.
    pub fn candidates_for(&self, request: &InferenceRequest) -> Vec<Arc<dyn Provider>> {
        self.providers
            .iter()
            .map(|e| e.value().clone())
            .filter(|p| p.supports(&request.model, request))
            .collect()
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        id: String,
        caps: ProviderCapabilities,
        shutdown_calls: Arc<AtomicUsize>,
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
        async fn shutdown(&self) {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stub(id: &str) -> (Arc<StubProvider>, Arc<AtomicUsize>) {
        let shutdown_calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(StubProvider { id: id.to_string(), caps: ProviderCapabilities::default(), shutdown_calls: shutdown_calls.clone() }),
            shutdown_calls,
        )
    }

    #[tokio::test]
    async fn register_then_lookup_round_trips() {
        let registry = ProviderRegistry::new();
        let (provider, _) = stub("p1");
        registry.register(provider).await;
        assert!(registry.lookup("p1").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn registering_duplicate_id_replaces_prior_instance_and_shuts_it_down() {
        let registry = ProviderRegistry::new();
        let (first, first_shutdowns) = stub("p1");
        let (second, _) = stub("p1");
        registry.register(first.clone()).await;
        let replaced = registry.register(second.clone()).await;
        assert!(Arc::ptr_eq(&replaced.unwrap(), &(first as Arc<dyn Provider>)));
        assert!(Arc::ptr_eq(&registry.lookup("p1").unwrap(), &(second as Arc<dyn Provider>)));
        assert_eq!(registry.len(), 1);
        assert_eq!(first_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let registry = ProviderRegistry::new();
        let (provider, _) = stub("p1");
        registry.register(provider).await;
        assert!(registry.unregister("p1").is_some());
        assert!(registry.lookup("p1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn candidates_for_filters_by_capability() {
        let registry = ProviderRegistry::new();
        let (mut provider, _) = stub("p1");
        Arc::get_mut(&mut provider).unwrap().caps.supported_models.insert("gpt-4".into());
        registry.register(provider).await;

        let mut request = InferenceRequest::new("tenant-a", "gpt-4", vec![]);
        assert_eq!(registry.candidates_for(&request).len(), 1);

        request.model = "claude-3".into();
        assert_eq!(registry.candidates_for(&request).len(), 0);
    }
}
