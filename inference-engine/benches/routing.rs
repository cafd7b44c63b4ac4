use criterion::{black_box, criterion_group, criterion_main, Criterion};
use inference_engine::models::{InferenceRequest, Message};
use inference_engine::providers::{Provider, ProviderCapabilities, ProviderHealth};
use inference_engine::routing::{HealthTracker, NoSamplesLatencyOracle, Router, RoutingContext};
use inference_engine::{ProviderRegistry, QuotaConfig, QuotaManager};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use std::sync::Arc;

struct BenchProvider {
    id: String,
    caps: ProviderCapabilities,
}

#[async_trait]
impl Provider for BenchProvider {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        "bench"
    }
    fn capabilities(&self) -> &ProviderCapabilities {
        &self.caps
    }
    async fn infer(
        &self,
        _request: &InferenceRequest,
    ) -> Result<inference_engine::models::InferenceResponse, inference_engine::ProviderError> {
        unimplemented!()
    }
    async fn infer_stream(
        &self,
        _request: &InferenceRequest,
    ) -> Result<BoxStream<'static, Result<inference_engine::models::StreamChunk, inference_engine::ProviderError>>, inference_engine::ProviderError>
    {
        unimplemented!()
    }
    async fn health(&self) -> ProviderHealth {
        ProviderHealth::up()
    }
}

fn router_with(rt: &tokio::runtime::Runtime, n: usize) -> Router {
    let registry = Arc::new(ProviderRegistry::new());
    for i in 0..n {
        rt.block_on(registry.register(Arc::new(BenchProvider { id: format!("p{i}"), caps: ProviderCapabilities::default() })));
    }
    Router::new(registry, Arc::new(DashMap::new()))
}

fn bench_request_creation(c: &mut Criterion) {
    c.bench_function("inference_request_creation", |b| {
        b.iter(|| {
            let _request = InferenceRequest::new(
                "tenant-a",
                "gpt-4",
                vec![Message::system("You are a helpful assistant."), Message::user("Hello, how are you?")],
            );
        });
    });
}

fn bench_message_creation(c: &mut Criterion) {
    c.bench_function("message_creation", |b| {
        b.iter(|| {
            let _user_msg = Message::user("Hello, world!");
            let _assistant_msg = Message::assistant("Hi there!");
            let _system_msg = Message::system("You are a helpful assistant.");
        });
    });
}

fn bench_serialization(c: &mut Criterion) {
    let request = InferenceRequest::new(
        "tenant-a",
        "gpt-4",
        vec![Message::system("You are a helpful assistant."), Message::user("Hello, how are you?")],
    );

    c.bench_function("request_serialization", |b| {
        b.iter(|| {
            let _json = serde_json::to_string(black_box(&request));
        });
    });

    c.bench_function("request_deserialization", |b| {
        let json = serde_json::to_string(&request).unwrap();
        b.iter(|| {
            let _request: InferenceRequest = serde_json::from_str(black_box(&json)).unwrap();
        });
    });
}

fn bench_routing_select(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = router_with(&rt, 10);
    let request = InferenceRequest::new("tenant-a", "gpt-4", vec![Message::user("hi")]);
    let context = RoutingContext::default();
    let health = HealthTracker::default();

    c.bench_function("router_select_10_candidates", |b| {
        b.iter(|| {
            rt.block_on(async { router.select(black_box(&request), &context, &health, &NoSamplesLatencyOracle).await.unwrap() });
        });
    });
}

fn bench_quota_admit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let qm = QuotaManager::new(
        QuotaConfig { token_bucket_capacity: 1_000_000.0, token_bucket_refill_per_sec: 1_000_000.0, max_concurrency: 1_000_000, ..Default::default() },
        None,
    );

    c.bench_function("quota_admit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let _guard = qm.admit(black_box("tenant-a"), 1.0).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_request_creation, bench_message_creation, bench_serialization, bench_routing_select, bench_quota_admit);
criterion_main!(benches);
