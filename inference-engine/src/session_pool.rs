//! # Session / Warm Pool (C5)
//!
//! An LRU map keyed by `(tenant_id, model_id)` holding already-resolved
//! provider handles so the dispatcher (C8) does not pay resolution
//! cost on every call. Two callers racing to load the same key get a
//! single in-flight load; eviction prefers the idle LRU entry and
//! falls back to a soft cap rather than blocking admission.

use crate::error::ProviderError;
use crate::providers::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

/// `(tenant_id, model_id)`. Owned strings since the pool is long-lived
/// and keys come from per-request data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub tenant_id: String,
    pub model_id: String,
}

enum Slot {
    Loading(broadcast::Sender<Result<(), String>>),
    Loaded { provider: Arc<dyn Provider>, last_used: Instant, in_flight: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPoolConfig {
    pub capacity: usize,
    #[serde(with = "crate::common::duration_serde")]
    pub idle_ttl: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self { capacity: 64, idle_ttl: Duration::from_secs(600) }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolHealth {
    pub loaded: usize,
    pub loading: usize,
    pub evicted_total: u64,
}

/// Guard returned by [`SessionPool::acquire`]; decrements the entry's
/// in-flight counter on drop so idle sweeps and LRU eviction see an
/// accurate busy/idle signal.
pub struct SessionGuard {
    provider: Arc<dyn Provider>,
    pool: Arc<SessionPoolInner>,
    key: PoolKey,
    /// Whether this call executed the loader, as opposed to reusing an
    /// already-warm entry or awaiting a peer's in-flight load.
    loaded: bool,
}

impl SessionGuard {
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

struct SessionPoolInner {
    config: SessionPoolConfig,
    entries: Mutex<HashMap<PoolKey, Slot>>,
    lru_order: Mutex<Vec<PoolKey>>,
    evicted_total: AtomicU64,
}

impl SessionPoolInner {
    fn release(&self, key: &PoolKey) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if let Some(Slot::Loaded { in_flight, last_used, .. }) = entries.get_mut(key) {
                *in_flight = in_flight.saturating_sub(1);
                *last_used = Instant::now();
            }
        }
    }
}

/// LRU map of warm provider handles keyed by `(tenant_id, model_id)`.
pub struct SessionPool {
    inner: Arc<SessionPoolInner>,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig) -> Self {
        Self {
            inner: Arc::new(SessionPoolInner {
                config,
                entries: Mutex::new(HashMap::new()),
                lru_order: Mutex::new(Vec::new()),
                evicted_total: AtomicU64::new(0),
            }),
        }
    }

    /// Resolves `key` to a warm provider handle, loading it via
    /// `loader` if absent. Concurrent callers for the same key share a
    /// single load; a failed load is propagated to all waiters and
    /// nothing is cached.
    pub async fn acquire<F, Fut>(&self, key: PoolKey, loader: F) -> Result<SessionGuard, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<dyn Provider>, ProviderError>>,
    {
        loop {
            let mut entries = self.inner.entries.lock().await;
            match entries.get_mut(&key) {
                Some(Slot::Loaded { provider, last_used, in_flight }) => {
                    *in_flight += 1;
                    *last_used = Instant::now();
                    let provider = provider.clone();
                    drop(entries);
                    self.touch_lru(&key).await;
                    return Ok(SessionGuard { provider, pool: self.inner.clone(), key, loaded: false });
                }
                Some(Slot::Loading(tx)) => {
                    let mut rx = tx.subscribe();
                    drop(entries);
                    match rx.recv().await {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => return Err(ProviderError::InitializationFailed { message: e }),
                        Err(_) => continue,
                    }
                }
                None => {
                    let (tx, _) = broadcast::channel(1);
                    entries.insert(key.clone(), Slot::Loading(tx.clone()));
                    drop(entries);
                    self.ensure_capacity(&key).await;

                    let result = loader().await;
                    let mut entries = self.inner.entries.lock().await;
                    match result {
                        Ok(provider) => {
                            entries.insert(key.clone(), Slot::Loaded { provider: provider.clone(), last_used: Instant::now(), in_flight: 1 });
                            drop(entries);
                            self.touch_lru(&key).await;
                            let _ = tx.send(Ok(()));
                            return Ok(SessionGuard { provider, pool: self.inner.clone(), key, loaded: true });
                        }
                        Err(e) => {
                            entries.remove(&key);
                            drop(entries);
                            let _ = tx.send(Err(e.to_string()));
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn touch_lru(&self, key: &PoolKey) {
        let mut order = self.inner.lru_order.lock().await;
        order.retain(|k| k != key);
        order.push(key.clone());
    }

    /// Evicts the least-recently-used idle entry if the pool is at
    /// capacity. If every entry is busy, admits the new load anyway
    /// (soft cap).
    async fn ensure_capacity(&self, incoming: &PoolKey) {
        let count = self.inner.entries.lock().await.len();
        if count < self.inner.config.capacity {
            return;
        }
        let order = self.inner.lru_order.lock().await.clone();
        let mut entries = self.inner.entries.lock().await;
        for candidate in order.iter() {
            if candidate == incoming {
                continue;
            }
            if let Some(Slot::Loaded { in_flight, .. }) = entries.get(candidate) {
                if *in_flight == 0 {
                    if let Some(Slot::Loaded { provider, .. }) = entries.remove(candidate) {
                        drop(entries);
                        provider.shutdown().await;
                        self.inner.evicted_total.fetch_add(1, Ordering::SeqCst);
                        let mut order = self.inner.lru_order.lock().await;
                        order.retain(|k| k != candidate);
                        return;
                    }
                }
            }
        }
        // No idle candidate: exceed capacity briefly rather than block admission.
    }

    /// Evicts entries idle longer than `idle_ttl`, shutting down their
    /// provider handles. Intended to be driven by a periodic task.
    pub async fn sweep_idle(&self) {
        let now = Instant::now();
        let idle_keys: Vec<PoolKey> = {
            let entries = self.inner.entries.lock().await;
            entries
                .iter()
                .filter_map(|(k, v)| match v {
                    Slot::Loaded { last_used, in_flight, .. }
                        if *in_flight == 0 && now.duration_since(*last_used) >= self.inner.config.idle_ttl =>
                    {
                        Some(k.clone())
                    }
                    _ => None,
                })
                .collect()
        };

        for key in idle_keys {
            let removed = {
                let mut entries = self.inner.entries.lock().await;
                entries.remove(&key)
            };
            if let Some(Slot::Loaded { provider, .. }) = removed {
                provider.shutdown().await;
                self.inner.evicted_total.fetch_add(1, Ordering::SeqCst);
                let mut order = self.inner.lru_order.lock().await;
                order.retain(|k| k != &key);
            }
        }
    }

    pub async fn health(&self) -> PoolHealth {
        let entries = self.inner.entries.lock().await;
        let loaded = entries.values().filter(|s| matches!(s, Slot::Loaded { .. })).count();
        let loading = entries.values().filter(|s| matches!(s, Slot::Loading(_))).count();
        PoolHealth { loaded, loading, evicted_total: self.inner.evicted_total.load(Ordering::SeqCst) }
    }
}
