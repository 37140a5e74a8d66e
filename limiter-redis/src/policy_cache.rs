//! Policy cache: bounded LRU+TTL over tenant policies, a
//! single TTL'd slot for the global policy, background refresh, and
//! change-stream invalidation.
//!
//! Cache implementation is `moka::future::Cache`: async-native,
//! size+TTL bounded, and safe to hold across the await points this
//! crate's refresh loop and change-stream handler both need.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use limiter_core::{GlobalPolicy, TenantPolicy};
use moka::future::Cache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::policy_store::PolicyStore;

#[derive(Debug, Clone, Copy)]
pub struct PolicyCacheConfig {
    pub ttl: Duration,
    pub max_size: u64,
    pub refresh_interval: Duration,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(60_000),
            max_size: 10_000,
            refresh_interval: Duration::from_millis(30_000),
        }
    }
}

struct HitCounter {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HitCounter {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            1.0
        } else {
            hits / (hits + misses)
        }
    }
}

pub struct PolicyCache<S: PolicyStore + 'static> {
    store: Arc<S>,
    tenants: Cache<String, TenantPolicy>,
    global: Cache<(), GlobalPolicy>,
    hits: HitCounter,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    change_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: PolicyStore + 'static> PolicyCache<S> {
    pub fn new(store: Arc<S>, config: PolicyCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            tenants: Cache::builder()
                .max_capacity(config.max_size)
                .time_to_live(config.ttl)
                .build(),
            global: Cache::builder().max_capacity(1).time_to_live(config.ttl).build(),
            hits: HitCounter::new(),
            refresh_task: Mutex::new(None),
            change_task: Mutex::new(None),
        })
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantPolicy>, crate::error::StoreError> {
        if let Some(policy) = self.tenants.get(tenant_id).await {
            self.hits.hits.fetch_add(1, Ordering::Relaxed);
            limiter_core::telemetry::record_policy_cache_hit();
            limiter_core::telemetry::record_policy_cache_hit_ratio(self.hits.ratio());
            return Ok(Some(policy));
        }
        self.hits.misses.fetch_add(1, Ordering::Relaxed);
        limiter_core::telemetry::record_policy_cache_miss();
        limiter_core::telemetry::record_policy_cache_hit_ratio(self.hits.ratio());

        match self.store.get_tenant(tenant_id).await? {
            Some(policy) => {
                self.tenants.insert(tenant_id.to_string(), policy.clone()).await;
                Ok(Some(policy))
            }
            None => Ok(None),
        }
    }

    pub async fn get_global(&self) -> Result<GlobalPolicy, crate::error::StoreError> {
        if let Some(policy) = self.global.get(&()).await {
            return Ok(policy);
        }
        let policy = self.store.get_global().await?.unwrap_or_else(GlobalPolicy::permissive_default);
        self.global.insert((), policy.clone()).await;
        Ok(policy)
    }

    pub async fn invalidate_tenant(&self, tenant_id: &str) {
        self.tenants.invalidate(tenant_id).await;
    }

    pub async fn invalidate_global(&self) {
        self.global.invalidate(&()).await;
    }

    pub fn hit_ratio(&self) -> f64 {
        self.hits.ratio()
    }

    /// Spawns the background refresh loop (this module: "every 30s, for
    /// all currently resident tenant ids, reload and replace; evict on
    /// not-found").
    pub fn start(self: &Arc<Self>, config: PolicyCacheConfig) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.refresh_interval);
            loop {
                ticker.tick().await;
                let keys: Vec<String> = this.tenants.iter().map(|(k, _)| (*k).clone()).collect();
                for tenant_id in keys {
                    match this.store.get_tenant(&tenant_id).await {
                        Ok(Some(policy)) => this.tenants.insert(tenant_id, policy).await,
                        Ok(None) => this.tenants.invalidate(&tenant_id).await,
                        Err(e) => tracing::warn!(tenant_id, error = %e, "policy cache refresh failed"),
                    }
                }
                this.global.invalidate(&()).await;
            }
        });
        *self.refresh_task.lock() = Some(handle);
    }

    /// Consumes a change-event stream produced by
    /// `RedisPolicyStore::watch_changes` and applies invalidations.
    pub fn spawn_change_consumer(self: &Arc<Self>, mut events: tokio::sync::mpsc::Receiver<crate::policy_store::PolicyChangeEvent>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                // insert|update|delete all resolve to the same action: the
                // resident entry is stale either way, so just evict it.
                match event.tenant_id {
                    Some(tenant_id) => this.invalidate_tenant(&tenant_id).await,
                    None => this.invalidate_global().await,
                }
            }
        });
        *self.change_task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.refresh_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.change_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use limiter_core::{BucketPolicy, ThrottleConfig};
    use std::sync::atomic::AtomicUsize;

    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PolicyStore for CountingStore {
        async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantPolicy>, crate::error::StoreError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Some(TenantPolicy {
                tenant_id: tenant_id.to_string(),
                user_global: None,
                tenant_global: BucketPolicy::new(1000.0, 2000.0, None).unwrap(),
                user_endpoints: Default::default(),
                tenant_endpoints: Default::default(),
                throttle_config: ThrottleConfig::new(110.0, Some(100.0)).unwrap(),
            }))
        }
        async fn get_global(&self) -> Result<Option<GlobalPolicy>, crate::error::StoreError> {
            Ok(None)
        }
        async fn upsert_tenant(&self, _: &TenantPolicy) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn upsert_global(&self, _: &GlobalPolicy) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn delete_tenant(&self, _: &str) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn list_all_tenant(&self) -> Result<Vec<String>, crate::error::StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn second_lookup_is_cache_hit() {
        let store = Arc::new(CountingStore { calls: AtomicUsize::new(0) });
        let cache = PolicyCache::new(store.clone(), PolicyCacheConfig::default());
        cache.get_tenant("acme").await.unwrap();
        cache.get_tenant("acme").await.unwrap();
        assert_eq!(store.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let store = Arc::new(CountingStore { calls: AtomicUsize::new(0) });
        let cache = PolicyCache::new(store.clone(), PolicyCacheConfig::default());
        cache.get_tenant("acme").await.unwrap();
        cache.invalidate_tenant("acme").await;
        cache.get_tenant("acme").await.unwrap();
        assert_eq!(store.calls.load(Ordering::Relaxed), 2);
    }
}
