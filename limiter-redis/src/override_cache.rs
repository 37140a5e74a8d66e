//! Override cache: caches the resolved `get_active` result
//! — including the negative (`None`) result — under the
//! `override:{tenant}:{u|none}:{e|none}` key shape, and provides the
//! four-key invalidation sweep on mutation.

use std::sync::Arc;
use std::time::Duration;

use limiter_core::Override;
use moka::future::Cache;

use crate::error::StoreError;
use crate::override_store::OverrideStore;

#[derive(Debug, Clone, Copy)]
pub struct OverrideCacheConfig {
    pub ttl: Duration,
    pub max_size: u64,
}

impl Default for OverrideCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(30_000),
            max_size: 10_000,
        }
    }
}

pub struct OverrideCache<S: OverrideStore + 'static> {
    store: Arc<S>,
    cache: Cache<String, Option<Override>>,
}

impl<S: OverrideStore + 'static> OverrideCache<S> {
    pub fn new(store: Arc<S>, config: OverrideCacheConfig) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(config.max_size)
                .time_to_live(config.ttl)
                .build(),
        }
    }

    /// Returns the highest-precedence override active for
    /// `(tenant_id, user_id, endpoint)`, or `None`. On store failure,
    /// fails open (returns `Ok(None)`).
    pub async fn get_active(&self, tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> Option<Override> {
        let key = Override::cache_key(tenant_id, user_id, endpoint);
        if let Some(cached) = self.cache.get(&key).await {
            return cached;
        }

        let resolved = match self.resolve(tenant_id, user_id, endpoint).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tenant_id, error = %e, "override lookup failed, failing open");
                None
            }
        };
        self.cache.insert(key, resolved.clone()).await;
        resolved
    }

    async fn resolve(&self, tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> Result<Option<Override>, StoreError> {
        let now = now_epoch_s();
        let candidates: Vec<Override> = self
            .store
            .list_active(tenant_id)
            .await?
            .into_iter()
            .filter(|o| o.expires_at > now)
            .filter(|o| o.matches_shape(user_id, endpoint))
            .collect();
        Ok(Override::pick_most_specific(candidates))
    }

    /// Evicts all four cache keys for `(tenant, user, endpoint)` after
    /// a create/delete mutation, so no less-specific cached result
    /// masks a newly specific one.
    pub async fn invalidate_mutation(&self, tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) {
        for key in Override::invalidation_keys(tenant_id, user_id, endpoint) {
            self.cache.invalidate(&key).await;
        }
    }

    /// Creates an override through the backing store and invalidates
    /// every cache shape it could mask, in one call — the
    /// administrative-path counterpart to `get_active` used by the
    /// abuse detector and by manual operator tooling.
    pub async fn create(&self, override_: &Override) -> Result<String, StoreError> {
        let id = self.store.create(override_).await?;
        self.invalidate_mutation(
            &override_.tenant_id,
            override_.user_id.as_deref(),
            override_.endpoint.as_deref(),
        )
        .await;
        Ok(id)
    }

    /// Deletes an override and invalidates every cache shape it could
    /// mask.
    pub async fn delete(&self, tenant_id: &str, id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> Result<(), StoreError> {
        self.store.delete(tenant_id, id).await?;
        self.invalidate_mutation(tenant_id, user_id, endpoint).await;
        Ok(())
    }
}

fn now_epoch_s() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use limiter_core::{OverrideSource, OverrideType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        calls: AtomicUsize,
        overrides: Vec<Override>,
    }

    #[async_trait]
    impl OverrideStore for CountingStore {
        async fn create(&self, _: &Override) -> Result<String, StoreError> {
            unimplemented!()
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn list_active(&self, _tenant_id: &str) -> Result<Vec<Override>, StoreError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.overrides.clone())
        }
    }

    fn ban(tenant: &str) -> Override {
        Override {
            tenant_id: tenant.to_string(),
            user_id: None,
            endpoint: None,
            override_type: OverrideType::TemporaryBan,
            penalty_multiplier: None,
            custom_rate: None,
            custom_burst: None,
            reason: "abuse".into(),
            source: OverrideSource::AutoDetector,
            created_at: 0,
            expires_at: now_epoch_s() + 3600,
        }
    }

    #[tokio::test]
    async fn negative_result_is_cached() {
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            overrides: vec![],
        });
        let cache = OverrideCache::new(store.clone(), OverrideCacheConfig::default());
        assert!(cache.get_active("acme", Some("alice"), None).await.is_none());
        assert!(cache.get_active("acme", Some("alice"), None).await.is_none());
        assert_eq!(store.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalidate_mutation_clears_all_shapes() {
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            overrides: vec![ban("acme")],
        });
        let cache = OverrideCache::new(store.clone(), OverrideCacheConfig::default());
        cache.get_active("acme", Some("alice"), Some("/api")).await;
        cache.invalidate_mutation("acme", Some("alice"), Some("/api")).await;
        cache.get_active("acme", Some("alice"), Some("/api")).await;
        assert_eq!(store.calls.load(Ordering::Relaxed), 2);
    }
}
