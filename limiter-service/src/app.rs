//! The application object: an explicit struct constructed at startup,
//! with `start()`/`stop()` lifecycle methods, in place of singleton
//! process-wide caches with lazy init or other implicit globals.
//!
//! `App` owns every process-wide collaborator: the Redis-backed
//! stores and caches, the circuit breakers, the fallback limiter, the
//! decisioner, and the abuse detector. Nothing here is a `static` or a
//! `lazy_static`; `main.rs` constructs one `App` and holds it for the
//! process lifetime.

use std::sync::Arc;
use std::time::Duration;

use limiter_core::{CircuitBreaker, CircuitBreakerConfig, CoreError, FallbackLimiter};
use limiter_redis::{OverrideCache, OverrideCacheConfig, PolicyCache, PolicyCacheConfig, RedisBucketEngine, RedisOverrideStore, RedisPolicyStore};

use crate::abuse_detector::{AbuseDetector, AbuseDetectorConfig, TelemetryQuery};
use crate::config::AppConfig;
use crate::decisioner::Decisioner;

/// Telemetry-query stub: querying a live Prometheus HTTP API at
/// `telemetry.prometheus_url` is an external collaborator out of scope
/// for this core. This returns no tenants over any window,
/// so the abuse detector loop runs safely with nothing configured;
/// a deployment wires a real `TelemetryQuery` impl in its place.
pub struct NullTelemetry;

#[async_trait::async_trait]
impl TelemetryQuery for NullTelemetry {
    async fn throttle_ratios(&self, _window: Duration) -> Result<std::collections::HashMap<String, f64>, CoreError> {
        Ok(std::collections::HashMap::new())
    }
}

pub type AppDecisioner = Decisioner<RedisBucketEngine, PolicyCache<RedisPolicyStore>, OverrideCache<RedisOverrideStore>>;

pub struct App {
    pub config: AppConfig,
    pub policy_store: Arc<RedisPolicyStore>,
    pub policy_cache: Arc<PolicyCache<RedisPolicyStore>>,
    pub override_cache: Arc<OverrideCache<RedisOverrideStore>>,
    pub decisioner: Arc<AppDecisioner>,
    pub abuse_detector: Arc<AbuseDetector<NullTelemetry, RedisOverrideStore>>,
}

impl App {
    /// Connects every Redis-backed collaborator and wires the
    /// decisioner and abuse detector on top of them. Does not start
    /// any background loop; call [`App::start`] for that.
    pub async fn connect(config: AppConfig) -> Result<Self, anyhow::Error> {
        let engine = Arc::new(RedisBucketEngine::connect(&config.redis_url).await?);

        let policy_store = Arc::new(RedisPolicyStore::connect(&config.redis_url).await?);
        let policy_cache = PolicyCache::new(
            policy_store.clone(),
            PolicyCacheConfig {
                ttl: config.policy_cache_ttl,
                max_size: config.policy_cache_max_size,
                refresh_interval: config.policy_cache_refresh_interval,
            },
        );

        let override_store = Arc::new(RedisOverrideStore::connect(&config.redis_url).await?);
        let override_cache = Arc::new(OverrideCache::new(
            override_store,
            OverrideCacheConfig {
                ttl: config.override_cache_ttl,
                max_size: config.override_cache_max_size,
            },
        ));

        let bucket_breaker = Arc::new(CircuitBreaker::new(
            "bucket_store",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                timeout: config.circuit_breaker_timeout,
                success_threshold: config.circuit_breaker_success_threshold,
            },
        ));
        let fallback = Arc::new(FallbackLimiter::new(config.fallback_rpm));

        let decisioner = Arc::new(Decisioner::new(
            engine,
            policy_cache.clone(),
            override_cache.clone(),
            bucket_breaker,
            fallback,
            config.store_timeout,
        ));

        let abuse_detector = AbuseDetector::new(
            Arc::new(NullTelemetry),
            override_cache.clone(),
            AbuseDetectorConfig {
                enabled: config.abuse_enabled,
                check_interval: config.abuse_check_interval,
                throttle_threshold: config.abuse_throttle_threshold,
                window: config.abuse_window,
                penalty_duration: config.abuse_penalty_duration,
                penalty_type: config.abuse_penalty_type,
                penalty_multiplier: config.abuse_penalty_multiplier,
            },
        );

        Ok(Self {
            config,
            policy_store,
            policy_cache,
            override_cache,
            decisioner,
            abuse_detector,
        })
    }

    /// Starts every background loop: policy cache refresh, the policy
    /// change-stream consumer (best-effort — falls back to TTL-only
    /// consistency if keyspace notifications aren't enabled on the
    /// server), and the abuse detector.
    pub async fn start(&self) {
        self.policy_cache.start(PolicyCacheConfig {
            ttl: self.config.policy_cache_ttl,
            max_size: self.config.policy_cache_max_size,
            refresh_interval: self.config.policy_cache_refresh_interval,
        });

        match self.policy_store.watch_changes().await {
            Ok(events) => self.policy_cache.spawn_change_consumer(events),
            Err(e) => tracing::warn!(error = %e, "policy change stream unavailable, operating TTL-only"),
        }

        self.abuse_detector.start();
        tracing::info!(mode = self.config.mode.as_str(), "rate limiter application started");
    }

    /// Cancels background timers. Does not drain in-flight hot-path
    /// calls beyond what dropping their futures already does.
    pub fn stop(&self) {
        self.policy_cache.stop();
        self.abuse_detector.stop();
        tracing::info!("rate limiter application stopped");
    }
}
