//! The hot-path decisioner: resolves policy, applies any active
//! override, evaluates every configured scope, and aggregates to one
//! `Decision` — or falls back to the process-local limiter when the
//! store is unhealthy.
//!
//! `Decisioner<E, P, O>` is generic over three swappable collaborators
//! (bucket engine, policy provider, override provider), so unit tests
//! substitute in-memory doubles for all three without touching Redis.
//!
//! `decide` is a plain `async fn`: cancellation falls out of
//! Rust's ordinary drop-the-future cancellation and needs no extra
//! plumbing here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use limiter_core::bucket::{reset_epoch_s, retry_after_s, scope_key, BucketStateLevel, Scope};
use limiter_core::{
    BucketPolicy, CircuitBreaker, CoreError, Decision, FallbackLimiter, GlobalPolicy, Override,
    OverrideType, RequestIdentity, ScopeCheckAggregateInput, ScopeCheckDebug, TenantPolicy,
};
use limiter_redis::{
    partition_by_hash_tag, BatchEvalRequest, BucketEngine, OverrideCache, OverrideStore,
    PolicyCache, PolicyStore,
};

/// Supplies tenant/global policy, cache-first.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn tenant_policy(&self, tenant_id: &str) -> Result<Option<TenantPolicy>, CoreError>;
    async fn global_policy(&self) -> Result<GlobalPolicy, CoreError>;
}

/// Supplies the active override for a request shape,
/// already failing open to `None` on backend trouble.
#[async_trait]
pub trait OverrideProvider: Send + Sync {
    async fn active_override(&self, tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> Option<Override>;
}

#[async_trait]
impl<S: PolicyStore + 'static> PolicyProvider for PolicyCache<S> {
    async fn tenant_policy(&self, tenant_id: &str) -> Result<Option<TenantPolicy>, CoreError> {
        self.get_tenant(tenant_id).await.map_err(CoreError::from)
    }

    async fn global_policy(&self) -> Result<GlobalPolicy, CoreError> {
        self.get_global().await.map_err(CoreError::from)
    }
}

#[async_trait]
impl<S: OverrideStore + 'static> OverrideProvider for OverrideCache<S> {
    async fn active_override(&self, tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> Option<Override> {
        self.get_active(tenant_id, user_id, endpoint).await
    }
}

/// What the decisioner produced: a primary decision, or a fallback
/// decision taken because the store path was unhealthy.
#[derive(Debug, Clone)]
pub enum DecisionOutcome {
    Primary(Decision),
    Fallback(limiter_core::fallback::FallbackDecision),
}

fn now_epoch_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

fn now_epoch_s() -> i64 {
    now_epoch_ms() / 1000
}

fn apply_override(policy: BucketPolicy, ov: Option<&Override>) -> BucketPolicy {
    match ov.and_then(|o| o.apply_to(&policy)) {
        Some(scaled) => scaled,
        None => policy,
    }
}

/// One scope queued for evaluation: everything needed to build the
/// store request and, afterwards, to fold its result back in.
struct PendingCheck {
    scope: Scope,
    request: BatchEvalRequest,
    policy: BucketPolicy,
    order: usize,
}

pub struct Decisioner<E: BucketEngine, P: PolicyProvider, O: OverrideProvider> {
    engine: Arc<E>,
    policies: Arc<P>,
    overrides: Arc<O>,
    bucket_breaker: Arc<CircuitBreaker>,
    fallback: Arc<FallbackLimiter>,
    store_timeout: Duration,
}

impl<E: BucketEngine, P: PolicyProvider, O: OverrideProvider> Decisioner<E, P, O> {
    pub fn new(
        engine: Arc<E>,
        policies: Arc<P>,
        overrides: Arc<O>,
        bucket_breaker: Arc<CircuitBreaker>,
        fallback: Arc<FallbackLimiter>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            policies,
            overrides,
            bucket_breaker,
            fallback,
            store_timeout,
        }
    }

    pub async fn decide(&self, identity: &RequestIdentity) -> Result<DecisionOutcome, CoreError> {
        let tenant_policy = self
            .policies
            .tenant_policy(&identity.tenant_id)
            .await?
            .ok_or(CoreError::PolicyNotFound)?;

        let active_override = self
            .overrides
            .active_override(&identity.tenant_id, Some(&identity.user_id), Some(&identity.endpoint))
            .await;

        if let Some(ov) = &active_override {
            if ov.override_type == OverrideType::TemporaryBan {
                return Ok(DecisionOutcome::Primary(self.ban_decision(&tenant_policy, ov)));
            }
            // A non-ban override is about to reshape every scope it
            // covers (see `apply_override`/`build_checks` below); count
            // it as applied once per decision rather than once per scope.
            limiter_core::telemetry::record_override_applied(
                override_type_label(ov.override_type),
                override_source_label(ov.source),
            );
        }

        let global_policy = self.policies.global_policy().await.unwrap_or_else(|_| GlobalPolicy::permissive_default());

        let checks = self.build_checks(identity, &tenant_policy, &global_policy, active_override.as_ref());

        if !self.bucket_breaker.allow_request() {
            limiter_core::telemetry::record_fallback_activation("circuit_open");
            return Ok(DecisionOutcome::Fallback(self.fallback.check(&identity.tenant_id, now_epoch_s())));
        }

        let requests: Vec<BatchEvalRequest> = checks.iter().map(|c| c.request.clone()).collect();
        let groups = partition_by_hash_tag(requests);
        let engine = Arc::clone(&self.engine);
        let started = std::time::Instant::now();
        let call = async move {
            let group_results = futures_util::future::try_join_all(groups.iter().map(|g| engine.evaluate_many(g))).await?;
            let mut by_key = HashMap::new();
            for (group, results) in groups.iter().zip(group_results) {
                for (request, result) in group.iter().zip(results) {
                    by_key.insert(request.key.clone(), result);
                }
            }
            Ok::<_, limiter_redis::StoreError>(by_key)
        };

        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(results_by_key)) => {
                self.bucket_breaker.record_success();
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                for check in &checks {
                    limiter_core::telemetry::record_check_duration(check.scope, elapsed_ms);
                }
                Ok(DecisionOutcome::Primary(self.aggregate(identity, checks, &results_by_key)))
            }
            Ok(Err(_store_error)) => {
                self.bucket_breaker.record_failure();
                limiter_core::telemetry::record_fallback_activation("store_error");
                Ok(DecisionOutcome::Fallback(self.fallback.check(&identity.tenant_id, now_epoch_s())))
            }
            Err(_) => {
                self.bucket_breaker.record_failure();
                limiter_core::telemetry::record_fallback_activation("store_timeout");
                Ok(DecisionOutcome::Fallback(self.fallback.check(&identity.tenant_id, now_epoch_s())))
            }
        }
    }

    fn ban_decision(&self, tenant_policy: &TenantPolicy, ov: &Override) -> Decision {
        let now = now_epoch_s();
        let retry_after = (ov.expires_at - now).max(0);
        limiter_core::telemetry::record_override_applied(override_type_label(ov.override_type), override_source_label(ov.source));
        Decision {
            allowed: false,
            state: BucketStateLevel::Hard,
            scope: Scope::TenantGlobal,
            limit: tenant_policy.tenant_global.rpm,
            remaining: 0.0,
            reset_epoch_s: ov.expires_at,
            retry_after_s: Some(retry_after),
            debug: vec![],
        }
    }

    fn build_checks(
        &self,
        identity: &RequestIdentity,
        tenant_policy: &TenantPolicy,
        global_policy: &GlobalPolicy,
        active_override: Option<&Override>,
    ) -> Vec<PendingCheck> {
        let throttle = tenant_policy.throttle_config;
        let mut checks = Vec::new();
        let mut order = 0usize;

        let mut push = |scope: Scope, policy: BucketPolicy, soft_pct: f64, hard_pct: f64, checks: &mut Vec<PendingCheck>, order: &mut usize| {
            let key = scope_key(scope, &identity.tenant_id, &identity.user_id, &identity.endpoint);
            let ttl_s = bucket_ttl_s(&policy);
            checks.push(PendingCheck {
                scope,
                policy,
                order: *order,
                request: BatchEvalRequest {
                    key,
                    capacity: policy.burst_capacity,
                    refill_rate_per_sec: policy.refill_rate_per_sec,
                    soft_pct,
                    hard_pct,
                    ttl_s,
                },
            });
            *order += 1;
        };

        if let Some(p) = tenant_policy.user_global {
            push(Scope::UserGlobal, apply_override(p, active_override), throttle.soft_threshold_pct, throttle.hard_threshold_pct, &mut checks, &mut order);
        }
        if let Some(p) = tenant_policy.user_endpoints.get(&identity.endpoint).copied() {
            push(Scope::UserEndpoint, apply_override(p, active_override), throttle.soft_threshold_pct, throttle.hard_threshold_pct, &mut checks, &mut order);
        }
        push(Scope::TenantGlobal, apply_override(tenant_policy.tenant_global, active_override), throttle.soft_threshold_pct, throttle.hard_threshold_pct, &mut checks, &mut order);
        if let Some(p) = tenant_policy.tenant_endpoints.get(&identity.endpoint).copied() {
            push(Scope::TenantEndpoint, apply_override(p, active_override), throttle.soft_threshold_pct, throttle.hard_threshold_pct, &mut checks, &mut order);
        }

        let global_fixed = limiter_core::ThrottleConfig::fixed_global();
        if let Some(p) = global_policy.endpoints.get(&identity.endpoint).copied() {
            push(Scope::GlobalEndpoint, p, global_fixed.soft_threshold_pct, global_fixed.hard_threshold_pct, &mut checks, &mut order);
        }
        push(Scope::GlobalSystem, global_policy.system, global_fixed.soft_threshold_pct, global_fixed.hard_threshold_pct, &mut checks, &mut order);

        checks
    }

    fn aggregate(&self, identity: &RequestIdentity, checks: Vec<PendingCheck>, results_by_key: &HashMap<String, limiter_core::bucket::EvalResult>) -> Decision {
        let now_s = now_epoch_s();
        let mut inputs = Vec::with_capacity(checks.len());
        for check in checks {
            let Some(result) = results_by_key.get(&check.request.key) else {
                continue;
            };
            limiter_core::telemetry::record_bucket_tokens(check.scope, &identity.tenant_id, result.tokens_remaining);
            limiter_core::telemetry::record_bucket_usage_pct(check.scope, &identity.tenant_id, &identity.endpoint, result.usage_pct);

            let consumed = check.policy.burst_capacity - result.tokens_remaining;
            let retry_after = retry_after_s(consumed, check.policy.burst_capacity, check.request.hard_pct, check.policy.refill_rate_per_sec);
            let reset = reset_epoch_s(result.tokens_remaining, check.policy.burst_capacity, check.policy.refill_rate_per_sec, now_s);

            inputs.push(ScopeCheckAggregateInput {
                limit: check.policy.rpm,
                reset_epoch_s: reset,
                retry_after_s: retry_after,
                debug: ScopeCheckDebug {
                    scope: check.scope,
                    state: result.state,
                    tokens_remaining: result.tokens_remaining,
                    usage_pct: result.usage_pct,
                    order: check.order,
                },
            });
        }
        Decision::aggregate(inputs).expect("tenant_global check is always present")
    }
}

fn bucket_ttl_s(policy: &BucketPolicy) -> u64 {
    if policy.refill_rate_per_sec <= 0.0 {
        3600
    } else {
        ((policy.burst_capacity / policy.refill_rate_per_sec).ceil() as u64 + 60).max(60)
    }
}

fn override_type_label(t: OverrideType) -> &'static str {
    match t {
        OverrideType::PenaltyMultiplier => "penalty_multiplier",
        OverrideType::TemporaryBan => "temporary_ban",
        OverrideType::CustomLimit => "custom_limit",
    }
}

fn override_source_label(s: limiter_core::OverrideSource) -> &'static str {
    match s {
        limiter_core::OverrideSource::AutoDetector => "auto_detector",
        limiter_core::OverrideSource::ManualOperator => "manual_operator",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use limiter_core::{CircuitBreakerConfig, EndpointMap, ThrottleConfig};
    use limiter_redis::InMemoryBucketEngine;
    use std::sync::Mutex as StdMutex;

    struct StubPolicies {
        tenant: Option<TenantPolicy>,
        global: GlobalPolicy,
    }

    #[async_trait]
    impl PolicyProvider for StubPolicies {
        async fn tenant_policy(&self, _: &str) -> Result<Option<TenantPolicy>, CoreError> {
            Ok(self.tenant.clone())
        }
        async fn global_policy(&self) -> Result<GlobalPolicy, CoreError> {
            Ok(self.global.clone())
        }
    }

    struct StubOverrides(StdMutex<Option<Override>>);

    #[async_trait]
    impl OverrideProvider for StubOverrides {
        async fn active_override(&self, _: &str, _: Option<&str>, _: Option<&str>) -> Option<Override> {
            self.0.lock().unwrap().clone()
        }
    }

    fn identity() -> RequestIdentity {
        RequestIdentity {
            tenant_id: "acme".into(),
            user_id: "alice".into(),
            endpoint: "/api/search".into(),
            ip_address: None,
        }
    }

    fn tenant_policy() -> TenantPolicy {
        TenantPolicy {
            tenant_id: "acme".into(),
            user_global: Some(BucketPolicy::new(1000.0, 2000.0, None).unwrap()),
            tenant_global: BucketPolicy::new(10_000.0, 20_000.0, None).unwrap(),
            user_endpoints: EndpointMap::new(),
            tenant_endpoints: EndpointMap::new(),
            throttle_config: ThrottleConfig::new(110.0, Some(100.0)).unwrap(),
        }
    }

    fn build_decisioner(tenant: Option<TenantPolicy>) -> Decisioner<InMemoryBucketEngine, StubPolicies, StubOverrides> {
        Decisioner::new(
            Arc::new(InMemoryBucketEngine::new()),
            Arc::new(StubPolicies {
                tenant,
                global: GlobalPolicy::permissive_default(),
            }),
            Arc::new(StubOverrides(StdMutex::new(None))),
            Arc::new(CircuitBreaker::new("bucket_store", CircuitBreakerConfig::default())),
            Arc::new(FallbackLimiter::new(60)),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn happy_path_allows_at_user_global_scope() {
        let decisioner = build_decisioner(Some(tenant_policy()));
        let outcome = decisioner.decide(&identity()).await.unwrap();
        match outcome {
            DecisionOutcome::Primary(decision) => {
                assert!(decision.allowed);
                assert_eq!(decision.scope, Scope::UserGlobal);
                assert_eq!(decision.state, BucketStateLevel::Normal);
            }
            _ => panic!("expected primary decision"),
        }
    }

    #[tokio::test]
    async fn missing_tenant_policy_fails_with_policy_not_found() {
        let decisioner = build_decisioner(None);
        let err = decisioner.decide(&identity()).await.unwrap_err();
        assert!(matches!(err, CoreError::PolicyNotFound));
    }

    #[tokio::test]
    async fn temporary_ban_short_circuits_to_hard_deny() {
        let decisioner = Decisioner::new(
            Arc::new(InMemoryBucketEngine::new()),
            Arc::new(StubPolicies {
                tenant: Some(tenant_policy()),
                global: GlobalPolicy::permissive_default(),
            }),
            Arc::new(StubOverrides(StdMutex::new(Some(Override {
                tenant_id: "acme".into(),
                user_id: None,
                endpoint: None,
                override_type: OverrideType::TemporaryBan,
                penalty_multiplier: None,
                custom_rate: None,
                custom_burst: None,
                reason: "abuse".into(),
                source: limiter_core::OverrideSource::ManualOperator,
                created_at: 0,
                expires_at: now_epoch_s() + 60,
            })))),
            Arc::new(CircuitBreaker::new("bucket_store", CircuitBreakerConfig::default())),
            Arc::new(FallbackLimiter::new(60)),
            Duration::from_millis(100),
        );
        let outcome = decisioner.decide(&identity()).await.unwrap();
        match outcome {
            DecisionOutcome::Primary(decision) => {
                assert!(!decision.allowed);
                assert_eq!(decision.scope, Scope::TenantGlobal);
                assert!(decision.retry_after_s.unwrap() > 0);
            }
            _ => panic!("expected primary decision"),
        }
    }

    #[tokio::test]
    async fn penalty_multiplier_scales_effective_limit() {
        let decisioner = Decisioner::new(
            Arc::new(InMemoryBucketEngine::new()),
            Arc::new(StubPolicies {
                tenant: Some(tenant_policy()),
                global: GlobalPolicy::permissive_default(),
            }),
            Arc::new(StubOverrides(StdMutex::new(Some(Override {
                tenant_id: "acme".into(),
                user_id: None,
                endpoint: None,
                override_type: OverrideType::PenaltyMultiplier,
                penalty_multiplier: Some(0.1),
                custom_rate: None,
                custom_burst: None,
                reason: "abuse".into(),
                source: limiter_core::OverrideSource::AutoDetector,
                created_at: 0,
                expires_at: now_epoch_s() + 300,
            })))),
            Arc::new(CircuitBreaker::new("bucket_store", CircuitBreakerConfig::default())),
            Arc::new(FallbackLimiter::new(60)),
            Duration::from_millis(100),
        );
        let outcome = decisioner.decide(&identity()).await.unwrap();
        match outcome {
            DecisionOutcome::Primary(decision) => {
                // user_global rpm 1000 scaled by 0.1 = 100, more restrictive
                // than tenant_global's scaled 1000, so user_global still wins
                // on order but the scaled limit must reflect the multiplier.
                assert_eq!(decision.scope, Scope::UserGlobal);
                assert_eq!(decision.limit, 100.0);
            }
            _ => panic!("expected primary decision"),
        }
    }
}
