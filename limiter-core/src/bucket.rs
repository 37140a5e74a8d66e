//! The atomic token-bucket primitive as a pure Rust function, plus the
//! scope/key/reset-epoch/retry-after math it shares with the
//! decisioner's scope aggregation.
//!
//! This module has no I/O. It is the executable reference the Redis
//! Lua script in `limiter-redis` is written against, and it backs the
//! in-memory bucket engine used by tests and the fallback limiter.

use serde::{Deserialize, Serialize};

/// Server-side bucket state: `(tokens, last_refill_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

impl BucketState {
    pub fn full(capacity: f64, now_ms: i64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }
}

/// Usage classification; ordered so `hard > soft > normal` holds under
/// the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BucketStateLevel {
    Normal = 0,
    Soft = 1,
    Hard = 2,
}

/// Result of one atomic evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub allowed: bool,
    pub state: BucketStateLevel,
    pub tokens_remaining: f64,
    pub usage_pct: f64,
}

/// Parameters to one atomic evaluation, matching the positional
/// `ARGV` order of the Lua wire contract field for field: capacity,
/// refill_rate_per_sec, now_ms, soft_pct, hard_pct.
#[derive(Debug, Clone, Copy)]
pub struct EvalParams {
    pub capacity: f64,
    pub refill_rate_per_sec: f64,
    pub now_ms: i64,
    pub soft_pct: f64,
    pub hard_pct: f64,
}

/// Runs the refill → classify → consume → overshoot-guard algorithm
/// against `state`, returning the new state to persist (only
/// meaningful when `allowed`) alongside the evaluation result.
///
/// `state` is `None` on first access, lazily initialised to full
/// capacity (step 1).
pub fn atomic_eval(state: Option<BucketState>, params: EvalParams) -> (EvalResult, BucketState) {
    let EvalParams {
        capacity,
        refill_rate_per_sec,
        now_ms,
        soft_pct,
        hard_pct,
    } = params;

    let mut state = state.unwrap_or(BucketState::full(capacity, now_ms));

    let elapsed_s = ((now_ms - state.last_refill_ms).max(0) as f64) / 1000.0;
    state.tokens = (state.tokens + elapsed_s * refill_rate_per_sec).min(capacity);
    state.last_refill_ms = now_ms;

    let usage = (capacity - state.tokens) / capacity * 100.0;
    let mut level = classify(usage, soft_pct, hard_pct);
    let mut allowed = level != BucketStateLevel::Hard;

    if allowed {
        let tentative_tokens = state.tokens - 1.0;
        let usage_after = (capacity - tentative_tokens) / capacity * 100.0;
        if usage_after >= hard_pct {
            // Post-consumption overshoot guard: refund the token, deny,
            // and report hard regardless of the pre-consumption level.
            level = BucketStateLevel::Hard;
            allowed = false;
        } else {
            state.tokens = tentative_tokens;
        }
    }

    let result = EvalResult {
        allowed,
        state: level,
        tokens_remaining: state.tokens.floor(),
        usage_pct: usage.floor(),
    };

    (result, state)
}

fn classify(usage_pct: f64, soft_pct: f64, hard_pct: f64) -> BucketStateLevel {
    if usage_pct >= hard_pct {
        BucketStateLevel::Hard
    } else if usage_pct >= soft_pct {
        BucketStateLevel::Soft
    } else {
        BucketStateLevel::Normal
    }
}

/// Reset-epoch seconds: the earliest instant tokens reach capacity
/// assuming no further consumption, rounded up to seconds.
pub fn reset_epoch_s(tokens: f64, capacity: f64, refill_rate_per_sec: f64, now_s: i64) -> i64 {
    if tokens >= capacity || refill_rate_per_sec <= 0.0 {
        return now_s;
    }
    let seconds_to_full = (capacity - tokens) / refill_rate_per_sec;
    now_s + seconds_to_full.ceil() as i64
}

/// Retry-after seconds for a hard-throttle decision:
/// `ceil((consumed - max_allowed_at_hard) / refill_rate_per_sec)`,
/// zero once already below threshold.
pub fn retry_after_s(consumed: f64, capacity: f64, hard_pct: f64, refill_rate_per_sec: f64) -> i64 {
    if refill_rate_per_sec <= 0.0 {
        return 0;
    }
    let max_allowed_at_hard = capacity * hard_pct / 100.0;
    let over = consumed - max_allowed_at_hard;
    if over <= 0.0 {
        0
    } else {
        (over / refill_rate_per_sec).ceil() as i64
    }
}

/// The six hierarchical decision scopes, most-local to most-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    UserGlobal,
    UserEndpoint,
    TenantGlobal,
    TenantEndpoint,
    GlobalEndpoint,
    GlobalSystem,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::UserGlobal => "user_global",
            Scope::UserEndpoint => "user_endpoint",
            Scope::TenantGlobal => "tenant_global",
            Scope::TenantEndpoint => "tenant_endpoint",
            Scope::GlobalEndpoint => "global_endpoint",
            Scope::GlobalSystem => "global_system",
        }
    }

    /// Whether this scope's key carries the `{tenant:...}` hash tag
    /// (tenant-scoped) or is routed individually (global scopes).
    pub fn is_tenant_scoped(&self) -> bool {
        !matches!(self, Scope::GlobalEndpoint | Scope::GlobalSystem)
    }
}

/// Builds the authoritative bucket key for a scope from its template.
/// `endpoint` must already be normalised.
pub fn scope_key(scope: Scope, tenant_id: &str, user_id: &str, endpoint: &str) -> String {
    match scope {
        Scope::UserGlobal => format!("{{tenant:{tenant_id}}}:user:{user_id}:bucket"),
        Scope::UserEndpoint => format!("{{tenant:{tenant_id}}}:user:{user_id}:endpoint:{endpoint}:bucket"),
        Scope::TenantGlobal => format!("{{tenant:{tenant_id}}}:bucket"),
        Scope::TenantEndpoint => format!("{{tenant:{tenant_id}}}:endpoint:{endpoint}:bucket"),
        Scope::GlobalEndpoint => format!("global:endpoint:{endpoint}:bucket"),
        Scope::GlobalSystem => "global:bucket".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_access_initialises_full_and_allows() {
        let params = EvalParams {
            capacity: 10.0,
            refill_rate_per_sec: 1.0,
            now_ms: 0,
            soft_pct: 100.0,
            hard_pct: 110.0,
        };
        let (result, state) = atomic_eval(None, params);
        assert!(result.allowed);
        assert_eq!(result.state, BucketStateLevel::Normal);
        assert_eq!(state.tokens, 9.0);
    }

    #[test]
    fn exhausting_capacity_denies_at_hard() {
        let params = EvalParams {
            capacity: 2.0,
            refill_rate_per_sec: 0.0,
            now_ms: 0,
            soft_pct: 100.0,
            hard_pct: 100.0,
        };
        let (r1, s1) = atomic_eval(None, params);
        assert!(r1.allowed);
        let (r2, _) = atomic_eval(Some(s1), EvalParams { now_ms: 0, ..params });
        assert!(!r2.allowed);
        assert_eq!(r2.state, BucketStateLevel::Hard);
    }

    #[test]
    fn overshoot_guard_refunds_token_and_denies() {
        // capacity 1, any consumption crosses hard=100 post-consumption.
        let params = EvalParams {
            capacity: 1.0,
            refill_rate_per_sec: 0.0,
            now_ms: 0,
            soft_pct: 50.0,
            hard_pct: 100.0,
        };
        let (result, state) = atomic_eval(None, params);
        // usage before consumption is 0% (normal), but consuming the
        // single token pushes usage_after to 100% >= hard_pct.
        assert!(!result.allowed);
        assert_eq!(result.state, BucketStateLevel::Hard);
        // token was refunded: full capacity preserved.
        assert_eq!(state.tokens, 1.0);
    }

    #[test]
    fn refill_restores_availability_after_hard() {
        let params = EvalParams {
            capacity: 2.0,
            refill_rate_per_sec: 2.0,
            now_ms: 0,
            soft_pct: 100.0,
            hard_pct: 100.0,
        };
        let (_, s1) = atomic_eval(None, params);
        let (r2, s2) = atomic_eval(Some(s1), EvalParams { now_ms: 0, ..params });
        assert!(!r2.allowed);
        let (r3, _) = atomic_eval(Some(s2), EvalParams { now_ms: 1000, ..params });
        assert!(r3.allowed);
    }

    #[test]
    fn no_soft_zone_never_reports_soft() {
        let params = EvalParams {
            capacity: 100.0,
            refill_rate_per_sec: 0.0,
            now_ms: 0,
            soft_pct: 100.0,
            hard_pct: 100.0,
        };
        let mut state = None;
        for _ in 0..99 {
            let (r, s) = atomic_eval(state, EvalParams { now_ms: 0, ..params });
            assert_ne!(r.state, BucketStateLevel::Soft);
            state = Some(s);
        }
    }

    #[test]
    fn reset_epoch_predicts_full_recovery() {
        let epoch = reset_epoch_s(5.0, 10.0, 1.0, 1_000);
        assert_eq!(epoch, 1_005);
    }

    #[test]
    fn retry_after_zero_below_threshold() {
        assert_eq!(retry_after_s(5.0, 10.0, 100.0, 1.0), 0);
    }

    #[test]
    fn retry_after_positive_over_threshold() {
        let secs = retry_after_s(12.0, 10.0, 100.0, 2.0);
        assert_eq!(secs, 1);
    }

    #[test]
    fn scope_key_templates_match_spec() {
        assert_eq!(
            scope_key(Scope::UserGlobal, "acme", "alice", "/api/search"),
            "{tenant:acme}:user:alice:bucket"
        );
        assert_eq!(scope_key(Scope::GlobalSystem, "acme", "alice", "/x"), "global:bucket");
    }

    #[test]
    fn at_most_bound_over_window() {
        // N calls on one bucket: allowed count <= C + floor(r*W).
        let capacity = 5.0;
        let rate = 1.0;
        let mut state: Option<BucketState> = None;
        let mut allowed_count = 0;
        let mut now = 0i64;
        for _ in 0..50 {
            let params = EvalParams {
                capacity,
                refill_rate_per_sec: rate,
                now_ms: now,
                soft_pct: 100.0,
                hard_pct: 100.0,
            };
            let (r, s) = atomic_eval(state, params);
            if r.allowed {
                allowed_count += 1;
            }
            state = Some(s);
            now += 500;
        }
        let total_wall_clock_s = 50.0 * 0.5;
        let bound = capacity + (rate * total_wall_clock_s).floor();
        assert!((allowed_count as f64) <= bound);
    }
}
