//! The outcome the decisioner produces for one request.

use crate::bucket::{BucketStateLevel, Scope};

/// `(allowed, state, scope, limit, remaining, reset_epoch_s, retry_after_s?)`
/// plus optional per-scope debug tuples.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub state: BucketStateLevel,
    pub scope: Scope,
    pub limit: f64,
    pub remaining: f64,
    pub reset_epoch_s: i64,
    pub retry_after_s: Option<i64>,
    pub debug: Vec<ScopeCheckDebug>,
}

/// One scope's raw evaluation result, retained for observability and
/// for aggregation tie-breaking by check order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeCheckDebug {
    pub scope: Scope,
    pub state: BucketStateLevel,
    pub tokens_remaining: f64,
    pub usage_pct: f64,
    pub order: usize,
}

impl Decision {
    /// Aggregates a set of per-scope results into one `Decision`,
    /// choosing the scope of maximum severity and breaking ties by
    /// check order.
    pub fn aggregate(checks: Vec<ScopeCheckAggregateInput>) -> Option<Decision> {
        let worst = checks
            .iter()
            .max_by(|a, b| {
                a.debug
                    .state
                    .cmp(&b.debug.state)
                    .then(b.debug.order.cmp(&a.debug.order))
            })?;

        let allowed = worst.debug.state != BucketStateLevel::Hard;
        let retry_after_s = if !allowed {
            Some(worst.retry_after_s)
        } else {
            None
        };

        Some(Decision {
            allowed,
            state: worst.debug.state,
            scope: worst.debug.scope,
            limit: worst.limit,
            remaining: worst.debug.tokens_remaining,
            reset_epoch_s: worst.reset_epoch_s,
            retry_after_s,
            debug: checks.into_iter().map(|c| c.debug).collect(),
        })
    }
}

/// One scope's contribution to aggregation.
#[derive(Debug, Clone)]
pub struct ScopeCheckAggregateInput {
    pub limit: f64,
    pub reset_epoch_s: i64,
    pub retry_after_s: i64,
    pub debug: ScopeCheckDebug,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(scope: Scope, state: BucketStateLevel, order: usize) -> ScopeCheckAggregateInput {
        ScopeCheckAggregateInput {
            limit: 1000.0,
            reset_epoch_s: 10,
            retry_after_s: 0,
            debug: ScopeCheckDebug {
                scope,
                state,
                tokens_remaining: 5.0,
                usage_pct: 10.0,
                order,
            },
        }
    }

    #[test]
    fn aggregation_picks_maximum_severity() {
        let checks = vec![
            input(Scope::UserGlobal, BucketStateLevel::Normal, 0),
            input(Scope::TenantGlobal, BucketStateLevel::Soft, 1),
            input(Scope::GlobalSystem, BucketStateLevel::Normal, 2),
        ];
        let decision = Decision::aggregate(checks).unwrap();
        assert_eq!(decision.scope, Scope::TenantGlobal);
        assert!(decision.allowed);
        assert_eq!(decision.state, BucketStateLevel::Soft);
    }

    #[test]
    fn aggregation_ties_broken_by_check_order() {
        let checks = vec![
            input(Scope::UserGlobal, BucketStateLevel::Hard, 0),
            input(Scope::TenantGlobal, BucketStateLevel::Hard, 1),
        ];
        let decision = Decision::aggregate(checks).unwrap();
        // Earlier order wins a tie: UserGlobal (order 0) beats
        // TenantGlobal (order 1).
        assert_eq!(decision.scope, Scope::UserGlobal);
        assert!(!decision.allowed);
    }
}
