//! Middleware/adapter: mode semantics and response shaping.
//! Framework-agnostic by design — HTTP routing itself stays an
//! external collaborator, so this module talks only in terms of a
//! `HeaderSink` trait and an `Action` the embedding HTTP layer
//! executes.

use serde::Serialize;

use limiter_core::bucket::{BucketStateLevel, Scope};
use limiter_core::{telemetry, Decision};

use crate::config::Mode;
use crate::decisioner::DecisionOutcome;

/// Anything that can receive a response header. The embedding HTTP
/// framework implements this over its own response type; this crate
/// never constructs one itself.
pub trait HeaderSink {
    fn set_header(&mut self, name: &'static str, value: String);
}

/// What the middleware decided the caller should do with the request.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Pass the request through to the handler (shadow/logging modes,
    /// or any allowed decision).
    Continue,
    /// Reject with a 429 and the given JSON body (enforcement hard
    /// deny only).
    Reject { status: u16, body: RejectBody },
}

/// The 429 body shape, exact field names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectBody {
    pub error: String,
    pub message: String,
    pub limit: f64,
    pub remaining: f64,
    pub reset: i64,
    pub retry_after: i64,
    pub scope: String,
}

/// Applies mode semantics to a `DecisionOutcome`, writing the
/// `X-RateLimit-*` response headers onto `sink`, recording the
/// `requests_total{tenant_id, endpoint, result, state, mode}` counter,
/// and returning the `Action` the caller must take.
///
/// On `CoreError` (the decisioner raised rather than returning an
/// outcome), use [`apply_error`] instead — middleware never produces a
/// 5xx from rate-limiter internals.
pub fn apply(outcome: &DecisionOutcome, mode: Mode, tenant_id: &str, endpoint: &str, sink: &mut impl HeaderSink) -> Action {
    let state = match outcome {
        DecisionOutcome::Primary(decision) => decision.state,
        DecisionOutcome::Fallback(fallback) => fallback.state,
    };
    telemetry::record_request(tenant_id, endpoint, result_label(state), state_label(state), mode.as_str());

    match outcome {
        DecisionOutcome::Primary(decision) => apply_primary(decision, mode, sink),
        DecisionOutcome::Fallback(fallback) => apply_fallback(fallback, mode, sink),
    }
}

fn result_label(state: BucketStateLevel) -> &'static str {
    match state {
        BucketStateLevel::Normal => "allowed",
        BucketStateLevel::Soft => "throttled_soft",
        BucketStateLevel::Hard => "throttled_hard",
    }
}

fn state_label(state: BucketStateLevel) -> &'static str {
    match state {
        BucketStateLevel::Normal => "normal",
        BucketStateLevel::Soft => "soft",
        BucketStateLevel::Hard => "hard",
    }
}

fn apply_primary(decision: &Decision, mode: Mode, sink: &mut impl HeaderSink) -> Action {
    set_common_headers(
        sink,
        mode,
        decision.limit,
        decision.remaining,
        decision.reset_epoch_s,
    );

    if decision.state == BucketStateLevel::Soft && decision.allowed {
        sink.set_header("X-RateLimit-Warning", "true".to_string());
    }

    if decision.allowed {
        return Action::Continue;
    }

    hard_deny_action(
        mode,
        sink,
        decision.scope,
        decision.limit,
        decision.remaining,
        decision.reset_epoch_s,
        decision.retry_after_s.unwrap_or(0),
    )
}

fn apply_fallback(fallback: &limiter_core::FallbackDecision, mode: Mode, sink: &mut impl HeaderSink) -> Action {
    set_common_headers(sink, mode, fallback.limit, fallback.remaining, fallback.reset_epoch_s);

    if fallback.state == BucketStateLevel::Soft && fallback.allowed {
        sink.set_header("X-RateLimit-Warning", "true".to_string());
    }

    // In shadow/logging modes the fallback's own `allowed` is
    // overridden to `true`; only enforcement honours a fallback hard
    // deny.
    let forced_allow = matches!(mode, Mode::Shadow | Mode::Logging);
    if fallback.allowed || forced_allow {
        return Action::Continue;
    }

    hard_deny_action(
        mode,
        sink,
        Scope::TenantGlobal,
        fallback.limit,
        fallback.remaining,
        fallback.reset_epoch_s,
        fallback.retry_after_s.unwrap_or(0),
    )
}

fn set_common_headers(sink: &mut impl HeaderSink, mode: Mode, limit: f64, remaining: f64, reset_epoch_s: i64) {
    sink.set_header("X-RateLimit-Limit", format!("{}", limit as i64));
    sink.set_header("X-RateLimit-Remaining", format!("{}", remaining.max(0.0) as i64));
    sink.set_header("X-RateLimit-Reset", reset_epoch_s.to_string());
    sink.set_header("X-RateLimit-Mode", mode.as_str().to_string());
}

fn hard_deny_action(
    mode: Mode,
    sink: &mut impl HeaderSink,
    scope: Scope,
    limit: f64,
    remaining: f64,
    reset_epoch_s: i64,
    retry_after_s: i64,
) -> Action {
    match mode {
        Mode::Shadow => {
            sink.set_header("X-RateLimit-Shadow", "true".to_string());
            Action::Continue
        }
        Mode::Logging => {
            sink.set_header("X-RateLimit-Exceeded", "true".to_string());
            Action::Continue
        }
        Mode::Enforcement => {
            sink.set_header("Retry-After", retry_after_s.to_string());
            Action::Reject {
                status: 429,
                body: RejectBody {
                    error: "Too Many Requests".to_string(),
                    message: format!("Rate limit exceeded for {}", scope.as_str()),
                    limit,
                    remaining,
                    reset: reset_epoch_s,
                    retry_after: retry_after_s,
                    scope: scope.as_str().to_string(),
                },
            }
        }
    }
}

/// Applied when the decisioner raised a `CoreError` that isn't
/// resilience-engaging (e.g. `PolicyNotFound`, `InternalError`):
/// middleware fails open unconditionally, tagging the response so
/// operators can see the rate limiter didn't actually evaluate this
/// request.
pub fn apply_error(sink: &mut impl HeaderSink) -> Action {
    sink.set_header("X-RateLimit-Error", "true".to_string());
    Action::Continue
}
