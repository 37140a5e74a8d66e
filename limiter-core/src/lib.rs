//! Core rate-limiting algorithms and abstractions: the atomic
//! token-bucket evaluation, the policy/override/identity data model,
//! the circuit breaker, and the fallback limiter. No I/O lives here —
//! `limiter-redis` and `limiter-service` build the hot path on top of
//! these pure pieces.

pub mod bucket;
pub mod circuit_breaker;
pub mod decision;
pub mod error;
pub mod fallback;
pub mod identity;
pub mod override_model;
pub mod policy;
pub mod telemetry;

pub use bucket::{atomic_eval, reset_epoch_s, retry_after_s, BucketState, BucketStateLevel, EvalParams, EvalResult, Scope};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use decision::{Decision, ScopeCheckAggregateInput, ScopeCheckDebug};
pub use error::{ConfigError, CoreError};
pub use fallback::{FallbackDecision, FallbackLimiter};
pub use identity::{extract_identity, normalise_endpoint, BearerClaims, Claims, IdentitySources, RequestIdentity};
pub use override_model::{Override, OverrideSource, OverrideType};
pub use policy::{BucketPolicy, EndpointMap, GlobalPolicy, TenantPolicy, ThrottleConfig};
