use thiserror::Error;

/// Errors raised while constructing or validating core data model values.
///
/// Per the "deep nested config objects" redesign: invalid policy/override
/// shapes are rejected at construction, never discovered later on the hot
/// path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("burst_capacity ({burst}) must be at least one second of refill ({min_burst})")]
    InsufficientBurst { burst: f64, min_burst: f64 },

    #[error("hard_threshold_pct ({hard}) must be > soft_threshold_pct ({soft})")]
    ThresholdOrder { hard: f64, soft: f64 },

    #[error("hard_threshold_pct must be in (0, 200], got {0}")]
    ThresholdRange(f64),

    #[error("penalty_multiplier must be in (0, 1], got {0}")]
    InvalidMultiplier(f64),

    #[error("override expires_at must be in the future at creation time")]
    ExpiredOnCreation,

    #[error("tenant_id must not be empty")]
    EmptyTenantId,
}

/// Errors surfaced by the hot-path decision pipeline. Each variant
/// maps to one local-handling rule applied by the caller (decisioner
/// or middleware), never to a 5xx.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("no policy resolved for tenant")]
    PolicyNotFound,

    #[error("store call exceeded deadline")]
    StoreTimeout,

    #[error("store connection unavailable: {0}")]
    StoreUnavailable(String),

    #[error("atomic primitive not resident in store")]
    ScriptMissing,

    #[error("override backend error: {0}")]
    OverrideLookupError(String),

    #[error("circuit is open for resource {0}")]
    CircuitOpen(&'static str),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether this error should engage the resilience layer (circuit
    /// breaker + fallback limiter) rather than being handled as a plain
    /// fail-open.
    pub fn engages_resilience(&self) -> bool {
        matches!(
            self,
            CoreError::StoreTimeout | CoreError::StoreUnavailable(_) | CoreError::CircuitOpen(_)
        )
    }
}
