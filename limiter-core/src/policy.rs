//! Policy data model: `BucketPolicy`, `ThrottleConfig`, `TenantPolicy`,
//! `GlobalPolicy`. Read-only in the hot path; the administrative
//! write path lives outside this crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// `(rpm, rps, burst_capacity, refill_rate_per_sec)` — the semantic
/// quadruple a token bucket is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketPolicy {
    pub rpm: f64,
    pub rps: f64,
    pub burst_capacity: f64,
    pub refill_rate_per_sec: f64,
}

impl BucketPolicy {
    /// Builds a policy, deriving `refill_rate_per_sec` from `rpm` when
    /// absent, and validating `rpm`, `burst_capacity`, and the derived
    /// rate are all positive.
    pub fn new(rpm: f64, burst_capacity: f64, refill_rate_per_sec: Option<f64>) -> Result<Self, ConfigError> {
        if rpm <= 0.0 {
            return Err(ConfigError::NotPositive { field: "rpm", value: rpm });
        }
        if burst_capacity <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "burst_capacity",
                value: burst_capacity,
            });
        }
        let refill_rate_per_sec = refill_rate_per_sec.unwrap_or(rpm / 60.0);
        if refill_rate_per_sec <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "refill_rate_per_sec",
                value: refill_rate_per_sec,
            });
        }
        let min_burst = rpm / 60.0;
        if burst_capacity < min_burst {
            return Err(ConfigError::InsufficientBurst {
                burst: burst_capacity,
                min_burst,
            });
        }
        Ok(Self {
            rpm,
            rps: rpm / 60.0,
            burst_capacity,
            refill_rate_per_sec,
        })
    }

    /// Normalises a policy loaded from storage: fills a missing
    /// `refill_rate_per_sec` (e.g. `0.0`, used as storage's "absent"
    /// sentinel) as `rpm/60` before it ever reaches the cache.
    pub fn normalise(mut self) -> Self {
        if self.refill_rate_per_sec <= 0.0 {
            self.refill_rate_per_sec = self.rpm / 60.0;
        }
        self
    }

    /// Scales rpm/rps/burst/refill by `multiplier`, flooring any
    /// resulting value below one token up to `1.0` so a penalty can
    /// never collapse a bucket to zero capacity.
    pub fn scaled(&self, multiplier: f64) -> Self {
        let scale = |v: f64| (v * multiplier).max(1.0);
        Self {
            rpm: scale(self.rpm),
            rps: scale(self.rps),
            burst_capacity: scale(self.burst_capacity),
            refill_rate_per_sec: scale(self.refill_rate_per_sec),
        }
    }

    /// Builds a policy directly from a custom rate/burst pair, per the
    /// `custom_limit` override application rule.
    pub fn from_custom(rate: f64, burst: f64) -> Self {
        Self {
            rpm: rate,
            rps: rate / 60.0,
            burst_capacity: burst,
            refill_rate_per_sec: rate / 60.0,
        }
    }
}

/// Soft/hard usage-percentage thresholds for one policy scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub hard_threshold_pct: f64,
    pub soft_threshold_pct: f64,
}

impl ThrottleConfig {
    pub fn new(hard_threshold_pct: f64, soft_threshold_pct: Option<f64>) -> Result<Self, ConfigError> {
        if !(hard_threshold_pct > 0.0 && hard_threshold_pct <= 200.0) {
            return Err(ConfigError::ThresholdRange(hard_threshold_pct));
        }
        let soft_threshold_pct = match soft_threshold_pct {
            Some(soft) => {
                if !(soft > 0.0 && soft <= 200.0) {
                    return Err(ConfigError::ThresholdRange(soft));
                }
                if hard_threshold_pct <= soft {
                    return Err(ConfigError::ThresholdOrder {
                        hard: hard_threshold_pct,
                        soft,
                    });
                }
                soft
            }
            // No soft zone configured: soft == hard collapses the
            // normal/soft boundary so only normal<->hard transitions
            // are ever reported.
            None => hard_threshold_pct,
        };
        Ok(Self {
            hard_threshold_pct,
            soft_threshold_pct,
        })
    }

    /// Fixed thresholds used for the two global scopes.
    pub fn fixed_global() -> Self {
        Self {
            hard_threshold_pct: 110.0,
            soft_threshold_pct: 100.0,
        }
    }
}

/// Normalised endpoint → `BucketPolicy` map.
///
/// Whatever shape the store adapter hands back (a JSON object, a list
/// of pairs, ...), it is normalised into this single map abstraction
/// at load time and nothing downstream ever branches on the storage
/// representation.
pub type EndpointMap = HashMap<String, BucketPolicy>;

/// Per-tenant policy bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub tenant_id: String,
    pub user_global: Option<BucketPolicy>,
    pub tenant_global: BucketPolicy,
    #[serde(default)]
    pub user_endpoints: EndpointMap,
    #[serde(default)]
    pub tenant_endpoints: EndpointMap,
    pub throttle_config: ThrottleConfig,
}

impl TenantPolicy {
    /// Applies storage normalisation to every `BucketPolicy` reachable
    /// from this tenant policy (see `BucketPolicy::normalise`).
    pub fn normalise(mut self) -> Self {
        self.tenant_global = self.tenant_global.normalise();
        self.user_global = self.user_global.map(BucketPolicy::normalise);
        for policy in self.user_endpoints.values_mut() {
            *policy = policy.normalise();
        }
        for policy in self.tenant_endpoints.values_mut() {
            *policy = policy.normalise();
        }
        self
    }
}

/// System-wide singleton policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPolicy {
    pub system: BucketPolicy,
    #[serde(default)]
    pub endpoints: EndpointMap,
}

impl GlobalPolicy {
    /// A permissive, effectively non-limiting default used when no
    /// global policy is configured.
    pub fn permissive_default() -> Self {
        Self {
            system: BucketPolicy {
                rpm: 1_000_000.0,
                rps: 1_000_000.0 / 60.0,
                burst_capacity: 2_000_000.0,
                refill_rate_per_sec: 1_000_000.0 / 60.0,
            },
            endpoints: HashMap::new(),
        }
    }
}
