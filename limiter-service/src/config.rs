//! Flat typed configuration: no nested sub-configs per component, so
//! the unit of error is construction failure, not a runtime surprise
//! three layers deep.
//!
//! Loaded via the `config` crate from YAML plus environment overrides
//! (`config` + `serde_yaml`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Shadow,
    Logging,
    Enforcement,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Shadow => "shadow",
            Mode::Logging => "logging",
            Mode::Enforcement => "enforcement",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyType {
    Adaptive,
    Fixed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawAppConfig {
    pub rate_limit_mode: Mode,
    pub store_timeout_ms: u64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout_ms: u64,
    pub circuit_breaker_success_threshold: u32,
    pub fallback_rpm: u32,
    pub fallback_burst_capacity: u32,
    pub policy_cache_ttl_ms: u64,
    pub policy_cache_max_size: u64,
    pub policy_cache_refresh_interval_ms: u64,
    pub override_cache_ttl_ms: u64,
    pub override_cache_max_size: u64,
    pub abuse_enabled: bool,
    pub abuse_check_interval_ms: u64,
    pub abuse_throttle_threshold: f64,
    pub abuse_window_minutes: u64,
    pub abuse_penalty_duration_ms: u64,
    pub abuse_penalty_type: PenaltyType,
    pub abuse_penalty_multiplier: f64,
    pub telemetry_prometheus_url: Option<String>,
    pub redis_url: String,
    pub bearer_secret: Option<String>,
}

impl Default for RawAppConfig {
    fn default() -> Self {
        Self {
            rate_limit_mode: Mode::Enforcement,
            store_timeout_ms: 100,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
            circuit_breaker_success_threshold: 2,
            fallback_rpm: 60,
            fallback_burst_capacity: 10,
            policy_cache_ttl_ms: 60_000,
            policy_cache_max_size: 10_000,
            policy_cache_refresh_interval_ms: 30_000,
            override_cache_ttl_ms: 30_000,
            override_cache_max_size: 10_000,
            abuse_enabled: true,
            abuse_check_interval_ms: 60_000,
            abuse_throttle_threshold: 0.8,
            abuse_window_minutes: 5,
            abuse_penalty_duration_ms: 300_000,
            abuse_penalty_type: PenaltyType::Adaptive,
            abuse_penalty_multiplier: 0.1,
            telemetry_prometheus_url: None,
            redis_url: "redis://127.0.0.1".to_string(),
            bearer_secret: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("store_timeout_ms must be positive")]
    InvalidStoreTimeout,
    #[error("abuse_throttle_threshold must be in (0, 1]")]
    InvalidThrottleThreshold,
}

/// Validated application configuration. Construction is the unit of
/// failure: once built, every field is known-good.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: Mode,
    pub store_timeout: Duration,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub circuit_breaker_success_threshold: u32,
    pub fallback_rpm: u32,
    pub fallback_burst_capacity: u32,
    pub policy_cache_ttl: Duration,
    pub policy_cache_max_size: u64,
    pub policy_cache_refresh_interval: Duration,
    pub override_cache_ttl: Duration,
    pub override_cache_max_size: u64,
    pub abuse_enabled: bool,
    pub abuse_check_interval: Duration,
    pub abuse_throttle_threshold: f64,
    pub abuse_window: Duration,
    pub abuse_penalty_duration: Duration,
    pub abuse_penalty_type: PenaltyType,
    pub abuse_penalty_multiplier: f64,
    pub telemetry_prometheus_url: Option<String>,
    pub redis_url: String,
    pub bearer_secret: Option<String>,
}

impl TryFrom<RawAppConfig> for AppConfig {
    type Error = ConfigLoadError;

    fn try_from(raw: RawAppConfig) -> Result<Self, Self::Error> {
        if raw.store_timeout_ms == 0 {
            return Err(ConfigLoadError::InvalidStoreTimeout);
        }
        if !(raw.abuse_throttle_threshold > 0.0 && raw.abuse_throttle_threshold <= 1.0) {
            return Err(ConfigLoadError::InvalidThrottleThreshold);
        }
        Ok(Self {
            mode: raw.rate_limit_mode,
            store_timeout: Duration::from_millis(raw.store_timeout_ms),
            circuit_breaker_failure_threshold: raw.circuit_breaker_failure_threshold,
            circuit_breaker_timeout: Duration::from_millis(raw.circuit_breaker_timeout_ms),
            circuit_breaker_success_threshold: raw.circuit_breaker_success_threshold,
            fallback_rpm: raw.fallback_rpm,
            fallback_burst_capacity: raw.fallback_burst_capacity,
            policy_cache_ttl: Duration::from_millis(raw.policy_cache_ttl_ms),
            policy_cache_max_size: raw.policy_cache_max_size,
            policy_cache_refresh_interval: Duration::from_millis(raw.policy_cache_refresh_interval_ms),
            override_cache_ttl: Duration::from_millis(raw.override_cache_ttl_ms),
            override_cache_max_size: raw.override_cache_max_size,
            abuse_enabled: raw.abuse_enabled,
            abuse_check_interval: Duration::from_millis(raw.abuse_check_interval_ms),
            abuse_throttle_threshold: raw.abuse_throttle_threshold,
            abuse_window: Duration::from_secs(raw.abuse_window_minutes * 60),
            abuse_penalty_duration: Duration::from_millis(raw.abuse_penalty_duration_ms),
            abuse_penalty_type: raw.abuse_penalty_type,
            abuse_penalty_multiplier: raw.abuse_penalty_multiplier,
            telemetry_prometheus_url: raw.telemetry_prometheus_url,
            redis_url: raw.redis_url,
            bearer_secret: raw.bearer_secret,
        })
    }
}

impl AppConfig {
    /// Loads configuration from (in ascending precedence) built-in
    /// defaults, an optional YAML file, and `RATE_LIMIT_*` environment
    /// variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigLoadError> {
        let defaults = config::Config::try_from(&RawAppConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("RATE_LIMIT").separator("__"));
        let raw: RawAppConfig = builder.build()?.try_deserialize()?;
        raw.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::try_from(RawAppConfig::default()).unwrap();
        assert_eq!(config.fallback_rpm, 60);
        assert_eq!(config.mode, Mode::Enforcement);
    }

    #[test]
    fn rejects_zero_store_timeout() {
        let raw = RawAppConfig {
            store_timeout_ms: 0,
            ..RawAppConfig::default()
        };
        assert!(matches!(AppConfig::try_from(raw), Err(ConfigLoadError::InvalidStoreTimeout)));
    }
}
