//! Abuse detector: a periodic job that queries aggregated
//! telemetry for per-tenant throttle ratios and installs time-bounded
//! penalty overrides on tenants that cross the configured threshold.
//!
//! `TelemetryQuery` is a small seam trait: the production
//! implementation would make an HTTP call against a Prometheus-style
//! endpoint (out of scope for this crate), while an in-memory test
//! double can share the same interface. One-in-flight enforcement
//! uses a `tokio::sync::Mutex<()>::try_lock` against the background
//! loop's own `tokio::sync` dependency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use limiter_core::{CoreError, Override, OverrideSource, OverrideType};
use limiter_redis::{OverrideCache, OverrideStore};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::PenaltyType;

/// Queries aggregated telemetry for the throttled/total ratio per
/// tenant over a trailing window.
#[async_trait]
pub trait TelemetryQuery: Send + Sync {
    /// Returns `(tenant_id, ratio)` pairs for every tenant telemetry
    /// has data for over the last `window`.
    async fn throttle_ratios(&self, window: Duration) -> Result<HashMap<String, f64>, CoreError>;
}

/// Severity classification of a flagged tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    fn label(&self) -> &'static str {
        match self {
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    fn classify(ratio: f64) -> Self {
        if ratio > 0.8 {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AbuseDetectorConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    pub throttle_threshold: f64,
    pub window: Duration,
    pub penalty_duration: Duration,
    pub penalty_type: PenaltyType,
    pub penalty_multiplier: f64,
}

fn now_epoch_s() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Periodic abuse-detection loop. Generic over the
/// telemetry backend and the override store so tests substitute
/// in-memory doubles for both.
pub struct AbuseDetector<T: TelemetryQuery, S: OverrideStore + 'static> {
    telemetry: Arc<T>,
    overrides: Arc<OverrideCache<S>>,
    config: AbuseDetectorConfig,
    kill_switch: Arc<AtomicBool>,
    in_flight: Arc<AsyncMutex<()>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: TelemetryQuery + 'static, S: OverrideStore + 'static> AbuseDetector<T, S> {
    pub fn new(telemetry: Arc<T>, overrides: Arc<OverrideCache<S>>, config: AbuseDetectorConfig) -> Arc<Self> {
        Arc::new(Self {
            telemetry,
            overrides,
            config,
            kill_switch: Arc::new(AtomicBool::new(!config.enabled)),
            in_flight: Arc::new(AsyncMutex::new(())),
            task: std::sync::Mutex::new(None),
        })
    }

    /// Global kill switch: disables
    /// future runs without tearing down the timer.
    pub fn disable(&self) {
        self.kill_switch.store(true, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.kill_switch.store(false, Ordering::SeqCst);
    }

    /// Spawns the periodic loop. Overlapping ticks are dropped via
    /// `in_flight.try_lock()` so only one detection pass runs at a
    /// time.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.check_interval);
            loop {
                ticker.tick().await;
                if this.kill_switch.load(Ordering::SeqCst) {
                    continue;
                }
                let Ok(_guard) = this.in_flight.try_lock() else {
                    tracing::debug!("abuse detector tick skipped: previous run still in flight");
                    continue;
                };
                this.run_once().await;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// One detection pass: query ratios, flag tenants over threshold,
    /// install overrides for those without one already active.
    pub async fn run_once(&self) {
        let ratios = match self.telemetry.throttle_ratios(self.config.window).await {
            Ok(ratios) => ratios,
            Err(e) => {
                tracing::warn!(error = %e, "abuse detector telemetry query failed");
                limiter_core::telemetry::record_abuse_job_run("error");
                return;
            }
        };

        for (tenant_id, ratio) in ratios {
            if ratio <= self.config.throttle_threshold {
                continue;
            }
            if self.overrides.get_active(&tenant_id, None, None).await.is_some() {
                // Precedence: any existing match on tenant_id, including
                // a more specific user/endpoint override, counts — don't
                // stack penalties.
                continue;
            }

            let severity = Severity::classify(ratio);
            let override_ = self.build_override(&tenant_id, ratio);
            match self.overrides.create(&override_).await {
                Ok(_) => {
                    limiter_core::telemetry::record_abuse_flag(&tenant_id, severity.label());
                    limiter_core::telemetry::record_override_applied(
                        override_type_label(override_.override_type),
                        "auto_detector",
                    );
                }
                Err(e) => {
                    tracing::warn!(tenant_id, error = %e, "abuse detector failed to install override");
                }
            }
        }

        limiter_core::telemetry::record_abuse_job_run("ok");
    }

    fn build_override(&self, tenant_id: &str, ratio: f64) -> Override {
        let now = now_epoch_s();
        let window_minutes = self.config.window.as_secs() / 60;
        let reason = format!(
            "auto-detected abuse: throttle ratio {:.2} over last {}m",
            ratio, window_minutes
        );
        let (override_type, penalty_multiplier, custom_rate, custom_burst) = match self.config.penalty_type {
            PenaltyType::Adaptive => (OverrideType::PenaltyMultiplier, Some(self.config.penalty_multiplier), None, None),
            PenaltyType::Fixed => (OverrideType::CustomLimit, None, Some(1.0), Some(1.0)),
        };
        Override {
            tenant_id: tenant_id.to_string(),
            user_id: None,
            endpoint: None,
            override_type,
            penalty_multiplier,
            custom_rate,
            custom_burst,
            reason,
            source: OverrideSource::AutoDetector,
            created_at: now,
            expires_at: now + self.config.penalty_duration.as_secs() as i64,
        }
    }
}

fn override_type_label(t: OverrideType) -> &'static str {
    match t {
        OverrideType::PenaltyMultiplier => "penalty_multiplier",
        OverrideType::TemporaryBan => "temporary_ban",
        OverrideType::CustomLimit => "custom_limit",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use limiter_redis::StoreError;
    use std::sync::Mutex as StdMutex;

    struct StubTelemetry(HashMap<String, f64>);

    #[async_trait]
    impl TelemetryQuery for StubTelemetry {
        async fn throttle_ratios(&self, _window: Duration) -> Result<HashMap<String, f64>, CoreError> {
            Ok(self.0.clone())
        }
    }

    struct StubStore {
        created: StdMutex<Vec<Override>>,
        existing: Vec<Override>,
    }

    #[async_trait]
    impl OverrideStore for StubStore {
        async fn create(&self, override_: &Override) -> Result<String, StoreError> {
            self.created.lock().unwrap().push(override_.clone());
            Ok("id".to_string())
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_active(&self, tenant_id: &str) -> Result<Vec<Override>, StoreError> {
            Ok(self.existing.iter().filter(|o| o.tenant_id == tenant_id).cloned().collect())
        }
    }

    fn config() -> AbuseDetectorConfig {
        AbuseDetectorConfig {
            enabled: true,
            check_interval: Duration::from_secs(60),
            throttle_threshold: 0.8,
            window: Duration::from_secs(300),
            penalty_duration: Duration::from_secs(300),
            penalty_type: PenaltyType::Adaptive,
            penalty_multiplier: 0.1,
        }
    }

    #[tokio::test]
    async fn flags_tenant_over_threshold_and_creates_override() {
        let store = Arc::new(StubStore {
            created: StdMutex::new(vec![]),
            existing: vec![],
        });
        let overrides = Arc::new(OverrideCache::new(store.clone(), Default::default()));
        let telemetry = Arc::new(StubTelemetry(HashMap::from([("acme".to_string(), 0.95)])));
        let detector = AbuseDetector::new(telemetry, overrides, config());
        detector.run_once().await;
        let created = store.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].tenant_id, "acme");
        assert_eq!(created[0].override_type, OverrideType::PenaltyMultiplier);
    }

    #[tokio::test]
    async fn skips_tenant_with_existing_override() {
        let existing = Override {
            tenant_id: "acme".into(),
            user_id: None,
            endpoint: None,
            override_type: OverrideType::TemporaryBan,
            penalty_multiplier: None,
            custom_rate: None,
            custom_burst: None,
            reason: "manual".into(),
            source: OverrideSource::ManualOperator,
            created_at: now_epoch_s(),
            expires_at: now_epoch_s() + 3600,
        };
        let store = Arc::new(StubStore {
            created: StdMutex::new(vec![]),
            existing: vec![existing],
        });
        let overrides = Arc::new(OverrideCache::new(store.clone(), Default::default()));
        let telemetry = Arc::new(StubTelemetry(HashMap::from([("acme".to_string(), 0.95)])));
        let detector = AbuseDetector::new(telemetry, overrides, config());
        detector.run_once().await;
        assert!(store.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ratio_at_or_below_threshold_is_ignored() {
        let store = Arc::new(StubStore {
            created: StdMutex::new(vec![]),
            existing: vec![],
        });
        let overrides = Arc::new(OverrideCache::new(store.clone(), Default::default()));
        let telemetry = Arc::new(StubTelemetry(HashMap::from([("acme".to_string(), 0.5)])));
        let detector = AbuseDetector::new(telemetry, overrides, config());
        detector.run_once().await;
        assert!(store.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fixed_penalty_type_creates_custom_limit() {
        let store = Arc::new(StubStore {
            created: StdMutex::new(vec![]),
            existing: vec![],
        });
        let overrides = Arc::new(OverrideCache::new(store.clone(), Default::default()));
        let telemetry = Arc::new(StubTelemetry(HashMap::from([("acme".to_string(), 0.95)])));
        let mut cfg = config();
        cfg.penalty_type = PenaltyType::Fixed;
        let detector = AbuseDetector::new(telemetry, overrides, cfg);
        detector.run_once().await;
        let created = store.created.lock().unwrap();
        assert_eq!(created[0].override_type, OverrideType::CustomLimit);
    }

    #[test]
    fn severity_classification_matches_spec_boundary() {
        assert_eq!(Severity::classify(0.81), Severity::High);
        assert_eq!(Severity::classify(0.8), Severity::Medium);
    }
}
