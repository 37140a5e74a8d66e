//! Process-local fallback limiter used when the shared store is
//! unreachable.
//!
//! A `dashmap::DashMap<String, _>` of per-tenant sliding windows, each
//! window guarded by its own `parking_lot::Mutex` so the sweep only
//! needs a coarse lock over the map itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::bucket::BucketStateLevel;

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDecision {
    pub allowed: bool,
    pub state: BucketStateLevel,
    pub limit: f64,
    pub remaining: f64,
    pub reset_epoch_s: i64,
    pub retry_after_s: Option<i64>,
}

struct Window {
    timestamps: VecDeque<Instant>,
    last_activity: Instant,
}

impl Window {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            timestamps: VecDeque::new(),
            last_activity: now,
        }
    }

    fn evict_older_than(&mut self, horizon: Instant) {
        while let Some(front) = self.timestamps.front() {
            if *front < horizon {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-tenant sliding-window counter over a 60s window.
pub struct FallbackLimiter {
    rpm: u32,
    window: Duration,
    windows: DashMap<String, Mutex<Window>>,
}

impl FallbackLimiter {
    pub fn new(rpm: u32) -> Self {
        Self {
            rpm,
            window: Duration::from_secs(60),
            windows: DashMap::new(),
        }
    }

    /// Checks and (if allowed) records one request for `tenant_id`.
    pub fn check(&self, tenant_id: &str, now_epoch_s: i64) -> FallbackDecision {
        let now = Instant::now();
        let entry = self
            .windows
            .entry(tenant_id.to_string())
            .or_insert_with(|| Mutex::new(Window::new()));
        let mut window = entry.lock();
        window.last_activity = now;
        window.evict_older_than(now - self.window);

        let count = window.timestamps.len() as u32;
        let usage_pct = count as f64 / self.rpm as f64 * 100.0;
        let state = if usage_pct >= 110.0 {
            BucketStateLevel::Hard
        } else if usage_pct >= 100.0 {
            BucketStateLevel::Soft
        } else {
            BucketStateLevel::Normal
        };
        let allowed = count < self.rpm;

        let retry_after_s = if !allowed {
            let oldest = window.timestamps.front().copied().unwrap_or(now);
            let age = now.duration_since(oldest);
            let remaining_window = self.window.saturating_sub(age);
            Some(remaining_window.as_secs_f64().ceil() as i64)
        } else {
            window.timestamps.push_back(now);
            None
        };

        FallbackDecision {
            allowed,
            state,
            limit: self.rpm as f64,
            remaining: self.rpm.saturating_sub(count) as f64,
            reset_epoch_s: now_epoch_s + self.window.as_secs() as i64,
            retry_after_s,
        }
    }

    /// Periodic sweep, run every 5 min: evicts tenants idle longer
    /// than `2 * window`.
    pub fn sweep_idle(&self) {
        let idle_horizon = Instant::now() - self.window * 2;
        self.windows.retain(|_, window| window.lock().last_activity >= idle_horizon);
    }

    pub fn tracked_tenants(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_rpm_then_denies() {
        let limiter = FallbackLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.check("acme", 0).allowed);
        }
        let decision = limiter.check("acme", 0);
        assert!(!decision.allowed);
        assert!(decision.retry_after_s.unwrap() > 0);
    }

    #[test]
    fn tenants_are_independent() {
        let limiter = FallbackLimiter::new(1);
        assert!(limiter.check("acme", 0).allowed);
        assert!(limiter.check("other", 0).allowed);
    }

    #[test]
    fn sweep_evicts_idle_tenants() {
        let limiter = FallbackLimiter::new(10);
        limiter.check("acme", 0);
        assert_eq!(limiter.tracked_tenants(), 1);
        // Can't fast-forward Instant in a unit test; verify sweep is a
        // no-op for a freshly active tenant instead.
        limiter.sweep_idle();
        assert_eq!(limiter.tracked_tenants(), 1);
    }
}
