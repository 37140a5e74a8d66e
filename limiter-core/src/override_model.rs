//! Override data model: time-bounded penalty/ban/custom-limit
//! modifications of effective policy for a tenant (± user/endpoint).

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::BucketPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideType {
    PenaltyMultiplier,
    TemporaryBan,
    CustomLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideSource {
    AutoDetector,
    ManualOperator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub override_type: OverrideType,
    pub penalty_multiplier: Option<f64>,
    pub custom_rate: Option<f64>,
    pub custom_burst: Option<f64>,
    pub reason: String,
    pub source: OverrideSource,
    /// Unix epoch seconds.
    pub created_at: i64,
    /// Unix epoch seconds; store-enforced expiration lives on this field.
    pub expires_at: i64,
}

impl Override {
    /// Validates `expires_at > now`, that the type-specific payload is
    /// present, and `penalty_multiplier ∈ (0,1]`.
    pub fn validate(&self, now: i64) -> Result<(), ConfigError> {
        if self.tenant_id.is_empty() {
            return Err(ConfigError::EmptyTenantId);
        }
        if self.expires_at <= now {
            return Err(ConfigError::ExpiredOnCreation);
        }
        if self.override_type == OverrideType::PenaltyMultiplier {
            let m = self.penalty_multiplier.unwrap_or(0.0);
            if !(m > 0.0 && m <= 1.0) {
                return Err(ConfigError::InvalidMultiplier(m));
            }
        }
        Ok(())
    }

    /// Cache/index key shape for one (tenant, user, endpoint) lookup:
    /// `override:{tenant}:{u|none}:{e|none}`.
    pub fn cache_key(tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> String {
        format!(
            "override:{}:{}:{}",
            tenant_id,
            user_id.unwrap_or("none"),
            endpoint.unwrap_or("none")
        )
    }

    /// The four cache keys that must be invalidated on mutation of an
    /// override keyed by `(tenant, user, endpoint)`, so no
    /// less-specific cached result masks a newly created more-specific
    /// one.
    pub fn invalidation_keys(tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> [String; 4] {
        [
            Self::cache_key(tenant_id, user_id, endpoint),
            Self::cache_key(tenant_id, user_id, None),
            Self::cache_key(tenant_id, None, endpoint),
            Self::cache_key(tenant_id, None, None),
        ]
    }

    /// Precedence rank used by `get_active` (lower is more specific):
    /// user+endpoint, user-only, endpoint-only, tenant-wide.
    fn specificity_rank(&self) -> u8 {
        match (self.user_id.is_some(), self.endpoint.is_some()) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        }
    }

    /// Returns `true` if this override's shape matches the requested
    /// `(user_id, endpoint)` scope exactly.
    pub fn matches_shape(&self, user_id: Option<&str>, endpoint: Option<&str>) -> bool {
        match (self.user_id.as_deref(), self.endpoint.as_deref()) {
            (Some(u), Some(e)) => Some(u) == user_id && Some(e) == endpoint,
            (Some(u), None) => Some(u) == user_id,
            (None, Some(e)) => Some(e) == endpoint,
            (None, None) => true,
        }
    }

    /// Picks the highest-precedence override among a set of matching
    /// candidates already filtered by `expires_at > now`.
    pub fn pick_most_specific(candidates: Vec<Override>) -> Option<Override> {
        candidates
            .into_iter()
            .min_by_key(|o| o.specificity_rank())
    }

    /// Applies this override to a tenant (and, when present, user)
    /// bucket policy. Returns `None` when this is a `temporary_ban` (the caller must
    /// short-circuit rather than apply a transformed policy).
    pub fn apply_to(&self, policy: &BucketPolicy) -> Option<BucketPolicy> {
        match self.override_type {
            OverrideType::TemporaryBan => None,
            OverrideType::PenaltyMultiplier => {
                let m = self.penalty_multiplier.unwrap_or(1.0);
                Some(policy.scaled(m))
            }
            OverrideType::CustomLimit => {
                let rate = self.custom_rate.unwrap_or(policy.rpm);
                let burst = self.custom_burst.unwrap_or(policy.burst_capacity);
                Some(BucketPolicy::from_custom(rate, burst))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_override(user: Option<&str>, endpoint: Option<&str>) -> Override {
        Override {
            tenant_id: "acme".into(),
            user_id: user.map(String::from),
            endpoint: endpoint.map(String::from),
            override_type: OverrideType::TemporaryBan,
            penalty_multiplier: None,
            custom_rate: None,
            custom_burst: None,
            reason: "test".into(),
            source: OverrideSource::ManualOperator,
            created_at: 0,
            expires_at: 100,
        }
    }

    #[test]
    fn precedence_prefers_user_and_endpoint() {
        let candidates = vec![
            base_override(None, None),
            base_override(Some("alice"), None),
            base_override(None, Some("/api")),
            base_override(Some("alice"), Some("/api")),
        ];
        let winner = Override::pick_most_specific(candidates).unwrap();
        assert_eq!(winner.user_id.as_deref(), Some("alice"));
        assert_eq!(winner.endpoint.as_deref(), Some("/api"));
    }

    #[test]
    fn invalidation_keys_cover_all_four_shapes() {
        let keys = Override::invalidation_keys("acme", Some("alice"), Some("/api"));
        assert_eq!(keys[0], "override:acme:alice:/api");
        assert_eq!(keys[1], "override:acme:alice:none");
        assert_eq!(keys[2], "override:acme:none:/api");
        assert_eq!(keys[3], "override:acme:none:none");
    }

    #[test]
    fn penalty_multiplier_scales_policy() {
        let o = Override {
            override_type: OverrideType::PenaltyMultiplier,
            penalty_multiplier: Some(0.1),
            ..base_override(None, None)
        };
        let policy = BucketPolicy::new(10_000.0, 20_000.0, None).unwrap();
        let scaled = o.apply_to(&policy).unwrap();
        assert_eq!(scaled.rpm, 1000.0);
    }

    #[test]
    fn temporary_ban_yields_no_policy() {
        let o = base_override(None, None);
        let policy = BucketPolicy::new(10.0, 15.0, None).unwrap();
        assert!(o.apply_to(&policy).is_none());
    }

    #[test]
    fn validate_rejects_expired_at_creation() {
        let o = Override {
            expires_at: 50,
            ..base_override(None, None)
        };
        assert_eq!(o.validate(100).unwrap_err(), ConfigError::ExpiredOnCreation);
    }
}
