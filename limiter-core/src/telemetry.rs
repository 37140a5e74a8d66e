//! Telemetry contract: thin wrappers over the `metrics` facade pinning
//! the exact label sets this crate reports, so call sites can't drift
//! from them by typo.
//!
//! Scraping/export (Prometheus endpoint, dashboards) is out of scope;
//! this module only emits through whatever `metrics::Recorder` the
//! embedding binary installs.

use crate::bucket::Scope;

pub fn record_request(tenant_id: &str, endpoint: &str, result: &'static str, state: &'static str, mode: &'static str) {
    metrics::counter!(
        "requests_total",
        "tenant_id" => tenant_id.to_string(),
        "endpoint" => endpoint.to_string(),
        "result" => result,
        "state" => state,
        "mode" => mode
    )
    .increment(1);
}

pub fn record_check_duration(scope: Scope, millis: f64) {
    metrics::histogram!("check_duration_ms", "scope" => scope.as_str()).record(millis);
}

pub fn record_bucket_tokens(scope: Scope, tenant_id: &str, tokens: f64) {
    metrics::gauge!("bucket_tokens", "scope" => scope.as_str(), "tenant_id" => tenant_id.to_string()).set(tokens);
}

pub fn record_bucket_usage_pct(scope: Scope, tenant_id: &str, endpoint: &str, usage_pct: f64) {
    metrics::gauge!(
        "bucket_usage_pct",
        "scope" => scope.as_str(),
        "tenant_id" => tenant_id.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .set(usage_pct);
}

pub fn record_policy_cache_hit() {
    metrics::counter!("policy_cache_hits_total").increment(1);
}

pub fn record_policy_cache_miss() {
    metrics::counter!("policy_cache_misses_total").increment(1);
}

pub fn record_policy_cache_hit_ratio(ratio: f64) {
    metrics::gauge!("policy_cache_hit_ratio").set(ratio);
}

pub fn record_fallback_activation(reason: &'static str) {
    metrics::counter!("fallback_activations_total", "reason" => reason).increment(1);
}

pub fn record_override_applied(override_type: &'static str, source: &'static str) {
    metrics::counter!("override_applied_total", "type" => override_type, "source" => source).increment(1);
}

pub fn record_abuse_flag(tenant_id: &str, severity: &'static str) {
    metrics::counter!("abuse_detection_flags_total", "tenant_id" => tenant_id.to_string(), "severity" => severity)
        .increment(1);
}

pub fn record_abuse_job_run(status: &'static str) {
    metrics::counter!("abuse_detection_job_runs_total", "status" => status).increment(1);
}

pub fn record_circuit_breaker_state(resource: &'static str, value: f64) {
    metrics::gauge!("circuit_breaker_state", "resource" => resource).set(value);
}

pub fn record_circuit_breaker_transition(resource: &'static str, from: &'static str, to: &'static str) {
    metrics::counter!(
        "circuit_breaker_transitions_total",
        "resource" => resource,
        "from" => from,
        "to" => to
    )
    .increment(1);
}
