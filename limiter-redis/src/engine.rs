//! Bucket engine: loads the atomic primitive into Redis, dispatches
//! single/batch evaluations, and translates results into
//! `limiter_core` types.
//!
//! `HMGET`/`HMSET`/`EXPIRE` on a per-key hash, one `redis::Script`
//! loaded once and invoked through `invoke_async`, which itself
//! performs the EVALSHA-then-EVAL fallback on a script-cache miss.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use limiter_core::bucket::{BucketStateLevel, EvalResult};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;

use crate::error::StoreError;

/// One scope's evaluation request against the bucket engine.
#[derive(Debug, Clone)]
pub struct BatchEvalRequest {
    pub key: String,
    pub capacity: f64,
    pub refill_rate_per_sec: f64,
    pub soft_pct: f64,
    pub hard_pct: f64,
    pub ttl_s: u64,
}

#[async_trait]
pub trait BucketEngine: Send + Sync {
    async fn evaluate(&self, request: &BatchEvalRequest) -> Result<EvalResult, StoreError>;

    /// Evaluates many requests, dispatched as parallel single calls
    /// when partitioning can't collocate them. Implementors that can
    /// batch within a shared partition should override this.
    async fn evaluate_many(&self, requests: &[BatchEvalRequest]) -> Result<Vec<EvalResult>, StoreError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.evaluate(request).await?);
        }
        Ok(results)
    }
}

/// Extracts the `{tenant:...}` hash tag from a key, if present.
pub fn hash_tag(key: &str) -> Option<&str> {
    let start = key.find('{')?;
    let end = key[start..].find('}')? + start;
    Some(&key[start + 1..end])
}

/// Groups requests so that all keys sharing a hash tag land in one
/// group (eligible for a batched store call), and every untagged key
/// gets its own singleton group (dispatched as an individual call).
/// Batching must only ever group keys sharing a hash tag, since Redis
/// Cluster requires co-located keys to share one.
pub fn partition_by_hash_tag(requests: Vec<BatchEvalRequest>) -> Vec<Vec<BatchEvalRequest>> {
    let mut tagged: HashMap<String, Vec<BatchEvalRequest>> = HashMap::new();
    let mut untagged = Vec::new();
    for request in requests {
        match hash_tag(&request.key) {
            Some(tag) => tagged.entry(tag.to_string()).or_default().push(request),
            None => untagged.push(request),
        }
    }
    let mut groups: Vec<Vec<BatchEvalRequest>> = tagged.into_values().collect();
    for request in untagged {
        groups.push(vec![request]);
    }
    groups
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

/// The atomic primitive, as Lua. Positional `ARGV` order: `capacity,
/// refill_rate_per_sec, now_ms, soft_pct, hard_pct, ttl_s`.
const TAKE_TOKEN_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local soft_pct = tonumber(ARGV[4])
local hard_pct = tonumber(ARGV[5])
local ttl_s = tonumber(ARGV[6])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(bucket[1])
local last_refill_ms = tonumber(bucket[2])

if not tokens then
    tokens = capacity
    last_refill_ms = now_ms
end

local elapsed = math.max(0, now_ms - last_refill_ms) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill_rate)
last_refill_ms = now_ms

local usage = (capacity - tokens) / capacity * 100.0

local state
local allowed
if usage >= hard_pct then
    state = 2
    allowed = 0
elseif usage >= soft_pct then
    state = 1
    allowed = 1
else
    state = 0
    allowed = 1
end

if allowed == 1 then
    local tentative = tokens - 1
    local usage_after = (capacity - tentative) / capacity * 100.0
    if usage_after >= hard_pct then
        state = 2
        allowed = 0
    else
        tokens = tentative
    end
end

if allowed == 1 then
    redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', last_refill_ms)
    redis.call('EXPIRE', key, ttl_s)
end

return {allowed, state, math.floor(tokens), math.floor(usage)}
"#;

fn parse_result(raw: (i64, i64, i64, i64)) -> EvalResult {
    let (allowed, state, tokens, usage) = raw;
    let state = match state {
        0 => BucketStateLevel::Normal,
        1 => BucketStateLevel::Soft,
        _ => BucketStateLevel::Hard,
    };
    EvalResult {
        allowed: allowed == 1,
        state,
        tokens_remaining: tokens as f64,
        usage_pct: usage as f64,
    }
}

/// Redis-backed bucket engine. Loads the script once on connect and
/// reuses the cached SHA for every invocation; `redis::Script::
/// invoke_async` reloads on `NOSCRIPT` and retries exactly once,
/// handling the case where the script falls out of the server's
/// script cache.
pub struct RedisBucketEngine {
    connection: Arc<RwLock<ConnectionManager>>,
    script: Script,
}

impl RedisBucketEngine {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            connection: Arc::new(RwLock::new(connection)),
            script: Script::new(TAKE_TOKEN_SCRIPT),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.read().clone()
    }
}

#[async_trait]
impl BucketEngine for RedisBucketEngine {
    async fn evaluate(&self, request: &BatchEvalRequest) -> Result<EvalResult, StoreError> {
        let mut conn = self.connection();
        let raw: (i64, i64, i64, i64) = self
            .script
            .key(&request.key)
            .arg(request.capacity)
            .arg(request.refill_rate_per_sec)
            .arg(now_ms())
            .arg(request.soft_pct)
            .arg(request.hard_pct)
            .arg(request.ttl_s)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                if e.code() == Some("NOSCRIPT") {
                    StoreError::ScriptMissing
                } else {
                    StoreError::Script(e.to_string())
                }
            })?;
        Ok(parse_result(raw))
    }

    async fn evaluate_many(&self, requests: &[BatchEvalRequest]) -> Result<Vec<EvalResult>, StoreError> {
        // A batched Lua call would need to special-case the overshoot
        // guard per key, so the batch dispatcher instead invokes the
        // uniform single-key primitive repeatedly — concurrently,
        // since these keys share one hash-tagged partition and each
        // call is independently atomic.
        let futures = requests.iter().map(|request| self.evaluate(request));
        futures_util::future::try_join_all(futures).await
    }
}

/// In-process bucket engine for tests and integration scenarios:
/// backs every key with `limiter_core::atomic_eval` behind a
/// `dashmap`-free `RwLock<HashMap>` (single-process, no partitioning
/// concerns).
pub struct InMemoryBucketEngine {
    state: parking_lot::Mutex<HashMap<String, limiter_core::BucketState>>,
}

impl Default for InMemoryBucketEngine {
    fn default() -> Self {
        Self {
            state: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryBucketEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketEngine for InMemoryBucketEngine {
    async fn evaluate(&self, request: &BatchEvalRequest) -> Result<EvalResult, StoreError> {
        let mut state = self.state.lock();
        let current = state.get(&request.key).copied();
        let params = limiter_core::EvalParams {
            capacity: request.capacity,
            refill_rate_per_sec: request.refill_rate_per_sec,
            now_ms: now_ms(),
            soft_pct: request.soft_pct,
            hard_pct: request.hard_pct,
        };
        let (result, new_state) = limiter_core::atomic_eval(current, params);
        if result.allowed {
            state.insert(request.key.clone(), new_state);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(key: &str) -> BatchEvalRequest {
        BatchEvalRequest {
            key: key.to_string(),
            capacity: 10.0,
            refill_rate_per_sec: 1.0,
            soft_pct: 100.0,
            hard_pct: 110.0,
            ttl_s: 3600,
        }
    }

    #[tokio::test]
    async fn in_memory_engine_allows_then_denies() {
        let engine = InMemoryBucketEngine::new();
        let mut last = engine.evaluate(&req("k")).await.unwrap();
        for _ in 0..20 {
            last = engine.evaluate(&req("k")).await.unwrap();
            if !last.allowed {
                break;
            }
        }
        assert!(!last.allowed);
    }

    #[test]
    fn hash_tag_extraction() {
        assert_eq!(hash_tag("{tenant:acme}:bucket"), Some("tenant:acme"));
        assert_eq!(hash_tag("global:bucket"), None);
    }

    #[test]
    fn partition_groups_by_tag_and_isolates_untagged() {
        let requests = vec![
            req("{tenant:acme}:bucket"),
            req("{tenant:acme}:user:alice:bucket"),
            req("global:bucket"),
            req("global:endpoint:_api_x:bucket"),
        ];
        let groups = partition_by_hash_tag(requests);
        assert_eq!(groups.len(), 3);
        let tagged_group = groups.iter().find(|g| g.len() == 2).unwrap();
        assert!(tagged_group.iter().all(|r| hash_tag(&r.key) == Some("tenant:acme")));
    }

    #[tokio::test]
    #[ignore] // Requires a local Redis instance.
    async fn redis_backend_take_token_roundtrip() {
        let engine = RedisBucketEngine::connect("redis://127.0.0.1").await.unwrap();
        let request = req("{tenant:test}:redis_roundtrip:bucket");
        let result = engine.evaluate(&request).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.tokens_remaining, 9.0);
    }
}
