//! Redis-backed store adapter for `limiter-core`: the bucket engine,
//! the policy store + cache, and the override store + cache.

pub mod engine;
pub mod error;
pub mod override_cache;
pub mod override_store;
pub mod policy_cache;
pub mod policy_store;

pub use engine::{hash_tag, partition_by_hash_tag, BatchEvalRequest, BucketEngine, InMemoryBucketEngine, RedisBucketEngine};
pub use error::StoreError;
pub use override_cache::{OverrideCache, OverrideCacheConfig};
pub use override_store::{OverrideStore, RedisOverrideStore};
pub use policy_cache::{PolicyCache, PolicyCacheConfig};
pub use policy_store::{ChangeKind, PolicyChangeEvent, PolicyStore, RedisPolicyStore};
