//! Override store: time-bounded overrides indexed by
//! tenant, with store-enforced expiration.
//!
//! Persistence: one JSON document per override under
//! `override:doc:<tenant>:<id>`, `PEXPIREAT` set to `expires_at` so
//! Redis evicts the key itself — "store-enforced expiration index"
//! without introducing a second database — plus a per-tenant index
//! set `override:idx:<tenant>` of live override ids.

use async_trait::async_trait;
use limiter_core::Override;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::StoreError;

fn doc_key(tenant_id: &str, id: &str) -> String {
    format!("override:doc:{tenant_id}:{id}")
}

fn index_key(tenant_id: &str) -> String {
    format!("override:idx:{tenant_id}")
}

#[async_trait]
pub trait OverrideStore: Send + Sync {
    async fn create(&self, override_: &Override) -> Result<String, StoreError>;
    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), StoreError>;
    /// All non-expired overrides for a tenant, for `get_active` to
    /// rank in memory (this module: "one store query ... then rank in
    /// memory").
    async fn list_active(&self, tenant_id: &str) -> Result<Vec<Override>, StoreError>;
}

pub struct RedisOverrideStore {
    connection: ConnectionManager,
}

impl RedisOverrideStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl OverrideStore for RedisOverrideStore {
    async fn create(&self, override_: &Override) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(override_).map_err(|e| StoreError::Serde(e.to_string()))?;

        let key = doc_key(&override_.tenant_id, &id);
        conn.set::<_, _, ()>(&key, json)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.pexpire_at(&key, override_.expires_at * 1000)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.sadd::<_, _, ()>(index_key(&override_.tenant_id), &id)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(id)
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(doc_key(tenant_id, id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.srem::<_, _, ()>(index_key(tenant_id), id)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn list_active(&self, tenant_id: &str) -> Result<Vec<Override>, StoreError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .smembers(index_key(tenant_id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            let key = doc_key(tenant_id, &id);
            let raw: Option<String> = conn.get(&key).await.map_err(|e| StoreError::Connection(e.to_string()))?;
            match raw {
                Some(json) => {
                    result.push(serde_json::from_str(&json).map_err(|e| StoreError::Serde(e.to_string()))?);
                }
                // The document TTL'd out; the membership hasn't been
                // swept yet. Drop it from the index lazily.
                None => {
                    let _: Result<(), _> = conn.srem(index_key(tenant_id), &id).await;
                }
            }
        }
        Ok(result)
    }
}
