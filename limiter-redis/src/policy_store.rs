//! Policy store adapter: CRUD against persistent policy documents plus
//! a change-notification stream.
//!
//! Persistence substrate is Redis: one JSON document per tenant under
//! `policy:tenant:<id>`, one singleton under `policy:global`. Change
//! notification rides Redis keyspace events; the adapter exposes an
//! observable stream of events and the cache subscribes via a channel,
//! decoupling the stream's latency from hot-path workers.

use async_trait::async_trait;
use futures_util::StreamExt;
use limiter_core::{GlobalPolicy, TenantPolicy};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::error::StoreError;

const TENANT_PREFIX: &str = "policy:tenant:";
const GLOBAL_KEY: &str = "policy:global";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct PolicyChangeEvent {
    pub tenant_id: Option<String>,
    pub kind: ChangeKind,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantPolicy>, StoreError>;
    async fn get_global(&self) -> Result<Option<GlobalPolicy>, StoreError>;
    async fn upsert_tenant(&self, policy: &TenantPolicy) -> Result<(), StoreError>;
    async fn upsert_global(&self, policy: &GlobalPolicy) -> Result<(), StoreError>;
    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), StoreError>;
    async fn list_all_tenant(&self) -> Result<Vec<String>, StoreError>;
}

pub struct RedisPolicyStore {
    connection: ConnectionManager,
    redis_url: String,
}

impl RedisPolicyStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            connection,
            redis_url: redis_url.to_string(),
        })
    }

    fn tenant_key(tenant_id: &str) -> String {
        format!("{TENANT_PREFIX}{tenant_id}")
    }

    /// Subscribes to keyspace notifications on the `policy:` prefix
    /// and forwards decoded change events into an mpsc channel, so the
    /// policy cache's background worker can consume them without
    /// sharing latency with hot-path callers of this store.
    ///
    /// Requires the Redis server to have `notify-keyspace-events`
    /// configured with at least `Kg$` (keyspace, generic, string
    /// commands); if the deployment doesn't support it, callers should
    /// fall back to TTL-only consistency, which this module explicitly
    /// allows.
    pub async fn watch_changes(&self) -> Result<mpsc::Receiver<PolicyChangeEvent>, StoreError> {
        let client = redis::Client::open(self.redis_url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        pubsub
            .psubscribe("__keyevent@0__:*")
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let event_kind: String = match msg.get_channel_name().rsplit(':').next() {
                    Some(kind) => kind.to_string(),
                    None => continue,
                };
                let key: String = match msg.get_payload() {
                    Ok(k) => k,
                    Err(_) => continue,
                };
                if !key.starts_with(TENANT_PREFIX) && key != GLOBAL_KEY {
                    continue;
                }
                let tenant_id = key.strip_prefix(TENANT_PREFIX).map(String::from);
                let kind = match event_kind.as_str() {
                    "set" => ChangeKind::Update,
                    "del" | "expired" => ChangeKind::Delete,
                    _ => continue,
                };
                if tx.send(PolicyChangeEvent { tenant_id, kind }).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl PolicyStore for RedisPolicyStore {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantPolicy>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .get(Self::tenant_key(tenant_id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str::<TenantPolicy>(&json)
                    .map_err(|e| StoreError::Serde(e.to_string()))?
                    .normalise(),
            )),
            None => Ok(None),
        }
    }

    async fn get_global(&self) -> Result<Option<GlobalPolicy>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(GLOBAL_KEY).await.map_err(|e| StoreError::Connection(e.to_string()))?;
        match raw {
            Some(json) => {
                Ok(Some(serde_json::from_str(&json).map_err(|e| StoreError::Serde(e.to_string()))?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_tenant(&self, policy: &TenantPolicy) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(policy).map_err(|e| StoreError::Serde(e.to_string()))?;
        conn.set::<_, _, ()>(Self::tenant_key(&policy.tenant_id), json)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn upsert_global(&self, policy: &GlobalPolicy) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(policy).map_err(|e| StoreError::Serde(e.to_string()))?;
        conn.set::<_, _, ()>(GLOBAL_KEY, json)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(Self::tenant_key(tenant_id))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn list_all_tenant(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let mut ids = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(format!("{TENANT_PREFIX}*"))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        while let Some(key) = iter.next_item().await {
            if let Some(id) = key.strip_prefix(TENANT_PREFIX) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}
