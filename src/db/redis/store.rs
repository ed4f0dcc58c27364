use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis::Client;

use crate::db::store::{KeyValueStore, StoreResult};

/// Creates a Redis client for durable storage
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Key-value store backed by Redis
///
/// Holds one multiplexed connection that reconnects on its own after a drop.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_client: Client) -> StoreResult<Self> {
        let conn = ConnectionManager::new(redis_client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(|e| {
            tracing::warn!(error = %e, key = %key, "Redis get failed");
            e
        })?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await.map_err(|e| {
            tracing::warn!(error = %e, key = %key, "Redis set failed");
            e
        })?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        keys.sort();
        Ok(keys)
    }
}

// Round-trip tests need a live server: REDIS_URL=redis://localhost:6379 cargo test -- --ignored
