use async_trait::async_trait;

/// Errors raised by the durable key-value store
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable string key-value store.
///
/// Values are whole-value replacements: a reader observes either the previous
/// value or the new one, never a mix.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> StoreResult<()>;

    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Lists every key starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Reads and deserializes a JSON value
pub async fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Serializes and writes a JSON value
pub async fn set_json<T: serde::Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    let json = serde_json::to_string(value)?;
    store.set(key, json).await
}
