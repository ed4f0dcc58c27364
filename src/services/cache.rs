use chrono::{DateTime, Duration, Utc};
use std::{fmt::Display, sync::Arc};

use crate::{
    db::{KeyValueStore, StoreResult},
    models::{CacheEntry, CACHE_SCHEMA_VERSION},
    services::settings::SettingsProvider,
};

const CACHE_PREFIX: &str = "recommendation_cache:";

/// Keys used by the recommendation cache in the durable store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn for_user(user_id: &str) -> Self {
        Self(user_id.to_string())
    }

    /// Extracts the user id back out of a stored key
    pub fn user_id_from(key: &str) -> Option<&str> {
        key.strip_prefix(CACHE_PREFIX).filter(|id| !id.is_empty())
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", CACHE_PREFIX, self.0)
    }
}

/// Per-user store of the last generated recommendation set.
///
/// Entries are validated on time, schema version and context fingerprint.
/// Writes replace the whole entry.
#[derive(Clone)]
pub struct RecommendationCache {
    store: Arc<dyn KeyValueStore>,
    settings: Arc<dyn SettingsProvider>,
}

impl RecommendationCache {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: Arc<dyn SettingsProvider>) -> Self {
        Self { store, settings }
    }

    pub fn max_age(&self) -> Duration {
        self.settings.current().cache_max_age
    }

    /// Returns the entry for a user, discarding entries from another schema version
    pub async fn get(&self, user_id: &str) -> StoreResult<Option<CacheEntry>> {
        let key = CacheKey::for_user(user_id).to_string();
        let Some(json) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_str(&json) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Unreadable cache entry, discarding");
                self.store.remove(&key).await?;
                return Ok(None);
            }
        };

        if entry.schema_version != CACHE_SCHEMA_VERSION {
            tracing::info!(
                user_id = %user_id,
                found = %entry.schema_version,
                expected = CACHE_SCHEMA_VERSION,
                "Cache schema version mismatch, discarding entry"
            );
            self.store.remove(&key).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    pub async fn set(&self, entry: &CacheEntry) -> StoreResult<()> {
        let key = CacheKey::for_user(&entry.user_id).to_string();
        let json = serde_json::to_string(entry)?;
        self.store.set(&key, json).await?;
        tracing::debug!(
            user_id = %entry.user_id,
            count = entry.recommendations.len(),
            "Cached recommendations"
        );
        Ok(())
    }

    pub async fn invalidate(&self, user_id: &str) -> StoreResult<()> {
        self.store
            .remove(&CacheKey::for_user(user_id).to_string())
            .await?;
        tracing::info!(user_id = %user_id, "Recommendation cache invalidated");
        Ok(())
    }

    pub async fn is_valid(&self, user_id: &str, fingerprint: &str) -> StoreResult<bool> {
        self.is_valid_at(user_id, fingerprint, Utc::now()).await
    }

    pub async fn is_valid_at(
        &self,
        user_id: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self
            .get(user_id)
            .await?
            .is_some_and(|entry| self.entry_is_valid(&entry, fingerprint, now)))
    }

    /// Validity of an entry already read from the store
    pub fn entry_is_valid(&self, entry: &CacheEntry, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.is_fresh(entry, now) && entry.context_fingerprint == fingerprint
    }

    /// Whether the entry is within the configured maximum age
    pub fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        entry.age_at(now) <= self.max_age()
    }

    pub async fn get_age(&self, user_id: &str) -> StoreResult<Option<Duration>> {
        let now = Utc::now();
        Ok(self.get(user_id).await?.map(|entry| entry.age_at(now)))
    }

    /// Users that currently have a cache entry
    pub async fn known_users(&self) -> StoreResult<Vec<String>> {
        let keys = self.store.list_keys(CACHE_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| CacheKey::user_id_from(key))
            .map(str::to_string)
            .collect())
    }
}
