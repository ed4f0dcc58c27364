use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MediaKind;

/// Version of the persisted cache layout. Entries written with any other
/// version are discarded on read.
pub const CACHE_SCHEMA_VERSION: &str = "2";

pub const MIN_LIMIT: usize = 3;
pub const MAX_LIMIT: usize = 10;
pub const DEFAULT_LIMIT: usize = 10;

/// Case-insensitive comparison of titles and genres, folding full Unicode case
pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Where a recommended title can be obtained
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub in_library: bool,
    pub in_download_queue: bool,
    /// Names of configured services able to fulfill the title
    pub available_services: Vec<String>,
}

/// A single content suggestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub title: String,
    pub year: Option<i32>,
    pub kind: MediaKind,
    pub genres: Vec<String>,
    pub reasoning: String,
    /// 0-100
    pub match_score: u8,
    pub is_hidden_gem: bool,
    #[serde(default)]
    pub availability: Option<Availability>,
    #[serde(default)]
    pub poster_url: Option<String>,
}

/// Last generated recommendation set for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub user_id: String,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
    pub context_fingerprint: String,
    pub schema_version: String,
}

impl CacheEntry {
    pub fn new(
        user_id: impl Into<String>,
        recommendations: Vec<Recommendation>,
        context_fingerprint: impl Into<String>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            recommendations,
            generated_at,
            context_fingerprint: context_fingerprint.into(),
            schema_version: CACHE_SCHEMA_VERSION.to_string(),
        }
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.generated_at
    }

    pub fn find(&self, recommendation_id: Uuid) -> Option<&Recommendation> {
        self.recommendations.iter().find(|r| r.id == recommendation_id)
    }
}

/// Short description of the context a response was produced from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub watch_history_count: usize,
    pub favorite_genres: Vec<String>,
    pub schema_version: String,
}

/// Response returned to the application shell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
    /// Present only when the set was served from cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<i64>,
    pub is_offline: bool,
    /// Set when cached data was served because regeneration failed
    pub is_stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSummary>,
}

/// Options accepted by `get_recommendations`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecommendationQuery {
    pub limit: Option<usize>,
    pub include_hidden_gems: bool,
    pub force_refresh: bool,
}

impl RecommendationQuery {
    /// Requested limit clamped to the supported range
    pub fn effective_limit(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(MIN_LIMIT, MAX_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_defaults_and_bounds() {
        let query = RecommendationQuery::default();
        assert_eq!(query.effective_limit(DEFAULT_LIMIT), 10);

        let query = RecommendationQuery {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(query.effective_limit(DEFAULT_LIMIT), MIN_LIMIT);

        let query = RecommendationQuery {
            limit: Some(50),
            ..Default::default()
        };
        assert_eq!(query.effective_limit(DEFAULT_LIMIT), MAX_LIMIT);
    }

    #[test]
    fn test_cache_entry_carries_current_schema_version() {
        let entry = CacheEntry::new("u1", vec![], "abc", Utc::now());
        assert_eq!(entry.schema_version, CACHE_SCHEMA_VERSION);
    }

    #[test]
    fn test_response_omits_cache_age_when_fresh() {
        let response = RecommendationResponse {
            recommendations: vec![],
            generated_at: Utc::now(),
            cache_age_ms: None,
            is_offline: false,
            is_stale: false,
            context: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("cache_age_ms").is_none());
    }
}
