use chrono::Duration;
use parking_lot::RwLock;

use crate::models::{eq_ignore_case, PreferredLength, Preferences, DEFAULT_LIMIT};

/// User-facing recommendation settings, read-only from the engine's side
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationSettings {
    pub default_limit: usize,
    pub excluded_genres: Vec<String>,
    pub content_rating_ceiling: Option<String>,
    /// Maximum age before a cached set is considered stale
    pub cache_max_age: Duration,
    pub background_updates_enabled: bool,
    pub favorite_genres: Vec<String>,
    pub disliked_genres: Vec<String>,
    pub preferred_length: PreferredLength,
    pub language: String,
}

impl Default for RecommendationSettings {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            excluded_genres: Vec::new(),
            content_rating_ceiling: None,
            cache_max_age: Duration::hours(24),
            background_updates_enabled: true,
            favorite_genres: Vec::new(),
            disliked_genres: Vec::new(),
            preferred_length: PreferredLength::Any,
            language: "en".to_string(),
        }
    }
}

impl RecommendationSettings {
    /// Stated preferences as they enter the user context
    pub fn preferences(&self) -> Preferences {
        Preferences {
            favorite_genres: self.favorite_genres.clone(),
            disliked_genres: self.disliked_genres.clone(),
            preferred_length: self.preferred_length,
            content_rating_ceiling: self.content_rating_ceiling.clone(),
            language: self.language.clone(),
            excluded_genres: self.excluded_genres.clone(),
        }
    }

    pub fn is_excluded_genre(&self, genre: &str) -> bool {
        self.excluded_genres
            .iter()
            .any(|g| eq_ignore_case(g, genre))
    }
}

/// Source of the current settings
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> RecommendationSettings;
}

/// Settings held in memory and replaced wholesale by the application shell
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<RecommendationSettings>,
}

impl SharedSettings {
    pub fn new(settings: RecommendationSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut RecommendationSettings)) {
        let mut guard = self.inner.write();
        f(&mut guard);
    }
}

impl SettingsProvider for SharedSettings {
    fn current(&self) -> RecommendationSettings {
        self.inner.read().clone()
    }
}
