use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display};

/// Kind of media a title belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Series,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "series",
        }
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    InProgress,
    Abandoned,
}

/// A single entry of the user's viewing history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchHistoryItem {
    pub title: String,
    pub year: Option<i32>,
    pub kind: MediaKind,
    /// User or community rating on a 0-10 scale
    pub rating: Option<f32>,
    pub genres: Vec<String>,
    pub status: CompletionStatus,
    pub watched_at: DateTime<Utc>,
}

/// Aggregate view of the user's local media library
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryStatistics {
    pub item_count: usize,
    pub genre_distribution: BTreeMap<String, usize>,
    pub average_rating: Option<f32>,
    pub dominant_quality: Option<String>,
    pub storage_used_bytes: u64,
    pub storage_available_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredLength {
    Short,
    Medium,
    Long,
    #[default]
    Any,
}

impl PreferredLength {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferredLength::Short => "short",
            PreferredLength::Medium => "medium",
            PreferredLength::Long => "long",
            PreferredLength::Any => "any",
        }
    }
}

/// Preferences the user stated explicitly in settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub favorite_genres: Vec<String>,
    pub disliked_genres: Vec<String>,
    pub preferred_length: PreferredLength,
    /// Highest allowed content rating, e.g. "PG-13"
    pub content_rating_ceiling: Option<String>,
    pub language: String,
    /// Genres never recommended
    #[serde(default)]
    pub excluded_genres: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            favorite_genres: Vec::new(),
            disliked_genres: Vec::new(),
            preferred_length: PreferredLength::Any,
            content_rating_ceiling: None,
            language: "en".to_string(),
            excluded_genres: Vec::new(),
        }
    }
}

/// Acceptance rate learned for one recommendation factor (e.g. "genre:drama")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackPattern {
    pub factor: String,
    pub acceptance_rate: f64,
    pub sample_size: u32,
    pub confidence: f64,
}

/// Immutable snapshot of everything the engine knows about a user.
///
/// Rebuilt on every orchestration call; only its fingerprint is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    /// Most recent first
    pub watch_history: Vec<WatchHistoryItem>,
    pub library: LibraryStatistics,
    pub preferences: Preferences,
    pub feedback_patterns: Vec<FeedbackPattern>,
}

impl UserContext {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            watch_history: Vec::new(),
            library: LibraryStatistics::default(),
            preferences: Preferences::default(),
            feedback_patterns: Vec::new(),
        }
    }
}
