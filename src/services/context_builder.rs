//! Assembles a `UserContext` from independent sources.
//!
//! Every source runs concurrently and is isolated: one failing or timing out
//! leaves the others untouched and its part of the context takes a default.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::{
    error::{EngineError, EngineResult},
    models::{FeedbackPattern, LibraryStatistics, UserContext, WatchHistoryItem},
    services::{
        learning::FeedbackLearner,
        providers::{ConnectorError, ConnectorPool, DiskSpace, LibraryItem, MediaConnectors, MediaLibrary},
        settings::SettingsProvider,
    },
};

/// Watch history entries requested per build
pub const HISTORY_LIMIT: usize = 50;

pub struct ContextBuilder {
    connectors: MediaConnectors,
    learner: Arc<dyn FeedbackLearner>,
    settings: Arc<dyn SettingsProvider>,
    source_timeout: Duration,
}

/// Outcome of one context source
enum SourceOutcome<T> {
    Loaded(T),
    /// No connector configured; the default is the real answer
    Absent,
    Failed,
}

impl<T> SourceOutcome<T> {
    fn from_result(source: &str, user_id: &str, result: Result<T, ConnectorError>) -> Self {
        match result {
            Ok(value) => SourceOutcome::Loaded(value),
            Err(ConnectorError::NotConfigured(_)) => SourceOutcome::Absent,
            Err(e) => {
                tracing::warn!(user_id = %user_id, source, error = %e, "Context source failed");
                SourceOutcome::Failed
            }
        }
    }

    fn is_failed(&self) -> bool {
        matches!(self, SourceOutcome::Failed)
    }

    fn unwrap_or_default(self) -> T
    where
        T: Default,
    {
        match self {
            SourceOutcome::Loaded(value) => value,
            SourceOutcome::Absent | SourceOutcome::Failed => T::default(),
        }
    }
}

impl ContextBuilder {
    pub fn new(
        connectors: MediaConnectors,
        learner: Arc<dyn FeedbackLearner>,
        settings: Arc<dyn SettingsProvider>,
        source_timeout: Duration,
    ) -> Self {
        Self {
            connectors,
            learner,
            settings,
            source_timeout,
        }
    }

    /// Builds the context. Fails only when both history and library sources
    /// are configured and neither produced data.
    pub async fn build(&self, user_id: &str) -> EngineResult<UserContext> {
        let (history, series, movies, disk, patterns) = tokio::join!(
            self.watch_history(user_id),
            library_items(&self.connectors.series),
            library_items(&self.connectors.movies),
            self.disk_space(),
            self.feedback_patterns(user_id),
        );

        let history = SourceOutcome::from_result("watch_history", user_id, history);
        let series = SourceOutcome::from_result("series_library", user_id, series);
        let movies = SourceOutcome::from_result("movie_library", user_id, movies);

        let library_failed = match (&series, &movies) {
            (SourceOutcome::Loaded(_), _) | (_, SourceOutcome::Loaded(_)) => false,
            _ => series.is_failed() || movies.is_failed(),
        };
        if history.is_failed() && library_failed {
            return Err(EngineError::ContextBuildFailed(
                "watch history and library sources are unavailable".to_string(),
            ));
        }

        let mut items = series.unwrap_or_default();
        items.extend(movies.unwrap_or_default());

        Ok(UserContext {
            user_id: user_id.to_string(),
            watch_history: history.unwrap_or_default(),
            library: library_statistics(&items, disk),
            preferences: self.settings.current().preferences(),
            feedback_patterns: patterns,
        })
    }

    async fn watch_history(&self, user_id: &str) -> Result<Vec<WatchHistoryItem>, ConnectorError> {
        self.connectors
            .history
            .first_responsive(|source| {
                let user_id = user_id.to_string();
                async move { source.watch_history(&user_id, HISTORY_LIMIT).await }
            })
            .await
    }

    async fn disk_space(&self) -> Option<DiskSpace> {
        for pool in [&self.connectors.series, &self.connectors.movies] {
            if pool.is_empty() {
                continue;
            }
            if let Ok(space) = pool
                .first_responsive(|library| async move { library.disk_space().await })
                .await
            {
                return Some(space);
            }
        }
        None
    }

    async fn feedback_patterns(&self, user_id: &str) -> Vec<FeedbackPattern> {
        match tokio::time::timeout(self.source_timeout, self.learner.patterns(user_id)).await {
            Ok(Ok(patterns)) => patterns,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to load feedback patterns");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Feedback patterns timed out");
                Vec::new()
            }
        }
    }
}

async fn library_items(
    pool: &ConnectorPool<dyn MediaLibrary>,
) -> Result<Vec<LibraryItem>, ConnectorError> {
    pool.first_responsive(|library| async move { library.library_items().await })
        .await
}

/// Aggregates library items into the statistics carried by the context
pub fn library_statistics(items: &[LibraryItem], disk: Option<DiskSpace>) -> LibraryStatistics {
    let mut genre_distribution = BTreeMap::new();
    let mut qualities: BTreeMap<&str, usize> = BTreeMap::new();

    for item in items {
        for genre in &item.genres {
            *genre_distribution.entry(genre.clone()).or_insert(0) += 1;
        }
        if let Some(quality) = item.quality.as_deref() {
            *qualities.entry(quality).or_insert(0) += 1;
        }
    }

    let ratings: Vec<f32> = items.iter().filter_map(|i| i.rating).collect();
    let average_rating = if ratings.is_empty() {
        None
    } else {
        Some(ratings.iter().sum::<f32>() / ratings.len() as f32)
    };

    // Ties resolve to the alphabetically first quality
    let dominant_quality = qualities
        .into_iter()
        .fold(None, |best: Option<(&str, usize)>, (quality, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((quality, count)),
        })
        .map(|(quality, _)| quality.to_string());

    LibraryStatistics {
        item_count: items.len(),
        genre_distribution,
        average_rating,
        dominant_quality,
        storage_used_bytes: items.iter().map(|i| i.size_on_disk).sum(),
        storage_available_bytes: disk.map(|d| d.free_bytes),
    }
}
