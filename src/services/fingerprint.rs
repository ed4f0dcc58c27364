//! Context fingerprinting.
//!
//! Reduces a [`UserContext`] to a short digest so the cache can tell whether
//! anything relevant changed without storing the context itself.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::UserContext;

/// Number of most recent history items that contribute to the fingerprint
const RECENT_HISTORY_WINDOW: usize = 20;
/// Feedback patterns with fewer samples are ignored
const MIN_PATTERN_SAMPLES: u32 = 5;
/// Hex characters kept from the digest
const FINGERPRINT_LEN: usize = 16;

#[derive(Serialize)]
struct CanonicalContext {
    watch_history_count: usize,
    recent_titles: Vec<String>,
    favorite_genres: Vec<String>,
    disliked_genres: Vec<String>,
    excluded_genres: Vec<String>,
    content_rating_ceiling: Option<String>,
    preferred_length: &'static str,
    language: String,
    feedback_pattern_count: usize,
    significant_patterns: Vec<String>,
}

impl CanonicalContext {
    fn from_context(context: &UserContext) -> Self {
        let mut recent: Vec<_> = context.watch_history.iter().collect();
        // Newest first, ties broken by title and year so input order never matters
        recent.sort_by(|a, b| {
            b.watched_at
                .cmp(&a.watched_at)
                .then_with(|| a.title.cmp(&b.title))
                .then_with(|| a.year.cmp(&b.year))
        });
        let mut recent_titles: Vec<String> = recent
            .into_iter()
            .take(RECENT_HISTORY_WINDOW)
            .map(|item| match item.year {
                Some(year) => format!("{}:{}", item.title, year),
                None => item.title.clone(),
            })
            .collect();
        recent_titles.sort();

        let mut significant_patterns: Vec<String> = context
            .feedback_patterns
            .iter()
            .filter(|p| p.sample_size >= MIN_PATTERN_SAMPLES)
            .map(|p| format!("{}:{:.3}", p.factor, p.acceptance_rate))
            .collect();
        significant_patterns.sort();

        Self {
            watch_history_count: context.watch_history.len(),
            recent_titles,
            favorite_genres: sorted(&context.preferences.favorite_genres),
            disliked_genres: sorted(&context.preferences.disliked_genres),
            excluded_genres: sorted(
                &context
                    .preferences
                    .excluded_genres
                    .iter()
                    .map(|g| g.to_lowercase())
                    .collect::<Vec<_>>(),
            ),
            content_rating_ceiling: context.preferences.content_rating_ceiling.clone(),
            preferred_length: context.preferences.preferred_length.as_str(),
            language: context.preferences.language.clone(),
            feedback_pattern_count: context.feedback_patterns.len(),
            significant_patterns,
        }
    }
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut values = values.to_vec();
    values.sort();
    values
}

fn digest(input: &[u8]) -> String {
    let hash = Sha256::digest(input);
    let hex = format!("{:x}", hash);
    hex[..FINGERPRINT_LEN].to_string()
}

/// Computes the fingerprint of a context.
///
/// Equal semantic content always yields the same fingerprint regardless of
/// the order in which genres, history or patterns were collected. If the
/// canonical form cannot be produced, a time-derived value is returned so the
/// next cache check reports a change.
pub fn fingerprint(context: &UserContext) -> String {
    let canonical = CanonicalContext::from_context(context);
    match serde_json::to_vec(&canonical) {
        Ok(bytes) => digest(&bytes),
        Err(e) => {
            tracing::warn!(error = %e, user_id = %context.user_id, "Fingerprint failed, forcing regeneration");
            fallback_fingerprint()
        }
    }
}

fn fallback_fingerprint() -> String {
    let now = Utc::now();
    format!("ts-{}-{}", now.timestamp(), now.timestamp_subsec_nanos())
}
