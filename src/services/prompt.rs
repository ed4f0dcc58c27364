//! Prompt and output-schema construction for the generation call, and parsing
//! of the structured object it returns.

use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write;
use uuid::Uuid;

use crate::{
    models::{MediaKind, Recommendation, UserContext},
    services::{
        generation::{GenerationError, GenerationRequest, ProviderOptions},
        settings::RecommendationSettings,
    },
};

const HISTORY_IN_PROMPT: usize = 30;

const SYSTEM_PROMPT: &str = "You are a film and television recommendation assistant for a personal \
media library. Recommend real, existing titles the user has not already watched. Respect the \
user's disliked genres and content rating ceiling. Reply only with JSON matching the schema.";

/// JSON schema of the structured output
pub fn output_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["recommendations"],
        "properties": {
            "recommendations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["title", "year", "type", "genres", "reasoning", "matchScore", "isHiddenGem"],
                    "properties": {
                        "title": { "type": "string" },
                        "year": { "type": ["integer", "null"] },
                        "type": { "type": "string", "enum": ["movie", "series"] },
                        "genres": { "type": "array", "items": { "type": "string" } },
                        "reasoning": { "type": "string" },
                        "matchScore": { "type": "integer", "minimum": 0, "maximum": 100 },
                        "isHiddenGem": { "type": "boolean" }
                    }
                }
            }
        }
    })
}

/// Builds the full generation request for one user
pub fn build_request(
    context: &UserContext,
    settings: &RecommendationSettings,
    limit: usize,
    include_hidden_gems: bool,
    not_interested: &[String],
    options: ProviderOptions,
) -> GenerationRequest {
    GenerationRequest {
        schema: output_schema(),
        prompt: build_prompt(context, settings, limit, include_hidden_gems, not_interested),
        system_prompt: SYSTEM_PROMPT.to_string(),
        options,
    }
}

pub fn build_prompt(
    context: &UserContext,
    settings: &RecommendationSettings,
    limit: usize,
    include_hidden_gems: bool,
    not_interested: &[String],
) -> String {
    let mut prompt = String::new();
    let prefs = &context.preferences;

    let _ = writeln!(prompt, "Recommend exactly {} titles.", limit);

    if context.watch_history.is_empty() {
        let _ = writeln!(prompt, "\nThe user has no recorded watch history yet.");
    } else {
        let _ = writeln!(prompt, "\nRecently watched (most recent first):");
        for item in context.watch_history.iter().take(HISTORY_IN_PROMPT) {
            let year = item.year.map(|y| format!(" ({})", y)).unwrap_or_default();
            let rating = item
                .rating
                .map(|r| format!(", rated {:.1}", r))
                .unwrap_or_default();
            let _ = writeln!(
                prompt,
                "- {}{} [{}; {}{}; {:?}]",
                item.title,
                year,
                item.kind,
                item.genres.join(", "),
                rating,
                item.status
            );
        }
    }

    let library = &context.library;
    if library.item_count > 0 {
        let mut top_genres: Vec<_> = library.genre_distribution.iter().collect();
        top_genres.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top: Vec<&str> = top_genres.iter().take(5).map(|(g, _)| g.as_str()).collect();
        let _ = writeln!(
            prompt,
            "\nLibrary: {} items, top genres: {}.",
            library.item_count,
            top.join(", ")
        );
        if let Some(quality) = &library.dominant_quality {
            let _ = writeln!(prompt, "Most items are kept in {} quality.", quality);
        }
    }

    if !prefs.favorite_genres.is_empty() {
        let _ = writeln!(prompt, "Favorite genres: {}.", prefs.favorite_genres.join(", "));
    }
    if !prefs.disliked_genres.is_empty() {
        let _ = writeln!(prompt, "Avoid genres: {}.", prefs.disliked_genres.join(", "));
    }
    if !settings.excluded_genres.is_empty() {
        let _ = writeln!(
            prompt,
            "Never recommend these genres: {}.",
            settings.excluded_genres.join(", ")
        );
    }
    if let Some(ceiling) = &prefs.content_rating_ceiling {
        let _ = writeln!(prompt, "Content rating must not exceed {}.", ceiling);
    }
    let _ = writeln!(
        prompt,
        "Preferred length: {}. Language: {}.",
        prefs.preferred_length.as_str(),
        prefs.language
    );

    let learned: Vec<String> = context
        .feedback_patterns
        .iter()
        .filter(|p| p.confidence >= 0.25)
        .map(|p| format!("{} accepted {:.0}% of the time", p.factor, p.acceptance_rate * 100.0))
        .collect();
    if !learned.is_empty() {
        let _ = writeln!(prompt, "\nLearned from past feedback: {}.", learned.join("; "));
    }

    if !not_interested.is_empty() {
        let _ = writeln!(
            prompt,
            "Do not recommend (user not interested): {}.",
            not_interested.join(", ")
        );
    }

    if include_hidden_gems {
        let _ = writeln!(
            prompt,
            "\nInclude a few hidden gems: lesser-known, highly rated titles. Mark them with isHiddenGem."
        );
    }

    prompt
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedItem {
    title: String,
    #[serde(default)]
    year: Option<i32>,
    #[serde(rename = "type")]
    kind: MediaKind,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    match_score: i64,
    #[serde(default)]
    is_hidden_gem: bool,
}

#[derive(Debug, Deserialize)]
struct GeneratedSet {
    recommendations: Vec<GeneratedItem>,
}

/// Converts the structured output into recommendations with fresh ids
pub fn parse_recommendations(value: Value) -> Result<Vec<Recommendation>, GenerationError> {
    let set: GeneratedSet =
        serde_json::from_value(value).map_err(|e| GenerationError::Parse(e.to_string()))?;

    Ok(set
        .recommendations
        .into_iter()
        .filter(|item| !item.title.trim().is_empty())
        .map(|item| Recommendation {
            id: Uuid::new_v4(),
            title: item.title.trim().to_string(),
            year: item.year,
            kind: item.kind,
            genres: item.genres,
            reasoning: item.reasoning,
            match_score: item.match_score.clamp(0, 100) as u8,
            is_hidden_gem: item.is_hidden_gem,
            availability: None,
            poster_url: None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompletionStatus, WatchHistoryItem};
    use chrono::Utc;

    fn context() -> UserContext {
        let mut ctx = UserContext::empty("u1");
        ctx.watch_history.push(WatchHistoryItem {
            title: "Arrival".into(),
            year: Some(2016),
            kind: MediaKind::Movie,
            rating: Some(8.5),
            genres: vec!["Sci-Fi".into()],
            status: CompletionStatus::Completed,
            watched_at: Utc::now(),
        });
        ctx.preferences.favorite_genres = vec!["Drama".into()];
        ctx.preferences.content_rating_ceiling = Some("PG-13".into());
        ctx
    }

    #[test]
    fn test_prompt_mentions_context() {
        let prompt = build_prompt(
            &context(),
            &RecommendationSettings::default(),
            5,
            true,
            &["Cats".to_string()],
        );
        assert!(prompt.contains("exactly 5 titles"));
        assert!(prompt.contains("Arrival (2016)"));
        assert!(prompt.contains("Favorite genres: Drama"));
        assert!(prompt.contains("must not exceed PG-13"));
        assert!(prompt.contains("Cats"));
        assert!(prompt.contains("hidden gems"));
    }

    #[test]
    fn test_prompt_without_hidden_gems() {
        let prompt = build_prompt(&context(), &RecommendationSettings::default(), 5, false, &[]);
        assert!(!prompt.contains("hidden gems"));
        assert!(!prompt.contains("not interested"));
    }

    #[test]
    fn test_parse_recommendations() {
        let value = json!({
            "recommendations": [
                {
                    "title": " Blade Runner 2049 ",
                    "year": 2017,
                    "type": "movie",
                    "genres": ["Sci-Fi"],
                    "reasoning": "Because you liked Arrival",
                    "matchScore": 140,
                    "isHiddenGem": false
                },
                {
                    "title": "Severance",
                    "year": null,
                    "type": "series",
                    "genres": [],
                    "reasoning": "",
                    "matchScore": 80,
                    "isHiddenGem": true
                },
                { "title": "  ", "type": "movie" }
            ]
        });

        let recs = parse_recommendations(value).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].title, "Blade Runner 2049");
        assert_eq!(recs[0].match_score, 100);
        assert_eq!(recs[1].kind, MediaKind::Series);
        assert!(recs[1].is_hidden_gem);
        assert_ne!(recs[0].id, recs[1].id);
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        assert!(parse_recommendations(json!({"items": []})).is_err());
    }
}
