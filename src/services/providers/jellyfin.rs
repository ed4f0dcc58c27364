//! Watch history from a Jellyfin media server.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::Deserialize;

use crate::{
    models::{eq_ignore_case, CompletionStatus, MediaKind, WatchHistoryItem},
    services::providers::{ConnectorError, WatchHistorySource},
};

/// Played percentage below which a started title counts as abandoned
const ABANDONED_BELOW_PERCENT: f64 = 20.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<JellyfinItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JellyfinItem {
    name: Option<String>,
    #[serde(rename = "Type")]
    item_type: Option<String>,
    series_name: Option<String>,
    production_year: Option<i32>,
    community_rating: Option<f32>,
    #[serde(default)]
    genres: Vec<String>,
    user_data: Option<UserData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserData {
    #[serde(default)]
    played: bool,
    played_percentage: Option<f64>,
    last_played_date: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct JellyfinHistory {
    http_client: HttpClient,
    name: String,
    api_url: String,
    api_key: String,
}

impl JellyfinHistory {
    pub fn new(name: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            name: name.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

impl JellyfinItem {
    fn into_history_item(self) -> Option<WatchHistoryItem> {
        let user_data = self.user_data?;
        let watched_at = user_data.last_played_date?;

        // Episodes are reported under their series
        let (title, kind) = match self.item_type.as_deref() {
            Some("Episode") => (self.series_name.or(self.name)?, MediaKind::Series),
            Some("Series") => (self.name?, MediaKind::Series),
            _ => (self.name?, MediaKind::Movie),
        };

        let status = if user_data.played {
            CompletionStatus::Completed
        } else if user_data.played_percentage.unwrap_or(0.0) < ABANDONED_BELOW_PERCENT {
            CompletionStatus::Abandoned
        } else {
            CompletionStatus::InProgress
        };

        Some(WatchHistoryItem {
            title,
            year: self.production_year,
            kind,
            rating: self.community_rating,
            genres: self.genres,
            status,
            watched_at,
        })
    }
}

/// Collapses episodes of the same series into their most recent entry
fn collapse_history(items: Vec<JellyfinItem>, limit: usize) -> Vec<WatchHistoryItem> {
    let mut history: Vec<WatchHistoryItem> = Vec::new();
    for item in items.into_iter().filter_map(JellyfinItem::into_history_item) {
        let duplicate = history
            .iter()
            .any(|h| h.kind == item.kind && eq_ignore_case(&h.title, &item.title));
        if !duplicate {
            history.push(item);
        }
    }
    history.sort_by(|a, b| b.watched_at.cmp(&a.watched_at));
    history.truncate(limit);
    history
}

#[async_trait]
impl WatchHistorySource for JellyfinHistory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<WatchHistoryItem>, ConnectorError> {
        let url = format!("{}/Users/{}/Items", self.api_url, user_id);
        // Episodes collapse per series, so over-fetch
        let fetch_limit = (limit * 4).to_string();

        let response = self
            .http_client
            .get(&url)
            .header("X-Emby-Token", &self.api_key)
            .query(&[
                ("Recursive", "true"),
                ("IncludeItemTypes", "Movie,Episode"),
                ("SortBy", "DatePlayed"),
                ("SortOrder", "Descending"),
                ("Fields", "Genres,ProductionYear,CommunityRating"),
                ("EnableUserData", "true"),
                ("Limit", fetch_limit.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Status {
                service: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let items: ItemsResponse = response.json().await?;
        let history = collapse_history(items.items, limit);

        tracing::debug!(connector = %self.name, items = history.len(), "Fetched watch history");
        Ok(history)
    }
}
