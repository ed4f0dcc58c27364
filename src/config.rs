use serde::Deserialize;
use std::time::Duration;

use crate::services::{
    OrchestratorConfig, ProviderLimits, RecommendationSettings, RetryPolicy, SchedulerConfig,
    ThrottleConfig,
};
use crate::{models::DEFAULT_LIMIT, services::generation::ProviderOptions};

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redis connection URL. Without one, state lives in memory only.
    pub redis_url: Option<String>,

    /// AI provider name the key pool tracks
    #[serde(default = "default_ai_provider")]
    pub ai_provider: String,

    /// OpenAI-compatible API base URL
    #[serde(default = "default_ai_base_url")]
    pub ai_base_url: String,

    #[serde(default = "default_ai_model")]
    pub ai_model: String,

    /// Comma-separated provider API keys, rotated in order
    #[serde(default)]
    pub ai_api_keys: String,

    /// Comma-separated Sonarr URLs, paired by position with `sonarr_api_keys`
    #[serde(default)]
    pub sonarr_urls: String,
    #[serde(default)]
    pub sonarr_api_keys: String,

    /// Comma-separated Radarr URLs, paired by position with `radarr_api_keys`
    #[serde(default)]
    pub radarr_urls: String,
    #[serde(default)]
    pub radarr_api_keys: String,

    pub jellyfin_url: Option<String>,
    pub jellyfin_api_key: Option<String>,

    /// Probed to decide whether the device is online
    #[serde(default = "default_reachability_url")]
    pub reachability_url: String,
    #[serde(default = "default_reachability_interval_secs")]
    pub reachability_interval_secs: u64,

    #[serde(default = "default_cache_max_age_hours")]
    pub cache_max_age_hours: i64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Comma-separated genres never recommended
    #[serde(default)]
    pub excluded_genres: String,
    pub content_rating_ceiling: Option<String>,

    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: usize,
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_provider_requests_per_minute")]
    pub provider_requests_per_minute: usize,
    #[serde(default = "default_provider_requests_per_day")]
    pub provider_requests_per_day: usize,
    #[serde(default = "default_provider_search_per_day")]
    pub provider_search_per_day: usize,
    #[serde(default = "default_provider_recommendations_per_day")]
    pub provider_recommendations_per_day: usize,

    #[serde(default = "default_background_interval_hours")]
    pub background_interval_hours: u64,
    #[serde(default = "default_true")]
    pub background_updates_enabled: bool,

    /// Timeout for each external data fetch
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_ai_provider() -> String {
    "openai".to_string()
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    ProviderOptions::default().model
}

fn default_reachability_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

fn default_reachability_interval_secs() -> u64 {
    30
}

fn default_cache_max_age_hours() -> i64 {
    24
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_max_requests_per_minute() -> usize {
    2
}

fn default_max_requests_per_hour() -> usize {
    10
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_provider_requests_per_minute() -> usize {
    15
}

fn default_provider_requests_per_day() -> usize {
    1_500
}

fn default_provider_search_per_day() -> usize {
    100
}

fn default_provider_recommendations_per_day() -> usize {
    50
}

fn default_background_interval_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_source_timeout_ms() -> u64 {
    2_000
}

/// Splits a comma-separated setting, dropping blanks
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pairs instance URLs with API keys by position
fn instances(urls: &str, keys: &str) -> Vec<(String, String)> {
    split_list(urls).into_iter().zip(split_list(keys)).collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    pub fn ai_keys(&self) -> Vec<String> {
        split_list(&self.ai_api_keys)
    }

    pub fn sonarr_instances(&self) -> Vec<(String, String)> {
        instances(&self.sonarr_urls, &self.sonarr_api_keys)
    }

    pub fn radarr_instances(&self) -> Vec<(String, String)> {
        instances(&self.radarr_urls, &self.radarr_api_keys)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_requests_per_minute: self.max_requests_per_minute,
            max_requests_per_hour: self.max_requests_per_hour,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn provider_limits(&self) -> ProviderLimits {
        ProviderLimits {
            requests_per_minute: self.provider_requests_per_minute,
            requests_per_day: self.provider_requests_per_day,
            search_per_day: self.provider_search_per_day,
            recommendations_per_day: self.provider_recommendations_per_day,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            provider: self.ai_provider.clone(),
            provider_options: ProviderOptions {
                model: self.ai_model.clone(),
                ..Default::default()
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
            },
            source_timeout: self.source_timeout(),
        }
    }

    /// Initial user settings
    pub fn settings(&self) -> RecommendationSettings {
        RecommendationSettings {
            default_limit: self.default_limit,
            excluded_genres: split_list(&self.excluded_genres),
            content_rating_ceiling: self.content_rating_ceiling.clone(),
            cache_max_age: chrono::Duration::hours(self.cache_max_age_hours),
            background_updates_enabled: self.background_updates_enabled,
            ..Default::default()
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.background_interval_hours * 60 * 60),
            ..Default::default()
        }
    }
}
