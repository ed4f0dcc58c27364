use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::{db::StoreError, services::providers::ConnectorError};

/// Structured sub-codes for recommendation-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationErrorCode {
    /// Offline and nothing cached to serve
    OfflineNoCache,
    /// Feedback or an action referenced a user with no generated set
    NoCache,
    /// Unknown recommendation id
    NotFound,
    ServiceNotConfigured,
    ServiceMisconfigured,
    /// A network-dependent action was attempted offline
    OfflineActionDisabled,
}

impl RecommendationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationErrorCode::OfflineNoCache => "OFFLINE_NO_CACHE",
            RecommendationErrorCode::NoCache => "NO_CACHE",
            RecommendationErrorCode::NotFound => "NOT_FOUND",
            RecommendationErrorCode::ServiceNotConfigured => "SERVICE_NOT_CONFIGURED",
            RecommendationErrorCode::ServiceMisconfigured => "SERVICE_MISCONFIGURED",
            RecommendationErrorCode::OfflineActionDisabled => "OFFLINE_ACTION_DISABLED",
        }
    }
}

/// Which limiter rejected a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// Per-user sliding window
    User,
    /// Global per-provider ceiling
    Provider,
    /// Quota signalled by the AI provider itself
    ProviderQuota,
}

/// Engine-level errors surfaced to callers
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Failed to build user context: {0}")]
    ContextBuildFailed(String),

    #[error("AI service error: {0}")]
    AiService(String),

    #[error("Rate limit exceeded ({scope:?}), resets at {reset_at}")]
    RateLimit {
        scope: RateLimitScope,
        reset_at: DateTime<Utc>,
    },

    #[error("All credentials for provider {provider} are exhausted")]
    ProviderExhausted { provider: String },

    #[error("{message}")]
    Recommendation {
        code: RecommendationErrorCode,
        message: String,
    },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Media service error: {0}")]
    Connector(#[from] ConnectorError),
}

impl EngineError {
    pub fn recommendation(code: RecommendationErrorCode, message: impl Into<String>) -> Self {
        EngineError::Recommendation {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code for the error
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ContextBuildFailed(_) => "CONTEXT_BUILD_FAILED",
            EngineError::AiService(_) => "AI_SERVICE_ERROR",
            EngineError::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            EngineError::ProviderExhausted { .. } => "PROVIDER_KEYS_EXHAUSTED",
            EngineError::Recommendation { code, .. } => code.as_str(),
            EngineError::Store(_) => "STORAGE_ERROR",
            EngineError::Connector(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Whether waiting or retrying later can resolve the error
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ContextBuildFailed(_)
            | EngineError::AiService(_)
            | EngineError::RateLimit { .. }
            | EngineError::Store(_)
            | EngineError::Connector(_) => true,
            EngineError::ProviderExhausted { .. } => false,
            EngineError::Recommendation { .. } => false,
        }
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            EngineError::RateLimit { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::ContextBuildFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::AiService(_) => StatusCode::BAD_GATEWAY,
            EngineError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::ProviderExhausted { .. } => StatusCode::PAYMENT_REQUIRED,
            EngineError::Recommendation { code, .. } => match code {
                RecommendationErrorCode::OfflineNoCache
                | RecommendationErrorCode::OfflineActionDisabled => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RecommendationErrorCode::NoCache | RecommendationErrorCode::NotFound => {
                    StatusCode::NOT_FOUND
                }
                RecommendationErrorCode::ServiceNotConfigured
                | RecommendationErrorCode::ServiceMisconfigured => StatusCode::CONFLICT,
            },
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Connector(_) => StatusCode::BAD_GATEWAY,
        };

        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
            "retryable": self.is_retryable(),
        });
        if let Some(reset_at) = self.reset_at() {
            body["reset_at"] = json!(reset_at);
        }

        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
