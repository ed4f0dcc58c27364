use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::EngineResult,
    models::{FeedbackOutcome, RecommendationQuery, RecommendationResponse, RejectionReason},
};

use super::AppState;

// Request/Response types

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub outcome: FeedbackOutcome,
    pub reason: Option<RejectionReason>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub recorded: bool,
    pub cache_invalidated: bool,
}

// Handlers

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "online": state.orchestrator.is_online(),
        })),
    )
}

/// GET /api/v1/users/:user_id/recommendations
pub async fn get_recommendations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RecommendationQuery>,
) -> EngineResult<Json<RecommendationResponse>> {
    let response = state
        .orchestrator
        .get_recommendations(&user_id, &query)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/users/:user_id/recommendations/refresh
pub async fn refresh_recommendations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RecommendationQuery>,
) -> EngineResult<Json<RecommendationResponse>> {
    let response = state
        .orchestrator
        .refresh_recommendations(&user_id, &query)
        .await?;
    Ok(Json(response))
}

/// DELETE /api/v1/users/:user_id/recommendations/cache
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> EngineResult<StatusCode> {
    state.orchestrator.invalidate_cache(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/users/:user_id/recommendations/:recommendation_id/feedback
pub async fn record_feedback(
    State(state): State<AppState>,
    Path((user_id, recommendation_id)): Path<(String, Uuid)>,
    Json(request): Json<FeedbackRequest>,
) -> EngineResult<(StatusCode, Json<FeedbackResponse>)> {
    let cache_invalidated = state
        .orchestrator
        .record_feedback(&user_id, recommendation_id, request.outcome, request.reason)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(FeedbackResponse {
            recorded: true,
            cache_invalidated,
        }),
    ))
}

/// POST /api/v1/users/:user_id/recommendations/:recommendation_id/library
pub async fn add_to_library(
    State(state): State<AppState>,
    Path((user_id, recommendation_id)): Path<(String, Uuid)>,
) -> EngineResult<StatusCode> {
    state
        .orchestrator
        .add_to_library(&user_id, recommendation_id)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
