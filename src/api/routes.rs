use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use super::AppState;
use crate::middleware::{make_span_with_request_id, request_id_middleware};

/// Creates the main API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/users/:user_id", user_routes())
        // Outermost first: the request id must exist before the trace span is made
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(request_id_middleware))
                .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id)),
        )
        .with_state(state)
}

/// Routes scoped to one user
fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/recommendations", get(handlers::get_recommendations))
        .route("/recommendations/refresh", post(handlers::refresh_recommendations))
        .route("/recommendations/cache", delete(handlers::invalidate_cache))
        .route(
            "/recommendations/:recommendation_id/feedback",
            post(handlers::record_feedback),
        )
        .route(
            "/recommendations/:recommendation_id/library",
            post(handlers::add_to_library),
        )
}
