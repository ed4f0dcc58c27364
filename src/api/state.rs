use std::sync::Arc;

use crate::services::RecommendationOrchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RecommendationOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<RecommendationOrchestrator>) -> Self {
        Self { orchestrator }
    }
}
