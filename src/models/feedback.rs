use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MediaKind, Recommendation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Accepted,
    Rejected,
    Watched,
}

impl FeedbackOutcome {
    pub fn is_positive(&self) -> bool {
        matches!(self, FeedbackOutcome::Accepted | FeedbackOutcome::Watched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NotInterested,
    AlreadyWatched,
    DislikeGenre,
    Other,
}

/// One piece of user feedback on a recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub recommendation_id: Uuid,
    pub title: String,
    pub kind: MediaKind,
    pub genres: Vec<String>,
    pub outcome: FeedbackOutcome,
    pub reason: Option<RejectionReason>,
    pub recorded_at: DateTime<Utc>,
}

impl FeedbackEvent {
    pub fn for_recommendation(
        recommendation: &Recommendation,
        outcome: FeedbackOutcome,
        reason: Option<RejectionReason>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            recommendation_id: recommendation.id,
            title: recommendation.title.clone(),
            kind: recommendation.kind,
            genres: recommendation.genres.clone(),
            outcome,
            reason,
            recorded_at,
        }
    }

    pub fn is_not_interested(&self) -> bool {
        self.outcome == FeedbackOutcome::Rejected
            && self.reason == Some(RejectionReason::NotInterested)
    }
}
