pub mod context;
pub mod feedback;
pub mod recommendation;

pub use context::{
    CompletionStatus, FeedbackPattern, LibraryStatistics, MediaKind, PreferredLength, Preferences,
    UserContext, WatchHistoryItem,
};
pub use feedback::{FeedbackEvent, FeedbackOutcome, RejectionReason};
pub use recommendation::{
    eq_ignore_case, Availability, CacheEntry, ContextSummary, Recommendation, RecommendationQuery,
    RecommendationResponse, CACHE_SCHEMA_VERSION, DEFAULT_LIMIT, MAX_LIMIT, MIN_LIMIT,
};
