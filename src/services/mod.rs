pub mod cache;
pub mod context_builder;
pub mod enrichment;
pub mod fingerprint;
pub mod generation;
pub mod key_pool;
pub mod learning;
pub mod orchestrator;
pub mod prompt;
pub mod provider_limiter;
pub mod providers;
pub mod reachability;
pub mod scheduler;
pub mod settings;
pub mod throttle;

pub use cache::RecommendationCache;
pub use context_builder::ContextBuilder;
pub use fingerprint::fingerprint;
pub use key_pool::{KeyRotationState, ProviderKeyPool};
pub use learning::{FeedbackLearner, KvFeedbackLearner};
pub use orchestrator::{
    Collaborators, OrchestratorConfig, RecommendationOrchestrator, RetryPolicy, ScheduledRetry,
};
pub use provider_limiter::{OperationKind, ProviderLimiter, ProviderLimits};
pub use reachability::{NetworkMonitor, Reachability};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerHandle};
pub use settings::{RecommendationSettings, SettingsProvider, SharedSettings};
pub use throttle::{RequestThrottle, ThrottleConfig};
