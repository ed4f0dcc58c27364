//! Recommendation orchestration.
//!
//! Cache first, then a throttled and retried generation call running under
//! the provider key pool, then enrichment and a cache write. Any failure on
//! the way tries to answer from the cached set before surfacing an error.
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    db::KeyValueStore,
    error::{EngineError, EngineResult, RateLimitScope, RecommendationErrorCode},
    models::{
        eq_ignore_case, CacheEntry, ContextSummary, FeedbackEvent, FeedbackOutcome, Recommendation,
        RecommendationQuery, RecommendationResponse, RejectionReason, UserContext,
        CACHE_SCHEMA_VERSION,
    },
    services::{
        cache::RecommendationCache,
        context_builder::ContextBuilder,
        enrichment::Enricher,
        fingerprint::fingerprint,
        generation::{Credential, GenerationError, GenerationRequest, ProviderOptions, StructuredGenerator},
        key_pool::ProviderKeyPool,
        learning::FeedbackLearner,
        prompt,
        provider_limiter::{OperationKind, ProviderLimiter},
        providers::{ConnectorError, MediaConnectors},
        reachability::Reachability,
        settings::{RecommendationSettings, SettingsProvider},
        throttle::RequestThrottle,
    },
};

/// Reset window assumed when the provider signals quota without a retry hint
const DEFAULT_QUOTA_RESET: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// A refresh to run once a rate limit has reset
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRetry {
    pub user_id: String,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Provider name the key pool and limiter track
    pub provider: String,
    pub provider_options: ProviderOptions,
    pub retry: RetryPolicy,
    /// Timeout for each context source and enrichment lookup
    pub source_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            provider_options: ProviderOptions::default(),
            retry: RetryPolicy::default(),
            source_timeout: Duration::from_secs(2),
        }
    }
}

/// Collaborators the orchestrator is wired with
pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub generator: Arc<dyn StructuredGenerator>,
    pub key_pool: Arc<ProviderKeyPool>,
    pub learner: Arc<dyn FeedbackLearner>,
    pub connectors: MediaConnectors,
    pub reachability: Arc<dyn Reachability>,
    pub settings: Arc<dyn SettingsProvider>,
    pub throttle: Arc<RequestThrottle>,
    pub provider_limiter: Arc<ProviderLimiter>,
}

pub struct RecommendationOrchestrator {
    cache: RecommendationCache,
    context_builder: ContextBuilder,
    enricher: Enricher,
    generator: Arc<dyn StructuredGenerator>,
    key_pool: Arc<ProviderKeyPool>,
    learner: Arc<dyn FeedbackLearner>,
    connectors: MediaConnectors,
    reachability: Arc<dyn Reachability>,
    settings: Arc<dyn SettingsProvider>,
    throttle: Arc<RequestThrottle>,
    provider_limiter: Arc<ProviderLimiter>,
    config: OrchestratorConfig,
    retry_tx: Option<mpsc::UnboundedSender<ScheduledRetry>>,
}

impl RecommendationOrchestrator {
    pub fn new(parts: Collaborators, config: OrchestratorConfig) -> Self {
        Self {
            cache: RecommendationCache::new(parts.store, parts.settings.clone()),
            context_builder: ContextBuilder::new(
                parts.connectors.clone(),
                parts.learner.clone(),
                parts.settings.clone(),
                config.source_timeout,
            ),
            enricher: Enricher::new(parts.connectors.clone(), config.source_timeout),
            generator: parts.generator,
            key_pool: parts.key_pool,
            learner: parts.learner,
            connectors: parts.connectors,
            reachability: parts.reachability,
            settings: parts.settings,
            throttle: parts.throttle,
            provider_limiter: parts.provider_limiter,
            config,
            retry_tx: None,
        }
    }

    /// Sends rate-limited users to the scheduler for a retry at reset time
    pub fn with_retry_sender(mut self, tx: mpsc::UnboundedSender<ScheduledRetry>) -> Self {
        self.retry_tx = Some(tx);
        self
    }

    pub fn cache(&self) -> &RecommendationCache {
        &self.cache
    }

    pub fn throttle(&self) -> &RequestThrottle {
        &self.throttle
    }

    pub fn is_online(&self) -> bool {
        self.reachability.is_online()
    }

    pub fn settings(&self) -> RecommendationSettings {
        self.settings.current()
    }

    pub async fn get_recommendations(
        &self,
        user_id: &str,
        query: &RecommendationQuery,
    ) -> EngineResult<RecommendationResponse> {
        if !self.reachability.is_online() && !query.force_refresh {
            return self.serve_offline(user_id).await;
        }

        let settings = self.settings.current();
        let limit = query.effective_limit(settings.default_limit);

        let context = match self.context_builder.build(user_id).await {
            Ok(context) => context,
            Err(e) => return self.fallback_to_cache(user_id, e).await,
        };
        let context_fingerprint = fingerprint(&context);

        if !query.force_refresh {
            let now = Utc::now();
            match self.cache.get(user_id).await {
                Ok(Some(entry)) if self.cache.entry_is_valid(&entry, &context_fingerprint, now) => {
                    tracing::debug!(user_id = %user_id, "Serving recommendations from cache");
                    let mut response = cached_response(entry, now, false, false);
                    response.context = Some(context_summary(&context));
                    return Ok(response);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Cache read failed, regenerating");
                }
            }
        }

        let recommendations = match self
            .generate(user_id, &context, &settings, limit, query.include_hidden_gems)
            .await
        {
            Ok(recommendations) => recommendations,
            Err(e) => {
                if let Some(reset_at) = e.reset_at() {
                    self.schedule_retry(user_id, reset_at);
                }
                return self.fallback_to_cache(user_id, e).await;
            }
        };

        let recommendations = self.enricher.enrich(recommendations).await;
        let entry = CacheEntry::new(user_id, recommendations, context_fingerprint, Utc::now());
        if let Err(e) = self.cache.set(&entry).await {
            tracing::error!(user_id = %user_id, error = %e, "Failed to write recommendation cache");
        }

        tracing::info!(
            user_id = %user_id,
            count = entry.recommendations.len(),
            "Generated fresh recommendations"
        );

        Ok(RecommendationResponse {
            recommendations: entry.recommendations,
            generated_at: entry.generated_at,
            cache_age_ms: None,
            is_offline: false,
            is_stale: false,
            context: Some(context_summary(&context)),
        })
    }

    /// Drops the cached set and regenerates
    pub async fn refresh_recommendations(
        &self,
        user_id: &str,
        query: &RecommendationQuery,
    ) -> EngineResult<RecommendationResponse> {
        self.cache.invalidate(user_id).await?;
        let query = RecommendationQuery {
            force_refresh: true,
            ..query.clone()
        };
        self.get_recommendations(user_id, &query).await
    }

    pub async fn invalidate_cache(&self, user_id: &str) -> EngineResult<()> {
        Ok(self.cache.invalidate(user_id).await?)
    }

    /// Stores feedback on a cached recommendation and invalidates the cache
    /// when the learner says accumulated feedback warrants it.
    ///
    /// Returns whether the cache was invalidated.
    pub async fn record_feedback(
        &self,
        user_id: &str,
        recommendation_id: Uuid,
        outcome: FeedbackOutcome,
        reason: Option<RejectionReason>,
    ) -> EngineResult<bool> {
        let recommendation = self.cached_recommendation(user_id, recommendation_id).await?;
        let event = FeedbackEvent::for_recommendation(&recommendation, outcome, reason, Utc::now());

        self.learner.record_feedback(user_id, event).await?;

        let invalidate = self.learner.should_invalidate_cache(user_id).await?;
        if invalidate {
            self.cache.invalidate(user_id).await?;
        }
        Ok(invalidate)
    }

    /// Looks a cached recommendation up in the first responsive library of its
    /// kind and adds it there
    pub async fn add_to_library(&self, user_id: &str, recommendation_id: Uuid) -> EngineResult<()> {
        if !self.reachability.is_online() {
            return Err(EngineError::recommendation(
                RecommendationErrorCode::OfflineActionDisabled,
                "Adding to the library requires a network connection",
            ));
        }

        let recommendation = self.cached_recommendation(user_id, recommendation_id).await?;
        let pool = self.connectors.library_for(recommendation.kind);
        if pool.is_empty() {
            return Err(EngineError::recommendation(
                RecommendationErrorCode::ServiceNotConfigured,
                format!("No {} library service is configured", recommendation.kind),
            ));
        }

        let result = pool
            .first_responsive(|library| {
                let title = recommendation.title.clone();
                let year = recommendation.year;
                async move {
                    let found = library
                        .lookup(&title, year)
                        .await?
                        .ok_or_else(|| ConnectorError::InvalidResponse(format!("{} not found", title)))?;
                    if !found.in_library {
                        library.add(&found).await?;
                    }
                    Ok::<_, ConnectorError>(())
                }
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(user_id = %user_id, title = %recommendation.title, "Recommendation added to library");
                Ok(())
            }
            Err(ConnectorError::Misconfigured(service, missing)) => Err(EngineError::recommendation(
                RecommendationErrorCode::ServiceMisconfigured,
                format!("{} is missing {}", service, missing),
            )),
            Err(ConnectorError::NotConfigured(service)) => Err(EngineError::recommendation(
                RecommendationErrorCode::ServiceNotConfigured,
                format!("No {} service is configured", service),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn cached_recommendation(
        &self,
        user_id: &str,
        recommendation_id: Uuid,
    ) -> EngineResult<Recommendation> {
        let entry = self.cache.get(user_id).await?.ok_or_else(|| {
            EngineError::recommendation(
                RecommendationErrorCode::NoCache,
                "No recommendations have been generated for this user",
            )
        })?;

        entry.find(recommendation_id).cloned().ok_or_else(|| {
            EngineError::recommendation(
                RecommendationErrorCode::NotFound,
                format!("Recommendation {} not found", recommendation_id),
            )
        })
    }

    async fn serve_offline(&self, user_id: &str) -> EngineResult<RecommendationResponse> {
        let entry = self.cache.get(user_id).await?.ok_or_else(|| {
            EngineError::recommendation(
                RecommendationErrorCode::OfflineNoCache,
                "Offline and no cached recommendations are available",
            )
        })?;

        let now = Utc::now();
        let is_stale = !self.cache.is_fresh(&entry, now);
        let mut response = cached_response(entry, now, true, is_stale);

        // The cached set cannot be regenerated offline, so exclusions apply here
        let settings = self.settings.current();
        let rejected = self.not_interested(user_id).await;
        response.recommendations.retain(|r| {
            !rejected.iter().any(|t| eq_ignore_case(t, &r.title))
                && !r.genres.iter().any(|g| settings.is_excluded_genre(g))
        });

        tracing::info!(user_id = %user_id, "Offline, serving cached recommendations");
        Ok(response)
    }

    /// Serves whatever is cached, regardless of age or fingerprint, or
    /// propagates `error` when nothing is
    async fn fallback_to_cache(
        &self,
        user_id: &str,
        error: EngineError,
    ) -> EngineResult<RecommendationResponse> {
        match self.cache.get(user_id).await {
            Ok(Some(entry)) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %error,
                    "Falling back to cached recommendations"
                );
                Ok(cached_response(entry, Utc::now(), false, true))
            }
            Ok(None) => Err(error),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Cache unavailable for fallback");
                Err(error)
            }
        }
    }

    fn schedule_retry(&self, user_id: &str, run_at: DateTime<Utc>) {
        let Some(tx) = &self.retry_tx else {
            return;
        };
        let retry = ScheduledRetry {
            user_id: user_id.to_string(),
            run_at,
        };
        if tx.send(retry).is_err() {
            tracing::warn!(user_id = %user_id, "Retry scheduler is gone, dropping retry");
        }
    }

    async fn not_interested(&self, user_id: &str) -> Vec<String> {
        self.learner
            .not_interested_titles(user_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id = %user_id, error = %e, "Could not load rejected titles");
                Vec::new()
            })
    }

    /// Gates, generates and filters a fresh set
    async fn generate(
        &self,
        user_id: &str,
        context: &UserContext,
        settings: &RecommendationSettings,
        limit: usize,
        include_hidden_gems: bool,
    ) -> EngineResult<Vec<Recommendation>> {
        self.throttle.check_rate_limit(user_id)?;
        self.provider_limiter
            .check(&self.config.provider, OperationKind::Recommendation)?;

        let not_interested = self.not_interested(user_id).await;
        let request = prompt::build_request(
            context,
            settings,
            limit,
            include_hidden_gems,
            &not_interested,
            self.config.provider_options.clone(),
        );

        let mut recommendations = self.call_with_retry(user_id, &request).await?;
        self.provider_limiter
            .record_success(&self.config.provider, OperationKind::Recommendation);

        recommendations.retain(|r| {
            !not_interested.iter().any(|t| eq_ignore_case(t, &r.title))
                && !r.genres.iter().any(|g| settings.is_excluded_genre(g))
        });
        recommendations.truncate(limit);
        Ok(recommendations)
    }

    /// Bounded retry loop with the throttle's backoff between attempts.
    /// Quota rotation replays inside an attempt and does not use one up.
    async fn call_with_retry(
        &self,
        user_id: &str,
        request: &GenerationRequest,
    ) -> EngineResult<Vec<Recommendation>> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let error = match self.attempt_with_rotation(request).await {
                Ok(recommendations) => return Ok(recommendations),
                Err(e @ EngineError::ProviderExhausted { .. }) => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= max_attempts {
                tracing::error!(user_id = %user_id, attempts = attempt, error = %error, "Generation failed");
                return Err(error);
            }

            let delay = self.throttle.backoff_delay(user_id);
            tracing::warn!(
                user_id = %user_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Generation attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_with_rotation(
        &self,
        request: &GenerationRequest,
    ) -> EngineResult<Vec<Recommendation>> {
        let provider = &self.config.provider;
        let credential = self
            .key_pool
            .get_current_key(provider)
            .await
            .ok_or_else(|| EngineError::ProviderExhausted {
                provider: provider.clone(),
            })?;

        match self.generate_once(request, &credential).await {
            Err(GenerationError::QuotaExceeded { .. }) => {
                let next = self
                    .key_pool
                    .handle_quota_exceeded_for(provider, &credential.id)
                    .await
                    .ok_or_else(|| EngineError::ProviderExhausted {
                        provider: provider.clone(),
                    })?;
                self.generate_once(request, &next)
                    .await
                    .map_err(generation_error)
            }
            other => other.map_err(generation_error),
        }
    }

    async fn generate_once(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<Vec<Recommendation>, GenerationError> {
        let value = self.generator.generate_structured(request, credential).await?;
        prompt::parse_recommendations(value)
    }
}

fn generation_error(error: GenerationError) -> EngineError {
    match error {
        GenerationError::QuotaExceeded { retry_after } => {
            let wait = retry_after.unwrap_or(DEFAULT_QUOTA_RESET);
            EngineError::RateLimit {
                scope: RateLimitScope::ProviderQuota,
                reset_at: Utc::now()
                    + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::minutes(1)),
            }
        }
        other => EngineError::AiService(other.to_string()),
    }
}

fn cached_response(
    entry: CacheEntry,
    now: DateTime<Utc>,
    is_offline: bool,
    is_stale: bool,
) -> RecommendationResponse {
    RecommendationResponse {
        cache_age_ms: Some(entry.age_at(now).num_milliseconds().max(0)),
        recommendations: entry.recommendations,
        generated_at: entry.generated_at,
        is_offline,
        is_stale,
        context: None,
    }
}

fn context_summary(context: &UserContext) -> ContextSummary {
    ContextSummary {
        watch_history_count: context.watch_history.len(),
        favorite_genres: context.preferences.favorite_genres.clone(),
        schema_version: CACHE_SCHEMA_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::MemoryStore,
        models::{LibraryStatistics, MediaKind},
        services::{
            generation::{MemoryCredentialStore, MockStructuredGenerator},
            learning::{KvFeedbackLearner, MockFeedbackLearner},
            provider_limiter::ProviderLimits,
            reachability::NetworkMonitor,
            settings::SharedSettings,
            throttle::ThrottleConfig,
        },
    };
    use serde_json::{json, Value};

    const PROVIDER: &str = "openai";

    fn generated(count: usize) -> Value {
        let items: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "title": format!("Title {}", i),
                    "year": 2020,
                    "type": "movie",
                    "genres": ["Drama"],
                    "reasoning": "Because",
                    "matchScore": 90 - i as i64,
                    "isHiddenGem": false
                })
            })
            .collect();
        json!({ "recommendations": items })
    }

    struct Harness {
        store: Arc<MemoryStore>,
        settings: Arc<SharedSettings>,
        monitor: Arc<NetworkMonitor>,
        key_pool: Arc<ProviderKeyPool>,
    }

    impl Harness {
        async fn new(keys: usize) -> Self {
            let secrets: Vec<String> = (0..keys).map(|i| format!("sk-{}", i)).collect();
            let credentials = Arc::new(MemoryCredentialStore::with_keys(PROVIDER, &secrets));
            let key_pool = Arc::new(ProviderKeyPool::new(credentials));
            key_pool.register(PROVIDER).await;

            Self {
                store: Arc::new(MemoryStore::new()),
                settings: Arc::new(SharedSettings::default()),
                monitor: Arc::new(NetworkMonitor::new(true)),
                key_pool,
            }
        }

        fn orchestrator_with(
            &self,
            generator: MockStructuredGenerator,
            learner: Arc<dyn FeedbackLearner>,
        ) -> RecommendationOrchestrator {
            let throttle = RequestThrottle::new(ThrottleConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            });
            RecommendationOrchestrator::new(
                Collaborators {
                    store: self.store.clone(),
                    generator: Arc::new(generator),
                    key_pool: self.key_pool.clone(),
                    learner,
                    connectors: MediaConnectors::none(),
                    reachability: self.monitor.clone(),
                    settings: self.settings.clone(),
                    throttle: Arc::new(throttle),
                    provider_limiter: Arc::new(ProviderLimiter::new(ProviderLimits::default())),
                },
                OrchestratorConfig {
                    source_timeout: Duration::from_millis(100),
                    ..Default::default()
                },
            )
        }

        fn orchestrator(&self, generator: MockStructuredGenerator) -> RecommendationOrchestrator {
            let learner = Arc::new(KvFeedbackLearner::new(self.store.clone()));
            self.orchestrator_with(generator, learner)
        }

        /// The context the builder produces when no connectors are configured
        fn empty_context(&self, user_id: &str) -> UserContext {
            UserContext {
                user_id: user_id.to_string(),
                watch_history: vec![],
                library: LibraryStatistics::default(),
                preferences: self.settings.current().preferences(),
                feedback_patterns: vec![],
            }
        }

        async fn seed_cache(&self, user_id: &str, fingerprint: &str, age: chrono::Duration) -> CacheEntry {
            let recommendations = prompt::parse_recommendations(generated(4)).unwrap();
            let entry = CacheEntry::new(user_id, recommendations, fingerprint, Utc::now() - age);
            let cache = RecommendationCache::new(self.store.clone(), self.settings.clone());
            cache.set(&entry).await.unwrap();
            entry
        }
    }

    #[tokio::test]
    async fn test_fresh_generation_on_empty_cache() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .times(1)
            .returning(|_, _| Ok(generated(10)));
        let orchestrator = harness.orchestrator(generator);

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();

        assert_eq!(response.recommendations.len(), 10);
        assert!(response.cache_age_ms.is_none());
        assert!(!response.is_offline);
        assert!(!response.is_stale);
        assert!((Utc::now() - response.generated_at).num_seconds() < 5);
        assert_eq!(response.context.unwrap().schema_version, CACHE_SCHEMA_VERSION);

        let cached = orchestrator.cache().get("u1").await.unwrap().unwrap();
        assert_eq!(cached.recommendations, response.recommendations);
    }

    #[tokio::test]
    async fn test_limit_is_clamped_into_request() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .withf(|request, _| request.prompt.contains("exactly 3 titles"))
            .times(1)
            .returning(|_, _| Ok(generated(5)));
        let orchestrator = harness.orchestrator(generator);

        let query = RecommendationQuery {
            limit: Some(1),
            ..Default::default()
        };
        let response = orchestrator.get_recommendations("u1", &query).await.unwrap();
        assert_eq!(response.recommendations.len(), 3);
    }

    #[tokio::test]
    async fn test_valid_cache_is_served_without_generation() {
        let harness = Harness::new(1).await;
        let fp = fingerprint(&harness.empty_context("u1"));
        let entry = harness.seed_cache("u1", &fp, chrono::Duration::hours(1)).await;

        let mut generator = MockStructuredGenerator::new();
        generator.expect_generate_structured().times(0);
        let orchestrator = harness.orchestrator(generator);

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();

        assert_eq!(response.recommendations, entry.recommendations);
        let age = response.cache_age_ms.unwrap();
        assert!((3_600_000..3_605_000).contains(&age), "age was {}", age);
    }

    #[tokio::test]
    async fn test_offline_without_cache_fails() {
        let harness = Harness::new(1).await;
        harness.monitor.set_online(false);
        let mut generator = MockStructuredGenerator::new();
        generator.expect_generate_structured().times(0);
        let orchestrator = harness.orchestrator(generator);

        let err = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "OFFLINE_NO_CACHE");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_offline_serves_cache_without_rejected_titles() {
        let harness = Harness::new(1).await;
        let entry = harness
            .seed_cache("u1", "old-fingerprint", chrono::Duration::hours(48))
            .await;
        let rejected = entry.recommendations[0].title.clone();

        let mut learner = MockFeedbackLearner::new();
        learner
            .expect_not_interested_titles()
            .returning(move |_| Ok(vec![rejected.to_uppercase()]));
        harness.monitor.set_online(false);
        let orchestrator = harness.orchestrator_with(MockStructuredGenerator::new(), Arc::new(learner));

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();

        assert!(response.is_offline);
        assert!(response.is_stale);
        assert_eq!(response.recommendations.len(), 3);
        assert!(response.cache_age_ms.is_some());
    }

    #[tokio::test]
    async fn test_quota_exceeded_rotates_and_replays() {
        let harness = Harness::new(2).await;
        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .withf(|_, credential| credential.id == "openai-1")
            .times(1)
            .returning(|_, _| Err(GenerationError::QuotaExceeded { retry_after: None }));
        generator
            .expect_generate_structured()
            .withf(|_, credential| credential.id == "openai-2")
            .times(1)
            .returning(|_, _| Ok(generated(10)));
        let orchestrator = harness.orchestrator(generator);

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();

        assert_eq!(response.recommendations.len(), 10);
        assert!(response.cache_age_ms.is_none());
        let state = harness.key_pool.state(PROVIDER).unwrap();
        assert_eq!(state.rotation_count, 1);
        assert_eq!(state.current_key_id.as_deref(), Some("openai-2"));
    }

    #[tokio::test]
    async fn test_all_keys_exhausted_is_surfaced() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .times(1)
            .returning(|_, _| Err(GenerationError::QuotaExceeded { retry_after: None }));
        let orchestrator = harness.orchestrator(generator);

        let err = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ProviderExhausted { .. }));
        assert!(harness.key_pool.is_blocked(PROVIDER));
    }

    #[tokio::test]
    async fn test_generic_failure_retries_then_falls_back_to_stale_cache() {
        let harness = Harness::new(1).await;
        let entry = harness
            .seed_cache("u1", "outdated", chrono::Duration::hours(2))
            .await;

        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .times(3)
            .returning(|_, _| {
                Err(GenerationError::Api {
                    status: 500,
                    body: "upstream".to_string(),
                })
            });
        let orchestrator = harness.orchestrator(generator);

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();

        assert!(response.is_stale);
        assert_eq!(response.recommendations, entry.recommendations);
    }

    #[tokio::test]
    async fn test_generic_failure_without_cache_propagates() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .times(3)
            .returning(|_, _| Err(GenerationError::Parse("bad json".to_string())));
        let orchestrator = harness.orchestrator(generator);

        let err = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AiService(_)));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_later_attempt() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        let mut calls = 0;
        generator
            .expect_generate_structured()
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    Err(GenerationError::Request("connection reset".to_string()))
                } else {
                    Ok(generated(10))
                }
            });
        let orchestrator = harness.orchestrator(generator);

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();
        assert_eq!(response.recommendations.len(), 10);
    }

    #[tokio::test]
    async fn test_user_rate_limit_schedules_retry() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .times(2)
            .returning(|_, _| Ok(generated(10)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = harness.orchestrator(generator).with_retry_sender(tx);

        let forced = RecommendationQuery {
            force_refresh: true,
            ..Default::default()
        };
        orchestrator.get_recommendations("u1", &forced).await.unwrap();
        orchestrator.get_recommendations("u1", &forced).await.unwrap();
        orchestrator.cache().invalidate("u1").await.unwrap();

        let err = orchestrator
            .get_recommendations("u1", &forced)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RateLimit {
                scope: RateLimitScope::User,
                ..
            }
        ));

        let retry = rx.try_recv().unwrap();
        assert_eq!(retry.user_id, "u1");
        assert_eq!(Some(retry.run_at), err.reset_at());
    }

    #[tokio::test]
    async fn test_rate_limited_user_gets_stale_cache() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .times(2)
            .returning(|_, _| Ok(generated(10)));
        let orchestrator = harness.orchestrator(generator);

        let forced = RecommendationQuery {
            force_refresh: true,
            ..Default::default()
        };
        orchestrator.get_recommendations("u1", &forced).await.unwrap();
        orchestrator.get_recommendations("u1", &forced).await.unwrap();

        let response = orchestrator.get_recommendations("u1", &forced).await.unwrap();
        assert!(response.is_stale);
        assert_eq!(response.recommendations.len(), 10);
    }

    #[tokio::test]
    async fn test_not_interested_and_excluded_genres_are_filtered() {
        let harness = Harness::new(1).await;
        harness
            .settings
            .update(|s| s.excluded_genres = vec!["horror".to_string()]);

        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .withf(|request, _| request.prompt.contains("title 0"))
            .returning(|_, _| {
                let mut value = generated(5);
                value["recommendations"][1]["genres"] = json!(["Horror"]);
                Ok(value)
            });

        let mut learner = MockFeedbackLearner::new();
        learner
            .expect_not_interested_titles()
            .returning(|_| Ok(vec!["title 0".to_string()]));
        learner.expect_patterns().returning(|_| Ok(vec![]));
        let orchestrator = harness.orchestrator_with(generator, Arc::new(learner));

        let query = RecommendationQuery {
            limit: Some(5),
            ..Default::default()
        };
        let response = orchestrator.get_recommendations("u1", &query).await.unwrap();
        let titles: Vec<&str> = response
            .recommendations
            .iter()
            .map(|r| r.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Title 2", "Title 3", "Title 4"]);
    }

    #[tokio::test]
    async fn test_excluding_a_genre_invalidates_cached_set() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator.expect_generate_structured().times(2).returning(|_, _| {
            let mut value = generated(10);
            for i in (1..10).step_by(2) {
                value["recommendations"][i]["genres"] = json!(["Comedy"]);
            }
            Ok(value)
        });
        let orchestrator = harness.orchestrator(generator);

        let first = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();
        assert_eq!(first.recommendations.len(), 10);

        harness
            .settings
            .update(|s| s.excluded_genres = vec!["Drama".to_string()]);

        let second = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();
        assert!(second.cache_age_ms.is_none());
        assert_eq!(second.recommendations.len(), 5);
        assert!(second
            .recommendations
            .iter()
            .all(|r| !r.genres.iter().any(|g| g == "Drama")));
    }

    #[tokio::test]
    async fn test_offline_cache_honors_excluded_genres() {
        let harness = Harness::new(1).await;
        harness.seed_cache("u1", "fp", chrono::Duration::hours(1)).await;
        harness
            .settings
            .update(|s| s.excluded_genres = vec!["drama".to_string()]);
        harness.monitor.set_online(false);
        let orchestrator = harness.orchestrator(MockStructuredGenerator::new());

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();
        assert!(response.is_offline);
        assert!(response.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_titles_match_across_unicode_case() {
        let harness = Harness::new(1).await;
        let mut generator = MockStructuredGenerator::new();
        generator.expect_generate_structured().returning(|_, _| {
            let mut value = generated(5);
            value["recommendations"][0]["title"] = json!("Amélie");
            Ok(value)
        });

        let mut learner = MockFeedbackLearner::new();
        learner
            .expect_not_interested_titles()
            .returning(|_| Ok(vec!["AMÉLIE".to_string()]));
        learner.expect_patterns().returning(|_| Ok(vec![]));
        let orchestrator = harness.orchestrator_with(generator, Arc::new(learner));

        let response = orchestrator
            .get_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();
        let titles: Vec<&str> = response
            .recommendations
            .iter()
            .map(|r| r.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Title 1", "Title 2", "Title 3", "Title 4"]);
    }

    #[tokio::test]
    async fn test_feedback_requires_cached_set() {
        let harness = Harness::new(1).await;
        let orchestrator = harness.orchestrator(MockStructuredGenerator::new());

        let err = orchestrator
            .record_feedback("u1", Uuid::new_v4(), FeedbackOutcome::Accepted, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_CACHE");

        harness.seed_cache("u1", "fp", chrono::Duration::zero()).await;
        let err = orchestrator
            .record_feedback("u1", Uuid::new_v4(), FeedbackOutcome::Accepted, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_rejection_invalidates_cache() {
        let harness = Harness::new(1).await;
        let entry = harness.seed_cache("u1", "fp", chrono::Duration::zero()).await;
        let orchestrator = harness.orchestrator(MockStructuredGenerator::new());

        let invalidated = orchestrator
            .record_feedback(
                "u1",
                entry.recommendations[0].id,
                FeedbackOutcome::Accepted,
                None,
            )
            .await
            .unwrap();
        assert!(!invalidated);
        assert!(orchestrator.cache().get("u1").await.unwrap().is_some());

        let invalidated = orchestrator
            .record_feedback(
                "u1",
                entry.recommendations[1].id,
                FeedbackOutcome::Rejected,
                Some(RejectionReason::NotInterested),
            )
            .await
            .unwrap();
        assert!(invalidated);
        assert!(orchestrator.cache().get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_to_library_errors() {
        let harness = Harness::new(1).await;
        let entry = harness.seed_cache("u1", "fp", chrono::Duration::zero()).await;
        let orchestrator = harness.orchestrator(MockStructuredGenerator::new());
        let id = entry.recommendations[0].id;
        assert_eq!(entry.recommendations[0].kind, MediaKind::Movie);

        let err = orchestrator.add_to_library("u1", id).await.unwrap_err();
        assert_eq!(err.code(), "SERVICE_NOT_CONFIGURED");

        let err = orchestrator.add_to_library("u2", id).await.unwrap_err();
        assert_eq!(err.code(), "NO_CACHE");

        harness.monitor.set_online(false);
        let err = orchestrator.add_to_library("u1", id).await.unwrap_err();
        assert_eq!(err.code(), "OFFLINE_ACTION_DISABLED");
    }

    #[tokio::test]
    async fn test_refresh_bypasses_valid_cache() {
        let harness = Harness::new(1).await;
        let fp = fingerprint(&harness.empty_context("u1"));
        harness.seed_cache("u1", &fp, chrono::Duration::minutes(5)).await;

        let mut generator = MockStructuredGenerator::new();
        generator
            .expect_generate_structured()
            .times(1)
            .returning(|_, _| Ok(generated(10)));
        let orchestrator = harness.orchestrator(generator);

        let response = orchestrator
            .refresh_recommendations("u1", &RecommendationQuery::default())
            .await
            .unwrap();
        assert_eq!(response.recommendations.len(), 10);
        assert!(response.cache_age_ms.is_none());
    }
}
