//! Feedback collection and the acceptance patterns learned from it.
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;

use crate::{
    db::{get_json, set_json, KeyValueStore, StoreResult},
    models::{eq_ignore_case, FeedbackEvent, FeedbackPattern},
};

const FEEDBACK_PREFIX: &str = "recommendation_feedback:";

/// Oldest events are dropped past this many per user
const MAX_EVENTS_PER_USER: usize = 500;

/// Samples at which a pattern reaches full confidence
const FULL_CONFIDENCE_SAMPLES: f64 = 20.0;

/// Every this many events, accumulated feedback justifies regenerating
const INVALIDATE_EVERY: usize = 5;

/// Consumer-side view of the learning component
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedbackLearner: Send + Sync {
    async fn record_feedback(&self, user_id: &str, event: FeedbackEvent) -> StoreResult<()>;

    /// Per-factor acceptance rates, sorted by factor
    async fn patterns(&self, user_id: &str) -> StoreResult<Vec<FeedbackPattern>>;

    /// Titles the user explicitly rejected as not interesting
    async fn not_interested_titles(&self, user_id: &str) -> StoreResult<Vec<String>>;

    async fn should_invalidate_cache(&self, user_id: &str) -> StoreResult<bool>;
}

/// Learner persisting raw events in the key-value store
pub struct KvFeedbackLearner {
    store: Arc<dyn KeyValueStore>,
    // Serializes read-modify-write of the event lists
    write_lock: Mutex<()>,
}

impl KvFeedbackLearner {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn key(user_id: &str) -> String {
        format!("{}{}", FEEDBACK_PREFIX, user_id)
    }

    pub async fn events(&self, user_id: &str) -> StoreResult<Vec<FeedbackEvent>> {
        Ok(get_json(self.store.as_ref(), &Self::key(user_id))
            .await?
            .unwrap_or_default())
    }
}

/// Aggregates events into `genre:<name>` and `type:<kind>` factors
pub fn derive_patterns(events: &[FeedbackEvent]) -> Vec<FeedbackPattern> {
    let mut tallies: BTreeMap<String, (u32, u32)> = BTreeMap::new();

    for event in events {
        let positive = u32::from(event.outcome.is_positive());
        let factors = event
            .genres
            .iter()
            .map(|g| format!("genre:{}", g.to_lowercase()))
            .chain(std::iter::once(format!("type:{}", event.kind)));

        for factor in factors {
            let tally = tallies.entry(factor).or_insert((0, 0));
            tally.0 += positive;
            tally.1 += 1;
        }
    }

    tallies
        .into_iter()
        .map(|(factor, (accepted, samples))| FeedbackPattern {
            factor,
            acceptance_rate: f64::from(accepted) / f64::from(samples),
            sample_size: samples,
            confidence: (f64::from(samples) / FULL_CONFIDENCE_SAMPLES).min(1.0),
        })
        .collect()
}

#[async_trait]
impl FeedbackLearner for KvFeedbackLearner {
    async fn record_feedback(&self, user_id: &str, event: FeedbackEvent) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut events = self.events(user_id).await?;
        events.push(event);
        if events.len() > MAX_EVENTS_PER_USER {
            let overflow = events.len() - MAX_EVENTS_PER_USER;
            events.drain(..overflow);
        }

        set_json(self.store.as_ref(), &Self::key(user_id), &events).await?;
        tracing::debug!(user_id = %user_id, total = events.len(), "Recorded feedback");
        Ok(())
    }

    async fn patterns(&self, user_id: &str) -> StoreResult<Vec<FeedbackPattern>> {
        Ok(derive_patterns(&self.events(user_id).await?))
    }

    async fn not_interested_titles(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let mut titles: Vec<String> = self
            .events(user_id)
            .await?
            .into_iter()
            .filter(FeedbackEvent::is_not_interested)
            .map(|e| e.title)
            .collect();
        titles.sort_by_key(|t| t.to_lowercase());
        titles.dedup_by(|a, b| eq_ignore_case(a, b));
        Ok(titles)
    }

    async fn should_invalidate_cache(&self, user_id: &str) -> StoreResult<bool> {
        let events = self.events(user_id).await?;
        let Some(latest) = events.last() else {
            return Ok(false);
        };
        Ok(!latest.outcome.is_positive() || events.len() % INVALIDATE_EVERY == 0)
    }
}
