//! Per-user request throttling in front of the generation call.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

use crate::error::{EngineError, EngineResult, RateLimitScope};

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_requests_per_minute: usize,
    pub max_requests_per_hour: usize,
    pub base_delay: std::time::Duration,
    pub max_delay: std::time::Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 2,
            max_requests_per_hour: 10,
            base_delay: std::time::Duration::from_secs(1),
            max_delay: std::time::Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct ThrottleState {
    /// Oldest first
    timestamps: VecDeque<DateTime<Utc>>,
    consecutive_hits: u32,
    reset_at: Option<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

impl ThrottleState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamps: VecDeque::new(),
            consecutive_hits: 0,
            reset_at: None,
            last_seen: now,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(1);
        while self.timestamps.front().is_some_and(|t| *t <= horizon) {
            self.timestamps.pop_front();
        }
    }

    /// Oldest call inside the window ending at `now`, if any
    fn oldest_within(&self, now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
        self.timestamps.iter().copied().find(|t| *t > now - window)
    }

    fn count_within(&self, now: DateTime<Utc>, window: Duration) -> usize {
        self.timestamps.iter().filter(|t| **t > now - window).count()
    }
}

/// Sliding-window limiter keyed by user id.
///
/// Each user's state is mutated under its map entry lock, so concurrent
/// requests for the same user never lose a timestamp.
#[derive(Debug, Default)]
pub struct RequestThrottle {
    config: ThrottleConfig,
    states: DashMap<String, ThrottleState>,
}

impl RequestThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn check_rate_limit(&self, user_id: &str) -> EngineResult<()> {
        self.check_rate_limit_at(user_id, Utc::now())
    }

    /// Admits or rejects one generation call for `user_id` at `now`
    pub fn check_rate_limit_at(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let mut state = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| ThrottleState::new(now));
        state.last_seen = now;
        state.prune(now);

        let minute = Duration::minutes(1);
        let hour = Duration::hours(1);

        let rejection = if state.count_within(now, minute) >= self.config.max_requests_per_minute {
            Some(state.oldest_within(now, minute).unwrap_or(now) + minute)
        } else if state.count_within(now, hour) >= self.config.max_requests_per_hour {
            Some(state.oldest_within(now, hour).unwrap_or(now) + hour)
        } else {
            None
        };

        if let Some(reset_at) = rejection {
            state.consecutive_hits = state.consecutive_hits.saturating_add(1);
            state.reset_at = Some(reset_at);
            tracing::warn!(
                user_id = %user_id,
                consecutive_hits = state.consecutive_hits,
                reset_at = %reset_at,
                "User rate limit exceeded"
            );
            return Err(EngineError::RateLimit {
                scope: RateLimitScope::User,
                reset_at,
            });
        }

        state.timestamps.push_back(now);
        state.consecutive_hits = 0;
        state.reset_at = None;
        Ok(())
    }

    /// Exponential delay that grows while the user keeps hitting the limiter
    pub fn backoff_delay(&self, user_id: &str) -> std::time::Duration {
        let hits = self
            .states
            .get(user_id)
            .map(|s| s.consecutive_hits)
            .unwrap_or(0);
        let factor = 1u32.checked_shl(hits).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    pub fn reset_at(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.states.get(user_id).and_then(|s| s.reset_at)
    }

    /// Drops state for users not seen within `idle`; returns how many were removed
    pub fn prune_inactive_at(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| now - state.last_seen < idle);
        before - self.states.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> RequestThrottle {
        RequestThrottle::new(ThrottleConfig::default())
    }

    #[test]
    fn test_third_call_within_minute_is_rejected() {
        let throttle = throttle();
        let first = Utc::now();

        assert!(throttle.check_rate_limit_at("u", first).is_ok());
        assert!(throttle
            .check_rate_limit_at("u", first + Duration::seconds(10))
            .is_ok());

        let err = throttle
            .check_rate_limit_at("u", first + Duration::seconds(20))
            .unwrap_err();
        let reset_at = err.reset_at().unwrap();
        assert!(reset_at <= first + Duration::seconds(60));
        assert!(reset_at > first + Duration::seconds(20));
    }

    #[test]
    fn test_minute_window_slides() {
        let throttle = throttle();
        let t0 = Utc::now();
        throttle.check_rate_limit_at("u", t0).unwrap();
        throttle.check_rate_limit_at("u", t0).unwrap();
        assert!(throttle
            .check_rate_limit_at("u", t0 + Duration::seconds(61))
            .is_ok());
    }

    #[test]
    fn test_hourly_ceiling() {
        let throttle = throttle();
        let t0 = Utc::now();
        for i in 0..10 {
            throttle
                .check_rate_limit_at("u", t0 + Duration::minutes(i * 2))
                .unwrap();
        }
        let err = throttle
            .check_rate_limit_at("u", t0 + Duration::minutes(25))
            .unwrap_err();
        assert_eq!(err.reset_at(), Some(t0 + Duration::hours(1)));

        // The first call falls out of the hour window
        assert!(throttle
            .check_rate_limit_at("u", t0 + Duration::minutes(61))
            .is_ok());
    }

    #[test]
    fn test_users_are_independent() {
        let throttle = throttle();
        let t0 = Utc::now();
        throttle.check_rate_limit_at("a", t0).unwrap();
        throttle.check_rate_limit_at("a", t0).unwrap();
        assert!(throttle.check_rate_limit_at("a", t0).is_err());
        assert!(throttle.check_rate_limit_at("b", t0).is_ok());
    }

    #[test]
    fn test_backoff_grows_while_limited_and_resets() {
        let throttle = throttle();
        let t0 = Utc::now();
        assert_eq!(throttle.backoff_delay("u"), std::time::Duration::from_secs(1));

        throttle.check_rate_limit_at("u", t0).unwrap();
        throttle.check_rate_limit_at("u", t0).unwrap();
        let _ = throttle.check_rate_limit_at("u", t0);
        assert_eq!(throttle.backoff_delay("u"), std::time::Duration::from_secs(2));
        let _ = throttle.check_rate_limit_at("u", t0);
        assert_eq!(throttle.backoff_delay("u"), std::time::Duration::from_secs(4));

        throttle
            .check_rate_limit_at("u", t0 + Duration::minutes(2))
            .unwrap();
        assert_eq!(throttle.backoff_delay("u"), std::time::Duration::from_secs(1));
        assert!(throttle.reset_at("u").is_none());
    }

    #[test]
    fn test_backoff_is_capped() {
        let throttle = throttle();
        let t0 = Utc::now();
        throttle.check_rate_limit_at("u", t0).unwrap();
        throttle.check_rate_limit_at("u", t0).unwrap();
        for _ in 0..40 {
            let _ = throttle.check_rate_limit_at("u", t0);
        }
        assert_eq!(throttle.backoff_delay("u"), std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_prune_inactive() {
        let throttle = throttle();
        let t0 = Utc::now();
        throttle.check_rate_limit_at("old", t0).unwrap();
        throttle
            .check_rate_limit_at("new", t0 + Duration::hours(3))
            .unwrap();

        let removed = throttle.prune_inactive_at(t0 + Duration::hours(3), Duration::hours(2));
        assert_eq!(removed, 1);
        assert_eq!(throttle.tracked_users(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_the_ceiling() {
        let throttle = std::sync::Arc::new(throttle());
        let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(16));
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let throttle = throttle.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    throttle.check_rate_limit_at("u", now).is_ok()
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, ThrottleConfig::default().max_requests_per_minute);
    }
}
