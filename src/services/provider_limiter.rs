//! Global per-provider ceilings, independent of which user is asking.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

use crate::error::{EngineError, EngineResult, RateLimitScope};

/// Kind of operation a provider call performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Search,
    Recommendation,
}

#[derive(Debug, Clone)]
pub struct ProviderLimits {
    pub requests_per_minute: usize,
    pub requests_per_day: usize,
    pub search_per_day: usize,
    pub recommendations_per_day: usize,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 15,
            requests_per_day: 1500,
            search_per_day: 100,
            recommendations_per_day: 50,
        }
    }
}

#[derive(Debug, Default)]
struct ProviderUsage {
    /// Successful calls, oldest first
    calls: VecDeque<(DateTime<Utc>, OperationKind)>,
}

impl ProviderUsage {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::days(1);
        while self.calls.front().is_some_and(|(t, _)| *t <= horizon) {
            self.calls.pop_front();
        }
    }

    fn matching(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        kind: Option<OperationKind>,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.calls
            .iter()
            .filter(move |(t, k)| *t > now - window && kind.map_or(true, |kind| *k == kind))
            .map(|(t, _)| *t)
    }

    /// Reset time if `limit` calls already happened inside `window`
    fn exceeded(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        kind: Option<OperationKind>,
        limit: usize,
    ) -> Option<DateTime<Utc>> {
        let mut calls = self.matching(now, window, kind);
        let oldest = calls.next()?;
        let count = 1 + calls.count();
        (count >= limit).then_some(oldest + window)
    }
}

/// Coarse limiter applied before any generation call is attempted.
///
/// Only successful calls are recorded, so failures never consume the budget.
#[derive(Debug, Default)]
pub struct ProviderLimiter {
    limits: ProviderLimits,
    usage: DashMap<String, ProviderUsage>,
}

impl ProviderLimiter {
    pub fn new(limits: ProviderLimits) -> Self {
        Self {
            limits,
            usage: DashMap::new(),
        }
    }

    pub fn check(&self, provider: &str, kind: OperationKind) -> EngineResult<()> {
        self.check_at(provider, kind, Utc::now())
    }

    pub fn check_at(
        &self,
        provider: &str,
        kind: OperationKind,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut usage = self.usage.entry(provider.to_string()).or_default();
        usage.prune(now);

        let per_kind_limit = match kind {
            OperationKind::Search => self.limits.search_per_day,
            OperationKind::Recommendation => self.limits.recommendations_per_day,
        };

        let reset_at = usage
            .exceeded(now, Duration::minutes(1), None, self.limits.requests_per_minute)
            .or_else(|| usage.exceeded(now, Duration::days(1), None, self.limits.requests_per_day))
            .or_else(|| usage.exceeded(now, Duration::days(1), Some(kind), per_kind_limit));

        match reset_at {
            Some(reset_at) => {
                tracing::warn!(
                    provider = %provider,
                    operation = ?kind,
                    reset_at = %reset_at,
                    "Provider ceiling reached"
                );
                Err(EngineError::RateLimit {
                    scope: RateLimitScope::Provider,
                    reset_at,
                })
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self, provider: &str, kind: OperationKind) {
        self.record_success_at(provider, kind, Utc::now());
    }

    pub fn record_success_at(&self, provider: &str, kind: OperationKind, now: DateTime<Utc>) {
        let mut usage = self.usage.entry(provider.to_string()).or_default();
        usage.prune(now);
        usage.calls.push_back((now, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> ProviderLimiter {
        ProviderLimiter::new(ProviderLimits {
            requests_per_minute: 3,
            requests_per_day: 5,
            search_per_day: 2,
            recommendations_per_day: 4,
        })
    }

    #[test]
    fn test_checks_do_not_consume_budget() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..10 {
            limiter
                .check_at("openai", OperationKind::Recommendation, now)
                .unwrap();
        }
    }

    #[test]
    fn test_per_minute_ceiling() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..3 {
            limiter.record_success_at("openai", OperationKind::Recommendation, now);
        }
        let err = limiter
            .check_at("openai", OperationKind::Recommendation, now)
            .unwrap_err();
        assert_eq!(err.reset_at(), Some(now + Duration::minutes(1)));

        // Another provider is unaffected
        assert!(limiter
            .check_at("gemini", OperationKind::Recommendation, now)
            .is_ok());
    }

    #[test]
    fn test_per_operation_daily_ceiling() {
        let limiter = limiter();
        let t0 = Utc::now();
        limiter.record_success_at("openai", OperationKind::Search, t0);
        limiter.record_success_at("openai", OperationKind::Search, t0 + Duration::minutes(5));

        let later = t0 + Duration::minutes(10);
        assert!(limiter
            .check_at("openai", OperationKind::Search, later)
            .is_err());
        assert!(limiter
            .check_at("openai", OperationKind::Recommendation, later)
            .is_ok());
    }

    #[test]
    fn test_daily_ceiling_expires() {
        let limiter = limiter();
        let t0 = Utc::now();
        for i in 0..5 {
            limiter.record_success_at(
                "openai",
                OperationKind::Recommendation,
                t0 + Duration::minutes(i * 10),
            );
        }
        let err = limiter
            .check_at("openai", OperationKind::Recommendation, t0 + Duration::hours(2))
            .unwrap_err();
        assert_eq!(err.reset_at(), Some(t0 + Duration::days(1)));

        assert!(limiter
            .check_at(
                "openai",
                OperationKind::Recommendation,
                t0 + Duration::days(1) + Duration::minutes(11)
            )
            .is_ok());
    }
}
