//! Background precompute: periodically refreshes stale caches for known users
//! and runs retries the orchestrator scheduled after rate limits.
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    models::RecommendationQuery,
    services::orchestrator::{RecommendationOrchestrator, ScheduledRetry},
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Throttle state idle longer than this is dropped on each tick
    pub throttle_idle: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            throttle_idle: chrono::Duration::hours(2),
        }
    }
}

/// What one precompute pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Stops the scheduler loop when triggered or dropped
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

pub struct BackgroundScheduler {
    orchestrator: Arc<RecommendationOrchestrator>,
    config: SchedulerConfig,
    pending_retries: Arc<DashSet<String>>,
}

impl BackgroundScheduler {
    pub fn new(orchestrator: Arc<RecommendationOrchestrator>, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            pending_retries: Arc::new(DashSet::new()),
        }
    }

    /// Spawns the scheduler loop. `retries` receives the orchestrator's
    /// scheduled retries.
    pub fn start(self, mut retries: mpsc::UnboundedReceiver<ScheduledRetry>) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            // The first tick completes immediately; precompute waits a full interval
            ticker.tick().await;

            tracing::info!(interval = ?self.config.interval, "Background scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    Some(retry) = retries.recv() => {
                        self.spawn_retry(retry);
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Background scheduler stopping");
                        break;
                    }
                }
            }
        });

        SchedulerHandle { shutdown, task }
    }

    /// One precompute pass over every known user, sequentially
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let pruned = self
            .orchestrator
            .throttle()
            .prune_inactive_at(now, self.config.throttle_idle);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned idle throttle state");
        }

        let mut report = TickReport::default();
        if !self.orchestrator.settings().background_updates_enabled {
            tracing::debug!("Background updates disabled, skipping precompute");
            return report;
        }
        if !self.orchestrator.is_online() {
            tracing::debug!("Offline, skipping precompute");
            return report;
        }

        let users = match self.orchestrator.cache().known_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::error!(error = %e, "Could not list cached users");
                return report;
            }
        };

        for user_id in users {
            let fresh = match self.orchestrator.cache().get(&user_id).await {
                Ok(Some(entry)) => self.orchestrator.cache().is_fresh(&entry, now),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Cache read failed");
                    false
                }
            };
            if fresh {
                report.skipped += 1;
                continue;
            }

            match self.refresh(&user_id).await {
                Ok(()) => report.refreshed += 1,
                Err(()) => report.failed += 1,
            }
        }

        tracing::info!(
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            "Background precompute finished"
        );
        report
    }

    async fn refresh(&self, user_id: &str) -> Result<(), ()> {
        let query = RecommendationQuery {
            force_refresh: true,
            ..Default::default()
        };
        match self.orchestrator.get_recommendations(user_id, &query).await {
            Ok(response) if response.is_stale => {
                tracing::warn!(user_id = %user_id, "Precompute fell back to stale cache");
                Err(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Precompute failed");
                Err(())
            }
        }
    }

    /// Runs a retry as a detached task at its reset time. At most one retry
    /// is pending per user.
    fn spawn_retry(&self, retry: ScheduledRetry) {
        if !self.pending_retries.insert(retry.user_id.clone()) {
            tracing::debug!(user_id = %retry.user_id, "Retry already pending");
            return;
        }

        let orchestrator = self.orchestrator.clone();
        let pending = self.pending_retries.clone();
        let wait = (retry.run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tracing::info!(user_id = %retry.user_id, run_at = %retry.run_at, "Scheduled retry after rate limit");
        let user_id = retry.user_id;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            pending.remove(&user_id);

            let query = RecommendationQuery {
                force_refresh: true,
                ..Default::default()
            };
            match orchestrator.get_recommendations(&user_id, &query).await {
                Ok(_) => tracing::info!(user_id = %user_id, "Scheduled retry completed"),
                Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Scheduled retry failed"),
            }
        });
    }
}
