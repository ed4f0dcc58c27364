//! Network reachability. The orchestrator samples the current state at the
//! start of each request; transitions are published on a watch channel.
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

pub trait Reachability: Send + Sync {
    fn is_online(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    sender: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = watch::channel(initially_online);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Records the current state, notifying subscribers only on a transition
    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            tracing::info!(online, "Network reachability changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Periodically probes `url` and updates the state from the outcome
    pub fn spawn_probe(&self, url: String, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let online = match client.head(&url).send().await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::debug!(error = %e, url = %url, "Reachability probe failed");
                        false
                    }
                };
                monitor.set_online(online);
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Reachability for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_published() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());

        // Same state again is not a transition
        monitor.set_online(false);
        assert!(!rx.has_changed().unwrap());

        monitor.set_online(true);
        assert!(monitor.is_online());
    }
}
