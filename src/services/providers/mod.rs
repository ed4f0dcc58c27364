//! Media connector abstraction.
//!
//! The engine only needs a narrow read/search/add surface from the episode and
//! movie library managers and the media server. Several configured instances
//! of the same connector type form a pool; the first one that answers wins.
use async_trait::async_trait;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};

use crate::models::{MediaKind, WatchHistoryItem};

pub mod jellyfin;
pub mod servarr;

pub use jellyfin::JellyfinHistory;
pub use servarr::ServarrConnector;

/// Errors raised by media connectors
#[derive(thiserror::Error, Debug)]
pub enum ConnectorError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0} is missing required setup: {1}")]
    Misconfigured(String, String),

    #[error("No {0} connector configured")]
    NotConfigured(String),
}

/// An item already present in a library
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryItem {
    pub title: String,
    pub year: Option<i32>,
    pub kind: MediaKind,
    pub genres: Vec<String>,
    pub rating: Option<f32>,
    pub size_on_disk: u64,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

/// Result of searching a connector for a title
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub title: String,
    pub year: Option<i32>,
    pub in_library: bool,
    pub poster_url: Option<String>,
    /// Raw lookup payload, posted back when adding
    pub payload: Value,
}

/// Episode or movie library manager
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Instance name for logging and availability flags
    fn name(&self) -> &str;

    fn kind(&self) -> MediaKind;

    async fn library_items(&self) -> Result<Vec<LibraryItem>, ConnectorError>;

    /// Titles currently in the download queue
    async fn queue_titles(&self) -> Result<Vec<String>, ConnectorError>;

    async fn disk_space(&self) -> Result<DiskSpace, ConnectorError>;

    async fn lookup(
        &self,
        title: &str,
        year: Option<i32>,
    ) -> Result<Option<LookupResult>, ConnectorError>;

    /// Adds a looked-up title to the library and starts searching for it
    async fn add(&self, item: &LookupResult) -> Result<(), ConnectorError>;
}

/// Source of a user's viewing history
#[async_trait]
pub trait WatchHistorySource: Send + Sync {
    fn name(&self) -> &str;

    /// Most recent first
    async fn watch_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<WatchHistoryItem>, ConnectorError>;
}

/// Interchangeable instances of one connector type
pub struct ConnectorPool<T: ?Sized> {
    label: &'static str,
    members: Vec<Arc<T>>,
    timeout: Duration,
}

impl<T: ?Sized> Clone for ConnectorPool<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            members: self.members.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T: ?Sized + Send + Sync> ConnectorPool<T> {
    pub fn new(label: &'static str, members: Vec<Arc<T>>, timeout: Duration) -> Self {
        Self {
            label,
            members,
            timeout,
        }
    }

    pub fn empty(label: &'static str) -> Self {
        Self::new(label, Vec::new(), Duration::from_secs(2))
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Runs `op` against each instance in order, each time-boxed, and returns
    /// the first success
    pub async fn first_responsive<R, F, Fut>(&self, op: F) -> Result<R, ConnectorError>
    where
        F: Fn(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R, ConnectorError>>,
    {
        let mut last_error = None;

        for (index, member) in self.members.iter().enumerate() {
            match tokio::time::timeout(self.timeout, op(member.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    tracing::warn!(connector = self.label, index, error = %e, "Connector call failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(connector = self.label, index, timeout = ?self.timeout, "Connector call timed out");
                    last_error = Some(ConnectorError::Timeout(self.timeout));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectorError::NotConfigured(self.label.to_string())))
    }
}

/// All configured connectors, grouped by type
#[derive(Clone)]
pub struct MediaConnectors {
    pub series: ConnectorPool<dyn MediaLibrary>,
    pub movies: ConnectorPool<dyn MediaLibrary>,
    pub history: ConnectorPool<dyn WatchHistorySource>,
}

impl MediaConnectors {
    pub fn none() -> Self {
        Self {
            series: ConnectorPool::empty("series"),
            movies: ConnectorPool::empty("movies"),
            history: ConnectorPool::empty("history"),
        }
    }

    pub fn library_for(&self, kind: MediaKind) -> &ConnectorPool<dyn MediaLibrary> {
        match kind {
            MediaKind::Series => &self.series,
            MediaKind::Movie => &self.movies,
        }
    }
}
