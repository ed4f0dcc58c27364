//! Attaches availability flags and poster art to generated recommendations.
use futures::future::join_all;
use std::{collections::HashSet, time::Duration};

use crate::{
    models::{Availability, MediaKind, Recommendation},
    services::providers::{ConnectorError, LookupResult, MediaConnectors},
};

pub struct Enricher {
    connectors: MediaConnectors,
    timeout: Duration,
}

impl Enricher {
    pub fn new(connectors: MediaConnectors, timeout: Duration) -> Self {
        Self {
            connectors,
            timeout,
        }
    }

    /// Enriches every recommendation concurrently. A lookup that fails or
    /// runs past the timeout leaves that recommendation without data.
    pub async fn enrich(&self, recommendations: Vec<Recommendation>) -> Vec<Recommendation> {
        let (series_queue, movie_queue) = tokio::join!(
            self.queue_snapshot(MediaKind::Series),
            self.queue_snapshot(MediaKind::Movie),
        );

        let tasks = recommendations.into_iter().map(|recommendation| {
            let queue = match recommendation.kind {
                MediaKind::Series => series_queue.as_ref(),
                MediaKind::Movie => movie_queue.as_ref(),
            };
            self.enrich_one(recommendation, queue)
        });

        join_all(tasks).await
    }

    async fn enrich_one(
        &self,
        mut recommendation: Recommendation,
        queue: Option<&HashSet<String>>,
    ) -> Recommendation {
        let in_download_queue = queue
            .map(|q| q.contains(&recommendation.title.to_lowercase()))
            .unwrap_or(false);

        let lookup = tokio::time::timeout(
            self.timeout,
            self.lookup(recommendation.kind, &recommendation.title, recommendation.year),
        )
        .await;

        match lookup {
            Ok(Some((service, found))) => {
                if recommendation.poster_url.is_none() {
                    recommendation.poster_url = found.poster_url;
                }
                recommendation.availability = Some(Availability {
                    in_library: found.in_library,
                    in_download_queue,
                    available_services: vec![service],
                });
            }
            outcome => {
                if outcome.is_err() {
                    tracing::debug!(title = %recommendation.title, "Enrichment lookup timed out");
                }
                recommendation.availability = queue.map(|_| Availability {
                    in_download_queue,
                    ..Default::default()
                });
            }
        }

        recommendation
    }

    /// Looks the title up in the first responsive library of its kind,
    /// returning the responding service's name
    async fn lookup(
        &self,
        kind: MediaKind,
        title: &str,
        year: Option<i32>,
    ) -> Option<(String, LookupResult)> {
        let pool = self.connectors.library_for(kind);
        if pool.is_empty() {
            return None;
        }

        let result = pool
            .first_responsive(|library| {
                let title = title.to_string();
                async move {
                    let found = library.lookup(&title, year).await?;
                    Ok::<_, ConnectorError>(found.map(|f| (library.name().to_string(), f)))
                }
            })
            .await;

        match result {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(title = %title, kind = %kind, error = %e, "Availability lookup failed");
                None
            }
        }
    }

    /// Lowercased titles in the download queue, fetched once per batch
    async fn queue_snapshot(&self, kind: MediaKind) -> Option<HashSet<String>> {
        let pool = self.connectors.library_for(kind);
        if pool.is_empty() {
            return None;
        }

        pool.first_responsive(|library| async move { library.queue_titles().await })
            .await
            .map(|titles| titles.iter().map(|t| t.to_lowercase()).collect())
            .map_err(|e| tracing::warn!(kind = %kind, error = %e, "Download queue unavailable"))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::{ConnectorPool, DiskSpace, LibraryItem, MediaLibrary};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    struct FakeRadarr {
        lookup_delay: Duration,
    }

    #[async_trait]
    impl MediaLibrary for FakeRadarr {
        fn name(&self) -> &str {
            "radarr"
        }

        fn kind(&self) -> MediaKind {
            MediaKind::Movie
        }

        async fn library_items(&self) -> Result<Vec<LibraryItem>, ConnectorError> {
            Ok(vec![])
        }

        async fn queue_titles(&self) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["DUNE".to_string()])
        }

        async fn disk_space(&self) -> Result<DiskSpace, ConnectorError> {
            Ok(DiskSpace::default())
        }

        async fn lookup(
            &self,
            title: &str,
            year: Option<i32>,
        ) -> Result<Option<LookupResult>, ConnectorError> {
            tokio::time::sleep(self.lookup_delay).await;
            if title == "Unknown" {
                return Ok(None);
            }
            Ok(Some(LookupResult {
                title: title.to_string(),
                year,
                in_library: title == "Arrival",
                poster_url: Some(format!("https://img/{}.jpg", title)),
                payload: json!({}),
            }))
        }

        async fn add(&self, _item: &LookupResult) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn movie(title: &str) -> Recommendation {
        Recommendation {
            id: Uuid::new_v4(),
            title: title.to_string(),
            year: Some(2021),
            kind: MediaKind::Movie,
            genres: vec![],
            reasoning: String::new(),
            match_score: 80,
            is_hidden_gem: false,
            availability: None,
            poster_url: None,
        }
    }

    fn enricher(lookup_delay: Duration) -> Enricher {
        let radarr: Arc<dyn MediaLibrary> = Arc::new(FakeRadarr { lookup_delay });
        let connectors = MediaConnectors {
            movies: ConnectorPool::new("movies", vec![radarr], Duration::from_millis(500)),
            ..MediaConnectors::none()
        };
        Enricher::new(connectors, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_enrich_sets_flags_and_poster() {
        let enriched = enricher(Duration::ZERO)
            .enrich(vec![movie("Arrival"), movie("Dune"), movie("Unknown")])
            .await;

        let arrival = enriched[0].availability.as_ref().unwrap();
        assert!(arrival.in_library);
        assert!(!arrival.in_download_queue);
        assert_eq!(arrival.available_services, vec!["radarr"]);
        assert_eq!(enriched[0].poster_url.as_deref(), Some("https://img/Arrival.jpg"));

        let dune = enriched[1].availability.as_ref().unwrap();
        assert!(!dune.in_library);
        assert!(dune.in_download_queue);

        let unknown = enriched[2].availability.as_ref().unwrap();
        assert!(unknown.available_services.is_empty());
        assert!(enriched[2].poster_url.is_none());
    }

    #[tokio::test]
    async fn test_slow_lookup_yields_no_data() {
        let enriched = enricher(Duration::from_millis(300))
            .enrich(vec![movie("Arrival")])
            .await;

        assert!(enriched[0].poster_url.is_none());
        let availability = enriched[0].availability.as_ref().unwrap();
        assert!(!availability.in_library);
    }

    #[tokio::test]
    async fn test_unconfigured_kind_is_left_alone() {
        let mut series = movie("Severance");
        series.kind = MediaKind::Series;
        let enriched = enricher(Duration::ZERO).enrich(vec![series]).await;
        assert!(enriched[0].availability.is_none());
    }
}
