/// Sonarr / Radarr connector
///
/// Both applications share the v3 API layout, differing only in the resource
/// name (`series` vs `movie`) and a few payload fields.
///
/// API Flow:
/// 1. Library: /api/v3/{resource} → every title in the library
/// 2. Lookup: /api/v3/{resource}/lookup?term= → candidates with an id > 0 when already present
/// 3. Add: /api/v3/qualityprofile + /api/v3/rootfolder, then POST /api/v3/{resource}
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::{
    models::{eq_ignore_case, MediaKind},
    services::providers::{ConnectorError, DiskSpace, LibraryItem, LookupResult, MediaLibrary},
};

#[derive(Clone)]
pub struct ServarrConnector {
    http_client: HttpClient,
    name: String,
    kind: MediaKind,
    api_url: String,
    api_key: String,
}

impl ServarrConnector {
    /// Sonarr instance (series)
    pub fn sonarr(name: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::new(name, MediaKind::Series, api_url, api_key)
    }

    /// Radarr instance (movies)
    pub fn radarr(name: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::new(name, MediaKind::Movie, api_url, api_key)
    }

    fn new(
        name: impl Into<String>,
        kind: MediaKind,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http_client: HttpClient::new(),
            name: name.into(),
            kind,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn resource(&self) -> &'static str {
        match self.kind {
            MediaKind::Series => "series",
            MediaKind::Movie => "movie",
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ConnectorError> {
        let url = format!("{}/api/v3/{}", self.api_url, path);
        let response = self
            .http_client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Status {
                service: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    /// Picks the quality profile and root folder new titles are added with
    async fn add_defaults(&self) -> Result<(i64, String), ConnectorError> {
        let profiles: Vec<Value> = self.get_json("qualityprofile", &[]).await?;
        let folders: Vec<Value> = self.get_json("rootfolder", &[]).await?;

        let profile_id = profiles
            .first()
            .and_then(|p| p["id"].as_i64())
            .ok_or_else(|| ConnectorError::Misconfigured(self.name.clone(), "quality profile".into()))?;
        let root_folder = folders
            .first()
            .and_then(|f| f["path"].as_str())
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::Misconfigured(self.name.clone(), "root folder".into()))?;

        Ok((profile_id, root_folder))
    }
}

/// Converts a library resource into a `LibraryItem`
pub(crate) fn parse_library_item(value: &Value, kind: MediaKind) -> Option<LibraryItem> {
    let title = value["title"].as_str()?.to_string();
    let genres = value["genres"]
        .as_array()
        .map(|g| {
            g.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    // Sonarr reports a flat rating, Radarr one per source
    let rating = value["ratings"]["value"]
        .as_f64()
        .or_else(|| value["ratings"]["imdb"]["value"].as_f64())
        .or_else(|| value["ratings"]["tmdb"]["value"].as_f64())
        .filter(|r| *r > 0.0)
        .map(|r| r as f32);

    let size_on_disk = value["sizeOnDisk"]
        .as_u64()
        .or_else(|| value["statistics"]["sizeOnDisk"].as_u64())
        .unwrap_or(0);

    let quality = value["movieFile"]["quality"]["quality"]["name"]
        .as_str()
        .map(str::to_string);

    Some(LibraryItem {
        title,
        year: value["year"].as_i64().filter(|y| *y > 0).map(|y| y as i32),
        kind,
        genres,
        rating,
        size_on_disk,
        quality,
    })
}

pub(crate) fn poster_url(value: &Value) -> Option<String> {
    value["images"].as_array()?.iter().find_map(|image| {
        if image["coverType"].as_str() != Some("poster") {
            return None;
        }
        image["remoteUrl"]
            .as_str()
            .or_else(|| image["url"].as_str())
            .map(str::to_string)
    })
}

/// Chooses the best lookup candidate: exact title and year, then exact
/// title, then the first result
pub(crate) fn pick_lookup(candidates: &[Value], title: &str, year: Option<i32>) -> Option<LookupResult> {
    let title_matches = |c: &&Value| {
        c["title"]
            .as_str()
            .is_some_and(|t| eq_ignore_case(t, title))
    };
    let year_matches = |c: &&Value| year.is_none() || c["year"].as_i64() == year.map(i64::from);

    let chosen = candidates
        .iter()
        .find(|c| title_matches(c) && year_matches(c))
        .or_else(|| candidates.iter().find(|c| title_matches(c)))
        .or_else(|| candidates.first())?;

    Some(LookupResult {
        title: chosen["title"].as_str().unwrap_or(title).to_string(),
        year: chosen["year"].as_i64().map(|y| y as i32),
        in_library: chosen["id"].as_i64().unwrap_or(0) > 0,
        poster_url: poster_url(chosen),
        payload: chosen.clone(),
    })
}

pub(crate) fn queue_record_title(record: &Value) -> Option<String> {
    record["series"]["title"]
        .as_str()
        .or_else(|| record["movie"]["title"].as_str())
        .or_else(|| record["title"].as_str())
        .map(str::to_string)
}

#[async_trait]
impl MediaLibrary for ServarrConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn library_items(&self) -> Result<Vec<LibraryItem>, ConnectorError> {
        let resources: Vec<Value> = self.get_json(self.resource(), &[]).await?;
        let items: Vec<LibraryItem> = resources
            .iter()
            .filter_map(|r| parse_library_item(r, self.kind))
            .collect();

        tracing::debug!(connector = %self.name, items = items.len(), "Fetched library");
        Ok(items)
    }

    async fn queue_titles(&self) -> Result<Vec<String>, ConnectorError> {
        let include = match self.kind {
            MediaKind::Series => "includeSeries",
            MediaKind::Movie => "includeMovie",
        };
        let queue: Value = self
            .get_json("queue", &[("pageSize", "200"), (include, "true")])
            .await?;
        let records = queue["records"]
            .as_array()
            .ok_or_else(|| ConnectorError::InvalidResponse("queue without records".to_string()))?;

        Ok(records.iter().filter_map(queue_record_title).collect())
    }

    async fn disk_space(&self) -> Result<DiskSpace, ConnectorError> {
        let disks: Vec<Value> = self.get_json("diskspace", &[]).await?;
        Ok(disks.iter().fold(DiskSpace::default(), |acc, d| DiskSpace {
            free_bytes: acc.free_bytes + d["freeSpace"].as_u64().unwrap_or(0),
            total_bytes: acc.total_bytes + d["totalSpace"].as_u64().unwrap_or(0),
        }))
    }

    async fn lookup(
        &self,
        title: &str,
        year: Option<i32>,
    ) -> Result<Option<LookupResult>, ConnectorError> {
        let term = match year {
            Some(year) => format!("{} {}", title, year),
            None => title.to_string(),
        };
        let candidates: Vec<Value> = self
            .get_json(&format!("{}/lookup", self.resource()), &[("term", term.as_str())])
            .await?;
        Ok(pick_lookup(&candidates, title, year))
    }

    async fn add(&self, item: &LookupResult) -> Result<(), ConnectorError> {
        let (profile_id, root_folder) = self.add_defaults().await?;

        let mut payload = item.payload.clone();
        payload["qualityProfileId"] = json!(profile_id);
        payload["rootFolderPath"] = json!(root_folder);
        payload["monitored"] = json!(true);
        payload["addOptions"] = match self.kind {
            MediaKind::Series => json!({ "searchForMissingEpisodes": true }),
            MediaKind::Movie => json!({ "searchForMovie": true }),
        };

        let url = format!("{}/api/v3/{}", self.api_url, self.resource());
        let response = self
            .http_client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Status {
                service: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(connector = %self.name, title = %item.title, "Added title to library");
        Ok(())
    }
}
