//! Plex Media Server API client
//!
//! Speaks the JSON flavour of the Plex HTTP API:
//! - `GET /library/sections`
//! - `GET /library/sections/{key}/all?sort=addedAt:desc`
//! - `GET /library/metadata/{id}?includeGuids=1`
//! - `PUT /library/metadata/{id}/refresh`
//!
//! Listing and lookup requests are retried on transient failures. Refresh and
//! reload are not, since the refresh policy already bounds them with its own
//! polling budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Method;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;

use super::connection::MediaServerConnector;
use super::media_server::{Library, MediaItem, MediaServer, MediaServerError};
use super::rate_limiter::{RateLimitedClient, RetryPolicy, Upstream, retry_transient};

const TOKEN_HEADER: &str = "X-Plex-Token";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    media_container: T,
}

#[derive(Debug, Default, Deserialize)]
struct SectionsContainer {
    #[serde(rename = "Directory", default)]
    directory: Vec<PlexSection>,
}

#[derive(Debug, Deserialize)]
struct PlexSection {
    key: String,
    title: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataContainer {
    #[serde(rename = "librarySectionTitle")]
    library_section_title: Option<String>,
    #[serde(rename = "Metadata", default)]
    metadata: Vec<PlexMetadata>,
}

#[derive(Debug, Deserialize)]
struct PlexMetadata {
    #[serde(rename = "ratingKey")]
    rating_key: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "librarySectionTitle")]
    library_section_title: Option<String>,
    #[serde(rename = "Guid", default)]
    guids: Vec<PlexGuid>,
    thumb: Option<String>,
    summary: Option<String>,
    #[serde(rename = "addedAt")]
    added_at: Option<i64>,
    #[serde(rename = "updatedAt")]
    updated_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlexGuid {
    id: String,
}

impl PlexMetadata {
    fn into_item(self, container_library: Option<&str>) -> MediaItem {
        MediaItem {
            rating_key: self.rating_key,
            title: self.title,
            library: self
                .library_section_title
                .or_else(|| container_library.map(str::to_string)),
            guids: self.guids.into_iter().map(|g| g.id).collect(),
            thumb: self.thumb,
            summary: self.summary,
            added_at: self.added_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            updated_at: self.updated_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }
}

/// Decode a response body, replacing invalid UTF-8 rather than failing on it
fn decode_lossy<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T, MediaServerError> {
    let text = String::from_utf8_lossy(body);
    serde_json::from_str(&text).map_err(|e| MediaServerError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

/// Plex API client with rate limiting and retry logic
pub struct PlexClient {
    http: RateLimitedClient,
    base_url: Url,
    token: String,
    retry: RetryPolicy,
}

impl PlexClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, MediaServerError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| MediaServerError::NotConfigured(format!("invalid PLEX_URL '{}': {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = RateLimitedClient::new(Upstream::Plex, timeout)
            .map_err(|e| MediaServerError::NotConfigured(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, MediaServerError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| MediaServerError::NotConfigured(format!("cannot build URL for {}: {}", path, e)))
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MediaServerError> {
        let url = self.url(path)?;
        let transport = |e: reqwest::Error| MediaServerError::Transport {
            endpoint: path.to_string(),
            message: e.to_string(),
        };

        let response = self
            .http
            .request(Method::GET, url.as_str())
            .await
            .header(TOKEN_HEADER, &self.token)
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaServerError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        decode_lossy(path, &body)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        retry: &RetryPolicy,
    ) -> Result<T, MediaServerError> {
        retry_transient(retry, path, MediaServerError::is_transient, || {
            self.get_once(path, query)
        })
        .await
    }

    async fn metadata(&self, rating_key: &str, retry: &RetryPolicy) -> Result<MediaItem, MediaServerError> {
        let path = format!("/library/metadata/{}", rating_key);
        let envelope: Envelope<MetadataContainer> = self
            .get_json(&path, &[("includeGuids", "1".to_string())], retry)
            .await
            .map_err(|e| match e {
                MediaServerError::Status { status: 404, .. } => {
                    MediaServerError::ItemNotFound(rating_key.to_string())
                }
                other => other,
            })?;

        let container = envelope.media_container;
        let library = container.library_section_title;
        container
            .metadata
            .into_iter()
            .next()
            .map(|m| m.into_item(library.as_deref()))
            .ok_or_else(|| MediaServerError::ItemNotFound(rating_key.to_string()))
    }
}

#[async_trait]
impl MediaServer for PlexClient {
    async fn list_libraries(&self) -> Result<Vec<Library>, MediaServerError> {
        let envelope: Envelope<SectionsContainer> = self
            .get_json("/library/sections", &[], &self.retry)
            .await?;

        Ok(envelope
            .media_container
            .directory
            .into_iter()
            .map(|s| Library {
                key: s.key,
                title: s.title,
                kind: s.kind,
            })
            .collect())
    }

    async fn recent_items(
        &self,
        library: &str,
        limit: u32,
    ) -> Result<Vec<MediaItem>, MediaServerError> {
        let section = self
            .list_libraries()
            .await?
            .into_iter()
            .find(|l| l.title == library)
            .ok_or_else(|| MediaServerError::LibraryNotFound(library.to_string()))?;

        let path = format!("/library/sections/{}/all", section.key);
        let query = [
            ("sort", "addedAt:desc".to_string()),
            ("includeGuids", "1".to_string()),
            ("X-Plex-Container-Start", "0".to_string()),
            ("X-Plex-Container-Size", limit.to_string()),
        ];
        let envelope: Envelope<MetadataContainer> =
            self.get_json(&path, &query, &self.retry).await?;

        let container = envelope.media_container;
        let fallback = container.library_section_title.unwrap_or(section.title);
        let items: Vec<MediaItem> = container
            .metadata
            .into_iter()
            .take(limit as usize)
            .map(|m| m.into_item(Some(&fallback)))
            .collect();

        debug!(library = %library, count = items.len(), "Fetched recent items");
        Ok(items)
    }

    async fn fetch_item(&self, rating_key: &str) -> Result<MediaItem, MediaServerError> {
        self.metadata(rating_key, &self.retry).await
    }

    async fn refresh(&self, rating_key: &str) -> Result<(), MediaServerError> {
        let path = format!("/library/metadata/{}/refresh", rating_key);
        let url = self.url(&path)?;

        let response = self
            .http
            .request(Method::PUT, url.as_str())
            .await
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| MediaServerError::Transport {
                endpoint: path.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaServerError::Status {
                endpoint: path,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn reload(&self, rating_key: &str) -> Result<MediaItem, MediaServerError> {
        self.metadata(rating_key, &RetryPolicy::once()).await
    }
}

/// Builds Plex clients from the configured endpoint and token
pub struct PlexConnector {
    url: Option<String>,
    token: Option<String>,
    timeout: Duration,
}

impl PlexConnector {
    pub fn new(url: Option<String>, token: Option<String>, timeout: Duration) -> Self {
        Self { url, token, timeout }
    }
}

#[async_trait]
impl MediaServerConnector for PlexConnector {
    async fn connect(&self) -> Result<Arc<dyn MediaServer>, MediaServerError> {
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| MediaServerError::NotConfigured("PLEX_URL is not set".into()))?;
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MediaServerError::NotConfigured("PLEX_TOKEN is not set".into()))?;

        let client = PlexClient::new(url, token, self.timeout)?;
        let sections = client.list_libraries().await?;
        info!(service = "plex", url = %url, sections = sections.len(), "Connected to Plex");

        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decodes_sections() {
        let body = br#"{"MediaContainer":{"size":2,"Directory":[
            {"key":"1","title":"Movies","type":"movie"},
            {"key":"4","title":"Music","type":"artist"}]}}"#;
        let envelope: Envelope<SectionsContainer> = decode_lossy("/library/sections", body).unwrap();
        let dirs = envelope.media_container.directory;
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[1].kind, "artist");
    }

    #[test]
    fn test_decodes_metadata_into_item() {
        let body = br#"{"MediaContainer":{"librarySectionTitle":"Movies","Metadata":[{
            "ratingKey":"123","title":"Heat","thumb":"/library/metadata/123/thumb/1",
            "summary":"A heist.","addedAt":1700000000,
            "Guid":[{"id":"imdb://tt0113277"},{"id":"tmdb://949"}]}]}}"#;
        let envelope: Envelope<MetadataContainer> = decode_lossy("/library/metadata/123", body).unwrap();
        let container = envelope.media_container;
        let library = container.library_section_title.clone();
        let item = container
            .metadata
            .into_iter()
            .next()
            .unwrap()
            .into_item(library.as_deref());

        assert_eq!(item.rating_key, "123");
        assert_eq!(item.library.as_deref(), Some("Movies"));
        assert_eq!(item.guids, vec!["imdb://tt0113277", "tmdb://949"]);
        assert_eq!(item.added_at.unwrap().timestamp(), 1_700_000_000);
        assert!(item.updated_at.is_none());
    }

    #[test]
    fn test_missing_fields_decode_as_empty() {
        let body = br#"{"MediaContainer":{"Metadata":[{"ratingKey":"7"}]}}"#;
        let envelope: Envelope<MetadataContainer> = decode_lossy("/", body).unwrap();
        let item = envelope
            .media_container
            .metadata
            .into_iter()
            .next()
            .unwrap()
            .into_item(None);
        assert!(item.guids.is_empty());
        assert!(item.thumb.is_none());
        assert!(item.summary.is_none());
        assert!(item.reference_time().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_rejected() {
        let mut body = br#"{"MediaContainer":{"Metadata":[{"ratingKey":"8","title":"Am"#.to_vec();
        body.push(0xE9);
        body.extend_from_slice(br#"lie"}]}}"#);
        let envelope: Envelope<MetadataContainer> = decode_lossy("/", &body).unwrap();
        let title = &envelope.media_container.metadata[0].title;
        assert!(title.starts_with("Am"));
        assert!(title.ends_with("lie"));
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let result: Result<Envelope<SectionsContainer>, _> = decode_lossy("/library/sections", b"<html>");
        assert_matches!(result, Err(MediaServerError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_connector_requires_credentials() {
        let connector = PlexConnector::new(None, Some("token".into()), Duration::from_secs(1));
        assert_matches!(connector.connect().await.err(), Some(MediaServerError::NotConfigured(_)));

        let connector = PlexConnector::new(Some("http://plex:32400".into()), Some(String::new()), Duration::from_secs(1));
        assert_matches!(connector.connect().await.err(), Some(MediaServerError::NotConfigured(_)));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert_matches!(
            PlexClient::new("not a url", "t", Duration::from_secs(1)).err(),
            Some(MediaServerError::NotConfigured(_))
        );
    }

    #[test]
    fn test_urls_keep_base_path_prefix() {
        let client = PlexClient::new("http://proxy.local/plex", "t", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.url("/library/sections").unwrap().as_str(),
            "http://proxy.local/plex/library/sections"
        );
    }
}
