//! Media server abstraction
//!
//! The scan pipeline talks to the media server only through [`MediaServer`],
//! so the concrete Plex client can be swapped for an in-process fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by a media server
#[derive(Debug, Error)]
pub enum MediaServerError {
    #[error("media server is not configured: {0}")]
    NotConfigured(String),

    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("could not decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("library '{0}' not found")]
    LibraryNotFound(String),

    #[error("item {0} not found")]
    ItemNotFound(String),
}

impl MediaServerError {
    /// Whether retrying the same request might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            MediaServerError::Transport { .. } => true,
            MediaServerError::Status { status, .. } => {
                crate::services::rate_limiter::is_transient_status(*status)
            }
            _ => false,
        }
    }
}

/// A library section on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Library {
    pub key: String,
    pub title: String,
    /// Section type as reported by the server (`movie`, `show`, `artist`, ...)
    pub kind: String,
}

impl Library {
    /// Only movie and show sections carry the metadata the refresher repairs
    pub fn is_scannable(&self) -> bool {
        matches!(self.kind.as_str(), "movie" | "show")
    }
}

/// Snapshot of an item's metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaItem {
    /// Stable server-side id
    pub rating_key: String,
    pub title: String,
    /// Title of the library section the server files the item under
    pub library: Option<String>,
    /// External identifiers (`imdb://...`, `tmdb://...`)
    pub guids: Vec<String>,
    /// Artwork reference
    pub thumb: Option<String>,
    pub summary: Option<String>,
    pub added_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MediaItem {
    /// Timestamp used for the recency cutoff
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.added_at.or(self.updated_at)
    }
}

#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn list_libraries(&self) -> Result<Vec<Library>, MediaServerError>;

    /// Newest-added items of a library, at most `limit`
    async fn recent_items(&self, library: &str, limit: u32)
    -> Result<Vec<MediaItem>, MediaServerError>;

    async fn fetch_item(&self, rating_key: &str) -> Result<MediaItem, MediaServerError>;

    /// Ask the server to re-fetch metadata for an item
    async fn refresh(&self, rating_key: &str) -> Result<(), MediaServerError>;

    /// Current metadata for an item, used while polling after a refresh
    async fn reload(&self, rating_key: &str) -> Result<MediaItem, MediaServerError> {
        self.fetch_item(rating_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_time_prefers_added_at() {
        let added = DateTime::from_timestamp(1_700_000_000, 0);
        let updated = DateTime::from_timestamp(1_700_100_000, 0);
        let mut item = MediaItem {
            added_at: added,
            updated_at: updated,
            ..Default::default()
        };
        assert_eq!(item.reference_time(), added);

        item.added_at = None;
        assert_eq!(item.reference_time(), updated);

        item.updated_at = None;
        assert_eq!(item.reference_time(), None);
    }

    #[test]
    fn test_only_movie_and_show_sections_are_scannable() {
        let lib = |kind: &str| Library {
            key: "1".into(),
            title: "x".into(),
            kind: kind.into(),
        };
        assert!(lib("movie").is_scannable());
        assert!(lib("show").is_scannable());
        assert!(!lib("artist").is_scannable());
        assert!(!lib("photo").is_scannable());
    }

    #[test]
    fn test_transient_errors() {
        let status = |status| MediaServerError::Status {
            endpoint: "/".into(),
            status,
        };
        assert!(status(503).is_transient());
        assert!(!status(401).is_transient());
        assert!(!MediaServerError::ItemNotFound("1".into()).is_transient());
    }
}
