// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One ingested message as it is persisted in a day-partition.
///
/// Field names on disk follow the warehouse loader's column names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    #[serde(rename = "channel_name")]
    pub source_id: String,
    #[serde(rename = "channel_title")]
    pub source_display_name: String,
    pub message_id: i64,
    #[serde(rename = "message_date")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "message_text", default)]
    pub text: String,
    #[serde(rename = "has_media")]
    pub has_attachment: bool,
    #[serde(rename = "image_path", default)]
    pub attachment_path: Option<String>,
    #[serde(rename = "views", default)]
    pub engagement_views: u64,
    #[serde(rename = "forwards", default)]
    pub engagement_forwards: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Document,
    Other,
}

/// A message as delivered by the upstream, before it becomes a [`MessageRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<MediaKind>,
    #[serde(default)]
    pub views: Option<u64>,
    #[serde(default)]
    pub forwards: Option<u64>,
}

impl UpstreamMessage {
    pub fn has_photo(&self) -> bool {
        self.media == Some(MediaKind::Photo)
    }
}

/// Errors a [`ChannelSource`] can raise. `Throttled` is the only recoverable one.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("upstream throttled, retry after {wait:?}")]
    Throttled { wait: Duration },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    pub fn is_throttle(&self) -> bool {
        matches!(self, FetchError::Throttled { .. })
    }
}

/// A rate-limited upstream that serves channel history newest-first, one page at a time.
#[async_trait::async_trait]
pub trait ChannelSource: Send + Sync {
    /// Resolve a source id to its human-readable title.
    async fn resolve(&self, source_id: &str) -> Result<String, FetchError>;

    /// Up to `max` messages strictly older than `before_id` (or the newest ones when `None`).
    /// An empty page means the history is exhausted.
    async fn fetch_page(
        &self,
        source_id: &str,
        before_id: Option<i64>,
        max: usize,
    ) -> Result<Vec<UpstreamMessage>, FetchError>;

    /// Raw bytes of the photo attached to `message`.
    async fn download_photo(
        &self,
        source_id: &str,
        message: &UpstreamMessage,
    ) -> Result<Vec<u8>, FetchError>;

    fn name(&self) -> &'static str;
}

/// Strip the `@` handle marker and surrounding whitespace from a configured source.
pub fn normalize_source_id(raw: &str) -> String {
    raw.trim().trim_start_matches('@').trim().to_string()
}
