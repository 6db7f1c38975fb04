// src/ingest/providers/fixture.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::ingest::types::{normalize_source_id, ChannelSource, FetchError, UpstreamMessage};

#[derive(Debug, Deserialize)]
struct FixtureFile {
    channels: HashMap<String, FixtureChannel>,
}

#[derive(Debug, Deserialize)]
struct FixtureChannel {
    title: String,
    #[serde(default)]
    messages: Vec<FixtureMessage>,
}

#[derive(Debug, Deserialize)]
struct FixtureMessage {
    #[serde(flatten)]
    message: UpstreamMessage,
    /// Photo file, relative to the fixture's directory.
    #[serde(default)]
    photo_file: Option<PathBuf>,
}

/// Offline channel source backed by a JSON fixture:
///
/// ```json
/// { "channels": { "@alpha": { "title": "Alpha", "messages": [
///     { "id": 2, "date": "2025-01-02T09:00:00Z", "text": "hi", "media": "photo", "photo_file": "img/2.jpg" }
/// ] } } }
/// ```
pub struct FixtureSource {
    channels: HashMap<String, FixtureChannel>,
    base_dir: PathBuf,
}

impl FixtureSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading channel fixture from {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::from_fixture_str(&content, base_dir)
    }

    pub fn from_fixture_str(s: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(s).context("parsing channel fixture json")?;
        let channels = file
            .channels
            .into_iter()
            .map(|(k, mut ch)| {
                // Newest first, like a live channel history.
                ch.messages.sort_by(|a, b| b.message.id.cmp(&a.message.id));
                (normalize_source_id(&k), ch)
            })
            .collect();
        Ok(Self {
            channels,
            base_dir: base_dir.into(),
        })
    }

    fn channel(&self, source_id: &str) -> Result<&FixtureChannel, FetchError> {
        self.channels
            .get(source_id)
            .ok_or_else(|| FetchError::UnknownSource(source_id.to_string()))
    }
}

#[async_trait]
impl ChannelSource for FixtureSource {
    async fn resolve(&self, source_id: &str) -> Result<String, FetchError> {
        Ok(self.channel(source_id)?.title.clone())
    }

    async fn fetch_page(
        &self,
        source_id: &str,
        before_id: Option<i64>,
        max: usize,
    ) -> Result<Vec<UpstreamMessage>, FetchError> {
        let ch = self.channel(source_id)?;
        Ok(ch
            .messages
            .iter()
            .filter(|m| before_id.map_or(true, |b| m.message.id < b))
            .take(max)
            .map(|m| m.message.clone())
            .collect())
    }

    async fn download_photo(
        &self,
        source_id: &str,
        message: &UpstreamMessage,
    ) -> Result<Vec<u8>, FetchError> {
        let ch = self.channel(source_id)?;
        let file = ch
            .messages
            .iter()
            .find(|m| m.message.id == message.id)
            .and_then(|m| m.photo_file.as_ref())
            .ok_or_else(|| {
                FetchError::Upstream(format!("no photo for {source_id}/{}", message.id))
            })?;
        Ok(tokio::fs::read(self.base_dir.join(file)).await?)
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}
