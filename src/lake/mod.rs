// src/lake/mod.rs
//! Day-partitioned data lake on the local filesystem.
//!
//! Layout under the lake root:
//! - `raw/messages/<day>/<source_id>.json`: one JSON array of records per source and day
//! - `raw/images/<source_id>/<message_id>.jpg`: downloaded photo attachments
//! - `raw/manifests/<day>.json`: `source_id -> message count` for a completed run
//! - `raw/csv/<day>/messages.csv`: flat snapshot of every record of the run
//!
//! Every write goes to a hidden temp sibling first and is renamed into place, so
//! readers never observe a half-written partition or manifest.

pub mod manifest;

use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::types::MessageRecord;
pub use manifest::Manifest;

#[derive(Debug, thiserror::Error)]
pub enum LakeError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("json error at {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("csv error at {}: {source}", path.display())]
    Csv { path: PathBuf, source: csv::Error },
}

impl LakeError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        LakeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Deterministic path derivation for everything stored in the lake.
#[derive(Debug, Clone)]
pub struct LakeLayout {
    root: PathBuf,
}

impl LakeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn messages_dir(&self, day: NaiveDate) -> PathBuf {
        self.raw_dir().join("messages").join(day_key(day))
    }

    pub fn partition_path(&self, day: NaiveDate, source_id: &str) -> PathBuf {
        self.messages_dir(day).join(format!("{source_id}.json"))
    }

    pub fn images_root(&self) -> PathBuf {
        self.raw_dir().join("images")
    }

    pub fn images_dir(&self, source_id: &str) -> PathBuf {
        self.images_root().join(source_id)
    }

    pub fn attachment_path(&self, source_id: &str, message_id: i64) -> PathBuf {
        self.images_dir(source_id).join(format!("{message_id}.jpg"))
    }

    pub fn manifest_path(&self, day: NaiveDate) -> PathBuf {
        self.raw_dir()
            .join("manifests")
            .join(format!("{}.json", day_key(day)))
    }

    pub fn csv_path(&self, day: NaiveDate) -> PathBuf {
        self.raw_dir()
            .join("csv")
            .join(day_key(day))
            .join("messages.csv")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Column order of the flat CSV snapshot.
#[derive(Serialize)]
struct CsvRow<'a> {
    message_id: i64,
    channel_name: &'a str,
    channel_title: &'a str,
    message_date: String,
    message_text: &'a str,
    has_media: bool,
    image_path: Option<&'a str>,
    views: u64,
    forwards: u64,
}

impl<'a> From<&'a MessageRecord> for CsvRow<'a> {
    fn from(r: &'a MessageRecord) -> Self {
        Self {
            message_id: r.message_id,
            channel_name: &r.source_id,
            channel_title: &r.source_display_name,
            message_date: r.timestamp.to_rfc3339(),
            message_text: &r.text,
            has_media: r.has_attachment,
            image_path: r.attachment_path.as_deref(),
            views: r.engagement_views,
            forwards: r.engagement_forwards,
        }
    }
}

/// Sole owner of lake writes during an ingestion run.
#[derive(Debug, Clone)]
pub struct DataLakeWriter {
    layout: LakeLayout,
}

impl DataLakeWriter {
    pub fn new(layout: LakeLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &LakeLayout {
        &self.layout
    }

    /// Replace the (source, day) partition with `records`. Last write wins.
    pub fn write_partition(
        &self,
        source_id: &str,
        day: NaiveDate,
        records: &[MessageRecord],
    ) -> Result<PathBuf, LakeError> {
        let path = self.layout.partition_path(day, source_id);
        let body = serde_json::to_vec_pretty(records).map_err(|source| LakeError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &body)?;
        tracing::debug!(path = %path.display(), records = records.len(), "partition written");
        Ok(path)
    }

    /// Overwrite the manifest for `day` with the counts of one complete run.
    pub fn write_manifest(&self, day: NaiveDate, manifest: &Manifest) -> Result<PathBuf, LakeError> {
        let path = self.layout.manifest_path(day);
        let body = serde_json::to_vec_pretty(manifest).map_err(|source| LakeError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &body)?;
        tracing::info!(path = %path.display(), sources = manifest.len(), "manifest written");
        Ok(path)
    }

    /// Drop the manifest for `day`, marking the day not ready until a run completes.
    pub fn clear_manifest(&self, day: NaiveDate) -> Result<(), LakeError> {
        let path = self.layout.manifest_path(day);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "previous manifest removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LakeError::io(&path, e)),
        }
    }

    pub fn write_csv_snapshot(
        &self,
        day: NaiveDate,
        records: &[MessageRecord],
    ) -> Result<PathBuf, LakeError> {
        let path = self.layout.csv_path(day);
        let csv_err = |source| LakeError::Csv {
            path: path.clone(),
            source,
        };

        let mut w = csv::Writer::from_writer(Vec::new());
        if records.is_empty() {
            w.write_record([
                "message_id",
                "channel_name",
                "channel_title",
                "message_date",
                "message_text",
                "has_media",
                "image_path",
                "views",
                "forwards",
            ])
            .map_err(csv_err)?;
        }
        for r in records {
            w.serialize(CsvRow::from(r)).map_err(csv_err)?;
        }
        let body = w
            .into_inner()
            .map_err(|e| LakeError::io(&path, e.into_error()))?;
        write_atomic(&path, &body)?;
        Ok(path)
    }

    /// True when a non-empty attachment already sits at `path`.
    pub fn attachment_ready(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    pub fn store_attachment(&self, path: &Path, bytes: &[u8]) -> Result<(), LakeError> {
        write_atomic(path, bytes)
    }

    pub fn read_partition(
        &self,
        day: NaiveDate,
        source_id: &str,
    ) -> Result<Vec<MessageRecord>, LakeError> {
        let path = self.layout.partition_path(day, source_id);
        let raw = fs::read(&path).map_err(|e| LakeError::io(&path, e))?;
        serde_json::from_slice(&raw).map_err(|source| LakeError::Json { path, source })
    }

    /// `Ok(None)` when no run has completed for `day`.
    pub fn read_manifest(&self, day: NaiveDate) -> Result<Option<Manifest>, LakeError> {
        let path = self.layout.manifest_path(day);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LakeError::io(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| LakeError::Json { path, source })
    }

    /// Source ids that have a partition for `day`, sorted.
    pub fn list_partitions(&self, day: NaiveDate) -> Result<Vec<String>, LakeError> {
        let dir = self.layout.messages_dir(day);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LakeError::io(&dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_json = path.extension().and_then(|s| s.to_str()) == Some("json");
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if is_json && !stem.is_empty() && !stem.starts_with('.') {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LakeError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| LakeError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp"));
    fs::write(&tmp, bytes).map_err(|e| LakeError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| LakeError::io(path, e))
}
