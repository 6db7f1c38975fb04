// src/ingest/fetcher.rs
//! Per-source fetch loop with pacing, write-once attachments and throttle backoff.
//!
//! A throttle restarts the whole source from its newest message; whatever the
//! failed attempt collected is dropped. Any other error abandons the source.

use metrics::counter;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::ingest::types::{ChannelSource, FetchError, MessageRecord, UpstreamMessage};
use crate::lake::DataLakeWriter;

/// Upstream-mandated waits shorter than this are rounded up.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub limit: usize,
    pub message_delay: Duration,
    pub max_retries: u32,
    pub page_size: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            limit: 100,
            message_delay: Duration::from_secs(1),
            max_retries: 3,
            page_size: 100,
        }
    }
}

/// Terminal state of one source fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Done,
    Aborted { reason: String },
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub records: Vec<MessageRecord>,
    pub status: FetchStatus,
    pub attempts: u32,
}

impl FetchOutcome {
    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_done(&self) -> bool {
        self.status == FetchStatus::Done
    }

    fn aborted(attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            status: FetchStatus::Aborted {
                reason: reason.into(),
            },
            attempts,
        }
    }
}

pub struct RateLimitedFetcher<'a> {
    source: &'a dyn ChannelSource,
    writer: &'a DataLakeWriter,
    settings: FetchSettings,
}

impl<'a> RateLimitedFetcher<'a> {
    pub fn new(
        source: &'a dyn ChannelSource,
        writer: &'a DataLakeWriter,
        settings: FetchSettings,
    ) -> Self {
        Self {
            source,
            writer,
            settings,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Fetch one source. Never fails: errors end up as an `Aborted` outcome with no records.
    pub async fn fetch(&self, source_id: &str) -> FetchOutcome {
        let mut retries: u32 = 0;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.fetch_attempt(source_id).await {
                Ok(records) => {
                    info!(
                        source = %source_id,
                        provider = self.source.name(),
                        count = records.len(),
                        attempts,
                        "finished source"
                    );
                    return FetchOutcome {
                        records,
                        status: FetchStatus::Done,
                        attempts,
                    };
                }
                Err(FetchError::Throttled { wait }) => {
                    counter!("ingest_throttle_total", "source" => source_id.to_string())
                        .increment(1);
                    retries += 1;
                    if retries > self.settings.max_retries {
                        error!(
                            source = %source_id,
                            attempts,
                            max_retries = self.settings.max_retries,
                            "too many throttle retries, skipping source"
                        );
                        counter!("ingest_source_aborts_total").increment(1);
                        return FetchOutcome::aborted(attempts, "throttle retries exhausted");
                    }
                    let wait = wait.max(MIN_BACKOFF);
                    warn!(
                        source = %source_id,
                        wait_secs = wait.as_secs_f64(),
                        retry = retries,
                        "upstream throttled, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    error!(source = %source_id, error = %e, "error scraping source");
                    counter!("ingest_source_aborts_total").increment(1);
                    return FetchOutcome::aborted(attempts, e.to_string());
                }
            }
        }
    }

    /// One stateless pass over the source, newest message first.
    async fn fetch_attempt(&self, source_id: &str) -> Result<Vec<MessageRecord>, FetchError> {
        let title = self.source.resolve(source_id).await?;
        let limit = self.settings.limit;
        let page_size = self.settings.page_size.max(1);
        debug!(source = %source_id, limit, "starting fetch attempt");

        let mut records = Vec::with_capacity(limit.min(page_size));
        let mut before_id: Option<i64> = None;

        while records.len() < limit {
            let want = (limit - records.len()).min(page_size);
            let page = self.source.fetch_page(source_id, before_id, want).await?;
            if page.is_empty() {
                break;
            }

            let before_page = records.len();
            for msg in page {
                if records.len() >= limit {
                    break;
                }
                // The cursor only moves backwards.
                if before_id.is_some_and(|b| msg.id >= b) {
                    continue;
                }
                before_id = Some(msg.id);

                let record = self.build_record(source_id, &title, msg).await;
                counter!("ingest_messages_total", "source" => source_id.to_string()).increment(1);
                records.push(record);

                if !self.settings.message_delay.is_zero() {
                    tokio::time::sleep(self.settings.message_delay).await;
                }
            }

            // A page with nothing older than the cursor would be served again forever.
            if records.len() == before_page {
                warn!(
                    source = %source_id,
                    before_id = ?before_id,
                    "upstream page had no older messages, treating history as exhausted"
                );
                break;
            }
        }

        Ok(records)
    }

    async fn build_record(
        &self,
        source_id: &str,
        title: &str,
        msg: UpstreamMessage,
    ) -> MessageRecord {
        let attachment_path = if msg.has_photo() {
            self.ensure_attachment(source_id, &msg).await
        } else {
            None
        };

        MessageRecord {
            source_id: source_id.to_string(),
            source_display_name: title.to_string(),
            message_id: msg.id,
            timestamp: msg.date,
            text: msg.text.unwrap_or_default(),
            has_attachment: msg.media.is_some(),
            attachment_path,
            engagement_views: msg.views.unwrap_or(0),
            engagement_forwards: msg.forwards.unwrap_or(0),
        }
    }

    /// Download the photo unless a non-empty copy is already on disk.
    /// Returns the stored path, or `None` when no usable file could be saved.
    async fn ensure_attachment(&self, source_id: &str, msg: &UpstreamMessage) -> Option<String> {
        let path = self.writer.layout().attachment_path(source_id, msg.id);
        let path_str = path.to_string_lossy().into_owned();

        if self.writer.attachment_ready(&path) {
            counter!("ingest_attachments_skipped_total").increment(1);
            return Some(path_str);
        }

        let bytes = match self.source.download_photo(source_id, msg).await {
            Ok(bytes) if bytes.is_empty() => {
                warn!(source = %source_id, message_id = msg.id, "empty photo download");
                counter!("ingest_attachment_errors_total").increment(1);
                return None;
            }
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(source = %source_id, message_id = msg.id, error = %e, "failed to download photo");
                counter!("ingest_attachment_errors_total").increment(1);
                return None;
            }
        };

        match self.writer.store_attachment(&path, &bytes) {
            Ok(()) => {
                counter!("ingest_attachments_downloaded_total").increment(1);
                Some(path_str)
            }
            Err(e) => {
                warn!(source = %source_id, message_id = msg.id, error = %e, "failed to save photo");
                counter!("ingest_attachment_errors_total").increment(1);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::MediaKind;
    use crate::lake::LakeLayout;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Serves `total` messages (ids total..=1), photos on even ids.
    struct Paged {
        total: i64,
        pages_served: AtomicU32,
        downloads: AtomicU32,
        fail_page_after: Option<u32>,
        /// Serve the newest page on every call, whatever the cursor says.
        ignore_cursor: bool,
        requested: Mutex<Vec<(Option<i64>, usize)>>,
    }

    impl Paged {
        fn new(total: i64) -> Self {
            Self {
                total,
                pages_served: AtomicU32::new(0),
                downloads: AtomicU32::new(0),
                fail_page_after: None,
                ignore_cursor: false,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChannelSource for Paged {
        async fn resolve(&self, source_id: &str) -> Result<String, FetchError> {
            Ok(source_id.to_uppercase())
        }

        async fn fetch_page(
            &self,
            _source_id: &str,
            before_id: Option<i64>,
            max: usize,
        ) -> Result<Vec<UpstreamMessage>, FetchError> {
            let served = self.pages_served.fetch_add(1, Ordering::SeqCst);
            if self.fail_page_after.is_some_and(|n| served >= n) {
                return Err(FetchError::Upstream("boom".into()));
            }
            self.requested.lock().unwrap().push((before_id, max));
            let start = match before_id {
                Some(b) if !self.ignore_cursor => b - 1,
                _ => self.total,
            };
            Ok((1..=start)
                .rev()
                .take(max)
                .map(|id| UpstreamMessage {
                    id,
                    date: Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap(),
                    text: if id == 1 { None } else { Some(format!("m{id}")) },
                    media: (id % 2 == 0).then_some(MediaKind::Photo),
                    views: Some(id as u64 * 10),
                    forwards: None,
                })
                .collect())
        }

        async fn download_photo(
            &self,
            _source_id: &str,
            message: &UpstreamMessage,
        ) -> Result<Vec<u8>, FetchError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("jpeg-{}", message.id).into_bytes())
        }

        fn name(&self) -> &'static str {
            "paged"
        }
    }

    fn settings(limit: usize, page_size: usize) -> FetchSettings {
        FetchSettings {
            limit,
            message_delay: Duration::ZERO,
            max_retries: 2,
            page_size,
        }
    }

    #[tokio::test]
    async fn pages_until_limit_with_backwards_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DataLakeWriter::new(LakeLayout::new(tmp.path()));
        let src = Paged::new(10);
        let f = RateLimitedFetcher::new(&src, &writer, settings(5, 2));

        let out = f.fetch("alpha").await;
        assert!(out.is_done());
        let ids: Vec<i64> = out.records.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![10, 9, 8, 7, 6]);
        assert_eq!(
            *src.requested.lock().unwrap(),
            vec![(None, 2), (Some(9), 2), (Some(7), 1)]
        );
        assert_eq!(out.records[0].source_display_name, "ALPHA");
        assert_eq!(out.records[0].engagement_views, 100);
        assert_eq!(out.records[0].engagement_forwards, 0);
    }

    #[tokio::test]
    async fn stops_when_history_is_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DataLakeWriter::new(LakeLayout::new(tmp.path()));
        let src = Paged::new(3);
        let f = RateLimitedFetcher::new(&src, &writer, settings(100, 100));

        let out = f.fetch("alpha").await;
        assert_eq!(out.count(), 3);
        assert_eq!(out.records[2].text, "");
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn photos_are_saved_and_referenced() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DataLakeWriter::new(LakeLayout::new(tmp.path()));
        let src = Paged::new(2);
        let f = RateLimitedFetcher::new(&src, &writer, settings(10, 10));

        let out = f.fetch("alpha").await;
        let with_photo = &out.records[0];
        assert_eq!(with_photo.message_id, 2);
        assert!(with_photo.has_attachment);
        let p = with_photo.attachment_path.as_deref().unwrap();
        assert_eq!(std::fs::read(p).unwrap(), b"jpeg-2");

        let without = &out.records[1];
        assert!(!without.has_attachment);
        assert!(without.attachment_path.is_none());
    }

    #[tokio::test]
    async fn error_mid_fetch_aborts_with_no_records() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DataLakeWriter::new(LakeLayout::new(tmp.path()));
        let mut src = Paged::new(10);
        src.fail_page_after = Some(1);
        let f = RateLimitedFetcher::new(&src, &writer, settings(10, 3));

        let out = f.fetch("alpha").await;
        assert_eq!(out.count(), 0);
        assert_eq!(out.attempts, 1);
        match out.status {
            FetchStatus::Aborted { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn message_delay_paces_each_message() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DataLakeWriter::new(LakeLayout::new(tmp.path()));
        let src = Paged::new(4);
        let mut s = settings(4, 10);
        s.message_delay = Duration::from_millis(500);
        let f = RateLimitedFetcher::new(&src, &writer, s);

        let t0 = tokio::time::Instant::now();
        let out = f.fetch("alpha").await;
        assert_eq!(out.count(), 4);
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn page_that_ignores_the_cursor_ends_the_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DataLakeWriter::new(LakeLayout::new(tmp.path()));
        let mut src = Paged::new(5);
        src.ignore_cursor = true;
        // Would trip on the fourth page if paging never stopped.
        src.fail_page_after = Some(3);
        let f = RateLimitedFetcher::new(&src, &writer, settings(10, 2));

        let out = f.fetch("alpha").await;
        assert!(out.is_done());
        let ids: Vec<i64> = out.records.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![5, 4]);
        assert_eq!(src.pages_served.load(Ordering::SeqCst), 2);
    }
}
