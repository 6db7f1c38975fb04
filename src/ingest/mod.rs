// src/ingest/mod.rs
pub mod config;
pub mod fetcher;
pub mod providers;
pub mod types;

use chrono::NaiveDate;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::ingest::fetcher::{FetchSettings, FetchStatus, RateLimitedFetcher};
use crate::ingest::types::{normalize_source_id, ChannelSource};
use crate::lake::{DataLakeWriter, LakeError, Manifest};

/// One-time metrics registration (so series show up in the exposition).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_messages_total", "Messages turned into records.");
        describe_counter!(
            "ingest_attachments_downloaded_total",
            "Photos downloaded and stored in the lake."
        );
        describe_counter!(
            "ingest_attachments_skipped_total",
            "Photos already on disk, not downloaded again."
        );
        describe_counter!(
            "ingest_attachment_errors_total",
            "Photo downloads or writes that failed."
        );
        describe_counter!("ingest_throttle_total", "Throttle signals from the upstream.");
        describe_counter!(
            "ingest_source_aborts_total",
            "Sources abandoned with zero records."
        );
        describe_counter!("ingest_runs_total", "Completed ingestion runs.");
        describe_histogram!(
            "ingest_upstream_request_ms",
            "Upstream gateway request latency in milliseconds."
        );
        describe_gauge!("ingest_run_last_ts", "Unix ts when an ingestion run last completed.");
    });
}

/// Run parameters for one ingestion pass over all configured sources.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub sources: Vec<String>,
    pub limit: usize,
    pub message_delay: Duration,
    pub channel_delay: Duration,
    pub max_retries: u32,
    pub page_size: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        let f = FetchSettings::default();
        Self {
            sources: Vec::new(),
            limit: f.limit,
            message_delay: f.message_delay,
            channel_delay: Duration::from_secs(3),
            max_retries: f.max_retries,
            page_size: f.page_size,
        }
    }
}

impl IngestSettings {
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            limit: self.limit,
            message_delay: self.message_delay,
            max_retries: self.max_retries,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub day: NaiveDate,
    /// Every configured source; aborted ones count 0.
    pub counts: BTreeMap<String, usize>,
    /// What was persisted: aborted sources are absent.
    pub manifest: Manifest,
    pub aborted: Vec<String>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Ingest every configured source for `day`, one after another.
///
/// Each finished source is persisted right away, so a later failure cannot
/// lose it. Any manifest from an earlier run of the same day is removed before
/// the first partition is touched and the new one is written last; if any lake
/// write fails the run stops with that error and no manifest exists for the day.
pub async fn run_once(
    source: &dyn ChannelSource,
    writer: &DataLakeWriter,
    settings: &IngestSettings,
    day: NaiveDate,
) -> Result<RunSummary, LakeError> {
    ensure_metrics_described();

    let fetcher = RateLimitedFetcher::new(source, writer, settings.fetch_settings());
    let mut counts = BTreeMap::new();
    let mut manifest = Manifest::new();
    let mut aborted = Vec::new();
    let mut snapshot = Vec::new();

    tracing::info!(
        sources = settings.sources.len(),
        day = %day,
        provider = source.name(),
        "starting ingestion run"
    );

    writer.clear_manifest(day)?;

    let last = settings.sources.len().saturating_sub(1);
    for (i, raw) in settings.sources.iter().enumerate() {
        let source_id = normalize_source_id(raw);
        tracing::info!(source = %source_id, "scraping source");

        let outcome = fetcher.fetch(&source_id).await;
        counts.insert(source_id.clone(), outcome.count());

        match outcome.status {
            FetchStatus::Done => {
                writer.write_partition(&source_id, day, &outcome.records)?;
                manifest.record(source_id.as_str(), outcome.records.len());
                snapshot.extend(outcome.records);

                if i < last && !settings.channel_delay.is_zero() {
                    tokio::time::sleep(settings.channel_delay).await;
                }
            }
            FetchStatus::Aborted { reason } => {
                tracing::warn!(source = %source_id, reason = %reason, "source skipped for this run");
                aborted.push(source_id);
            }
        }
    }

    writer.write_csv_snapshot(day, &snapshot)?;
    writer.write_manifest(day, &manifest)?;

    let now = chrono::Utc::now().timestamp().max(0) as f64;
    counter!("ingest_runs_total").increment(1);
    gauge!("ingest_run_last_ts").set(now);

    tracing::info!(
        day = %day,
        total = snapshot.len(),
        aborted = aborted.len(),
        "ingestion run complete"
    );

    Ok(RunSummary {
        day,
        counts,
        manifest,
        aborted,
    })
}
