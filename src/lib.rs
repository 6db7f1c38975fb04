// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod enrich;
pub mod ingest;
pub mod lake;
pub mod logging;
pub mod metrics;
pub mod pipeline;

// ---- Re-exports for stable public API ----
pub use crate::config::Config;
pub use crate::ingest::fetcher::{FetchOutcome, FetchStatus, RateLimitedFetcher};
pub use crate::ingest::types::{ChannelSource, FetchError, MessageRecord, UpstreamMessage};
pub use crate::ingest::{run_once, IngestSettings, RunSummary};
pub use crate::lake::{DataLakeWriter, LakeError, LakeLayout, Manifest};
pub use crate::pipeline::{Pipeline, PipelineError, Stage, StageError, StageSuccess};
