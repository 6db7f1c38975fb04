// src/ingest/providers/mod.rs
pub mod fixture;
pub mod http;

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::config::{UpstreamConfig, UpstreamKind};
use crate::ingest::types::ChannelSource;
pub use fixture::FixtureSource;
pub use http::HttpSource;

/// Build the configured upstream.
pub fn from_config(cfg: &UpstreamConfig) -> Result<Box<dyn ChannelSource>> {
    match cfg.kind {
        UpstreamKind::Http => {
            let base = cfg
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow!("upstream.base_url is required for kind = \"http\""))?;
            let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
            Ok(Box::new(HttpSource::new(base, cfg.token.clone(), timeout)?))
        }
        UpstreamKind::Fixture => {
            let path = cfg
                .fixture_path
                .as_deref()
                .ok_or_else(|| anyhow!("upstream.fixture_path is required for kind = \"fixture\""))?;
            Ok(Box::new(FixtureSource::from_path(path)?))
        }
    }
}
