// tests/common/mod.rs
#![allow(dead_code)]

use channel_lake::ingest::types::MediaKind;
use channel_lake::{ChannelSource, FetchError, UpstreamMessage};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How a scripted channel misbehaves.
#[derive(Clone, Debug)]
pub enum Fault {
    None,
    /// Throttle the first `n` attempts, then serve normally.
    ThrottleFirst { n: u32, wait: Duration },
    ThrottleAlways { wait: Duration },
    /// Non-throttle upstream error on every attempt.
    Broken(String),
}

pub struct Channel {
    pub title: String,
    /// Newest first.
    pub messages: Vec<UpstreamMessage>,
    pub fault: Fault,
}

/// In-memory upstream. Throttles and errors fire on `resolve`, which the
/// fetcher calls once at the top of every attempt.
pub struct Scripted {
    channels: HashMap<String, Channel>,
    attempts: Mutex<HashMap<String, u32>>,
    pub downloads: AtomicU32,
}

impl Scripted {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            downloads: AtomicU32::new(0),
        }
    }

    pub fn channel(mut self, id: &str, messages: Vec<UpstreamMessage>, fault: Fault) -> Self {
        let mut messages = messages;
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        self.channels.insert(
            id.to_string(),
            Channel {
                title: format!("{id} title"),
                messages,
                fault,
            },
        );
        self
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn get(&self, id: &str) -> Result<&Channel, FetchError> {
        self.channels
            .get(id)
            .ok_or_else(|| FetchError::UnknownSource(id.to_string()))
    }
}

#[async_trait::async_trait]
impl ChannelSource for Scripted {
    async fn resolve(&self, source_id: &str) -> Result<String, FetchError> {
        let ch = self.get(source_id)?;
        let attempt = {
            let mut map = self.attempts.lock().unwrap();
            let n = map.entry(source_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        match &ch.fault {
            Fault::None => {}
            Fault::ThrottleFirst { n, wait } if attempt <= *n => {
                return Err(FetchError::Throttled { wait: *wait })
            }
            Fault::ThrottleFirst { .. } => {}
            Fault::ThrottleAlways { wait } => return Err(FetchError::Throttled { wait: *wait }),
            Fault::Broken(msg) => return Err(FetchError::Upstream(msg.clone())),
        }
        Ok(ch.title.clone())
    }

    async fn fetch_page(
        &self,
        source_id: &str,
        before_id: Option<i64>,
        max: usize,
    ) -> Result<Vec<UpstreamMessage>, FetchError> {
        let ch = self.get(source_id)?;
        Ok(ch
            .messages
            .iter()
            .filter(|m| before_id.map_or(true, |b| m.id < b))
            .take(max)
            .cloned()
            .collect())
    }

    async fn download_photo(
        &self,
        source_id: &str,
        message: &UpstreamMessage,
    ) -> Result<Vec<u8>, FetchError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{source_id}-{}", message.id).into_bytes())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

pub fn msg(id: i64, photo: bool) -> UpstreamMessage {
    UpstreamMessage {
        id,
        date: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap() + chrono::Duration::minutes(id),
        text: Some(format!("message {id}")),
        media: photo.then_some(MediaKind::Photo),
        views: Some(id as u64),
        forwards: Some(1),
    }
}

pub fn msgs(ids: std::ops::RangeInclusive<i64>) -> Vec<UpstreamMessage> {
    ids.map(|id| msg(id, false)).collect()
}
