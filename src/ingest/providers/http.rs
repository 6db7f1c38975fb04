// src/ingest/providers/http.rs
//! Channel gateway over HTTP/JSON.
//!
//! - `GET {base}/channels/{id}` -> `{"title": "..."}`
//! - `GET {base}/channels/{id}/messages?limit=N[&before_id=M]` -> `[UpstreamMessage]`, newest first
//! - `GET {base}/channels/{id}/messages/{mid}/photo` -> raw bytes
//!
//! `429 Too Many Requests` becomes [`FetchError::Throttled`].

use async_trait::async_trait;
use metrics::histogram;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::ingest::types::{ChannelSource, FetchError, UpstreamMessage};

const DEFAULT_RETRY_AFTER_SECS: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    title: String,
}

pub struct HttpSource {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpSource {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("channel-lake/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5).min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }

    async fn get(&self, url: String, query: &[(&str, String)]) -> Result<Response, FetchError> {
        let mut req = self.client.get(&url).query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let t0 = std::time::Instant::now();
        let resp = req.send().await?;
        histogram!("ingest_upstream_request_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        check_status(resp).await
    }
}

#[async_trait]
impl ChannelSource for HttpSource {
    async fn resolve(&self, source_id: &str) -> Result<String, FetchError> {
        let url = format!("{}/channels/{}", self.base_url, source_id);
        let resp = match self.get(url, &[]).await {
            Err(FetchError::Upstream(msg)) if msg.starts_with("404") => {
                return Err(FetchError::UnknownSource(source_id.to_string()))
            }
            other => other?,
        };
        let info: ChannelInfo = serde_json::from_slice(&resp.bytes().await?)?;
        Ok(info.title)
    }

    async fn fetch_page(
        &self,
        source_id: &str,
        before_id: Option<i64>,
        max: usize,
    ) -> Result<Vec<UpstreamMessage>, FetchError> {
        let url = format!("{}/channels/{}/messages", self.base_url, source_id);
        let mut query = vec![("limit", max.to_string())];
        if let Some(b) = before_id {
            query.push(("before_id", b.to_string()));
        }
        let resp = self.get(url, &query).await?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    async fn download_photo(
        &self,
        source_id: &str,
        message: &UpstreamMessage,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!(
            "{}/channels/{}/messages/{}/photo",
            self.base_url, source_id, message.id
        );
        let resp = self.get(url, &[]).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

async fn check_status(resp: Response) -> Result<Response, FetchError> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let from_header = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok());
        let secs = match from_header {
            Some(s) => s,
            None => {
                let body = resp.text().await.unwrap_or_default();
                retry_after_from_body(&body).unwrap_or(DEFAULT_RETRY_AFTER_SECS)
            }
        };
        return Err(FetchError::Throttled {
            wait: wait_from_secs(secs),
        });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        return Err(FetchError::Upstream(format!("{} {}", status.as_u16(), snippet)));
    }
    Ok(resp)
}

/// `retry_after` at the top level or under `parameters` (Bot API style).
fn retry_after_from_body(body: &str) -> Option<f64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v.get("retry_after")
        .or_else(|| v.get("parameters").and_then(|p| p.get("retry_after")))
        .and_then(|x| x.as_f64())
}

fn wait_from_secs(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}
