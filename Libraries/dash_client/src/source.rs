//! Byte-range capable data sources. The session and fetchers only see the
//! [`DataSource`] trait; HTTP is the production implementation and the
//! in-memory one backs the tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::{Client, StatusCode};
use tracing::{trace, warn};

use crate::error::DashError;

/// Result of one fetch: the payload, the resource's total length when the
/// server disclosed it, and the transfer time for bandwidth accounting.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub data: Bytes,
    /// Full resource size, from Content-Length or the Content-Range total.
    pub total_len: Option<u64>,
    pub duration_s: f64,
}

/// Half-open byte range request; `end: None` means "to end of resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// HTTP Range header value (inclusive last byte).
    fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetches `url`, optionally restricted to a byte range.
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<Fetched, DashError>;
}

/// Production source backed by a shared reqwest client. Transient failures
/// are retried with jittered exponential backoff; 404 is final immediately
/// since a missing segment will not appear by retrying.
pub struct HttpDataSource {
    client: Client,
    max_retries: usize,
    base_delay: Duration,
}

impl HttpDataSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl Default for HttpDataSource {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<Fetched, DashError> {
        for attempt in 0..=self.max_retries {
            let start = Instant::now();
            let mut request = self.client.get(url);
            if let Some(range) = range {
                request = request.header(reqwest::header::RANGE, range.header_value());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let total_len = total_length(&response, range);
                        let data = response.bytes().await?;
                        let duration_s = start.elapsed().as_secs_f64();
                        trace!(url, bytes = data.len(), duration_s, "fetch complete");
                        return Ok(Fetched {
                            data,
                            total_len,
                            duration_s,
                        });
                    } else if status == StatusCode::NOT_FOUND {
                        return Err(DashError::Io(format!("404 Not Found: {url}")));
                    }
                    warn!(url, %status, attempt, "fetch returned error status");
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "fetch failed");
                }
            }

            if attempt < self.max_retries {
                let backoff = self.base_delay * 2u32.pow(attempt as u32);
                let jitter = rand::thread_rng().gen_range(0..backoff.as_millis().max(1) as u64 / 2 + 1);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
            }
        }
        Err(DashError::Io(format!(
            "failed to fetch after {} attempts: {url}",
            self.max_retries + 1
        )))
    }
}

/// Total resource size as the server reports it. For a 206 the relevant
/// figure is the total after the slash in Content-Range, not Content-Length
/// (which covers only the returned slice).
fn total_length(response: &reqwest::Response, range: Option<ByteRange>) -> Option<u64> {
    if range.is_some() {
        let header = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)?
            .to_str()
            .ok()?;
        header.rsplit_once('/')?.1.parse().ok()
    } else {
        response.content_length()
    }
}

/// In-memory source for tests. Serves byte ranges out of preloaded buffers
/// and counts requests per URL.
#[derive(Default)]
pub struct MemoryDataSource {
    resources: std::sync::Mutex<HashMap<String, Bytes>>,
    requests: std::sync::atomic::AtomicUsize,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.into(), data.into());
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<Fetched, DashError> {
        self.requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let full = self
            .resources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| DashError::Io(format!("404 Not Found: {url}")))?;

        let total = full.len() as u64;
        let data = match range {
            Some(range) => {
                let start = range.start.min(total) as usize;
                let end = range.end.unwrap_or(total).min(total) as usize;
                full.slice(start..end.max(start))
            }
            None => full,
        };
        Ok(Fetched {
            data,
            total_len: Some(total),
            duration_s: 0.01,
        })
    }
}
