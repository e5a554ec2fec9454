use async_trait::async_trait;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::ReadAt;
use anyhow::{Context, Result, anyhow, bail};

/// Connection settings for [`HttpRangeReader`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attempts per range before giving up on timeouts and connect errors.
    pub max_retry: u32,
    /// Base delay; attempt `n` sleeps `n * backoff`.
    pub backoff: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retry: 10,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Compressed source served over HTTP Range requests.
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    transferred_bytes: AtomicU64,
    config: HttpConfig,
}

impl HttpRangeReader {
    pub async fn new(url: String) -> Result<Self> {
        Self::with_config(url, HttpConfig::default()).await
    }

    /// Probe `url` with a HEAD request: the server must report a length and
    /// accept byte ranges.
    pub async fn with_config(url: String, config: HttpConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        let resp = client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("HEAD {url} failed"))?;
        if !resp.status().is_success() {
            bail!("HEAD {} returned {}", url, resp.status());
        }
        let size = probe_headers(resp.headers())?;
        tracing::debug!(%url, size, "remote source supports range requests");

        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
            config,
        })
    }

    /// Body bytes received so far, across all requests.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One GET for the inclusive byte range `first..=last`, copied into the
    /// front of `buf`. Retried on timeouts and connection failures.
    async fn get_range(&self, first: u64, last: u64, buf: &mut [u8]) -> Result<usize> {
        let range = range_header(first, last);
        let mut attempt = 0;
        loop {
            let sent = self
                .client
                .get(&self.url)
                .header(RANGE, &range)
                .send()
                .await;
            let err = match sent {
                Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT => {
                    match resp.bytes().await {
                        Ok(body) => {
                            if body.is_empty() {
                                bail!("server returned an empty body for {}", range);
                            }
                            let n = body.len().min(buf.len());
                            buf[..n].copy_from_slice(&body[..n]);
                            self.transferred_bytes.fetch_add(n as u64, Ordering::Relaxed);
                            return Ok(n);
                        }
                        Err(e) => e,
                    }
                }
                Ok(resp) => bail!("GET {} ({}) returned {}", self.url, range, resp.status()),
                Err(e) => e,
            };

            attempt += 1;
            if !(err.is_timeout() || err.is_connect()) {
                return Err(anyhow!(err).context(format!("GET {} ({}) failed", self.url, range)));
            }
            if attempt >= self.config.max_retry {
                bail!("giving up on {} after {} attempts: {}", range, attempt, err);
            }
            tracing::warn!(
                attempt,
                max = self.config.max_retry,
                %range,
                "transient HTTP error, retrying: {}",
                err
            );
            tokio::time::sleep(self.config.backoff * attempt).await;
        }
    }
}

fn range_header(first: u64, last: u64) -> String {
    format!("bytes={first}-{last}")
}

fn probe_headers(headers: &HeaderMap) -> Result<u64> {
    let accept_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none");
    if !accept_ranges.contains("bytes") {
        bail!("remote server does not support Range requests");
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("remote server did not return Content-Length"))
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        let last = offset + want as u64 - 1;

        // Servers may answer with less than asked; keep asking for the rest.
        let mut received = 0;
        while received < want {
            received += self
                .get_range(offset + received as u64, last, &mut buf[received..want])
                .await?;
        }

        Ok(received)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
