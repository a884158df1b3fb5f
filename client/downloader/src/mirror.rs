//! Upstream mirror HTTP fetcher.
//!
//! GET / HEAD / byte-range fetching with retry, a streaming response-size
//! cap, and per-host statistics. 4xx statuses and cap violations are
//! terminal; 5xx and transport errors retry within the policy budget.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use dsc_common::retry::{retry, AttemptError, Backoff, RetryError, RetryPolicy};

use crate::DEFAULT_MAX_RESPONSE_SIZE;

const LOG_TARGET: &str = "mirror-fetcher";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("HTTP status {status}")]
    Status { status: u16 },
    #[error("response exceeds size limit ({limit} bytes)")]
    SizeLimit { limit: u64 },
    #[error("requested range starts beyond the response body")]
    RangeNotSatisfiable,
    #[error("failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// The terminal classification, looking through retry exhaustion.
    pub fn is_client_error(&self) -> bool {
        match self {
            FetchError::Status { status } => (400..500).contains(status),
            FetchError::Exhausted { source, .. } => source.is_client_error(),
            _ => false,
        }
    }

    pub fn is_size_limit(&self) -> bool {
        match self {
            FetchError::SizeLimit { .. } => true,
            FetchError::Exhausted { source, .. } => source.is_size_limit(),
            _ => false,
        }
    }
}

fn flatten(err: RetryError<FetchError>) -> FetchError {
    match err {
        RetryError::Fatal(e) => e,
        RetryError::Exhausted { attempts, source } => FetchError::Exhausted {
            attempts,
            source: Box::new(source),
        },
    }
}

/// Per-host aggregate, surfaced on the stats endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct MirrorStats {
    pub host: String,
    pub success: u64,
    pub failure: u64,
    pub avg_latency_ms: f64,
    pub avg_throughput_bps: f64,
    pub last_contact_unix: u64,
    #[serde(skip)]
    latency_samples: u64,
    #[serde(skip)]
    throughput_samples: u64,
}

impl MirrorStats {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_owned(),
            success: 0,
            failure: 0,
            avg_latency_ms: 0.0,
            avg_throughput_bps: 0.0,
            last_contact_unix: 0,
            latency_samples: 0,
            throughput_samples: 0,
        }
    }
}

fn running_avg(avg: f64, n: u64, sample: f64) -> f64 {
    let n = n as f64;
    avg * (n - 1.0) / n + sample / n
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub max_response_size: u64,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::new(3, Backoff::Exponential(Duration::from_millis(500))),
        }
    }
}

pub struct MirrorFetcher {
    client: reqwest::Client,
    config: MirrorConfig,
    stats: RwLock<HashMap<String, MirrorStats>>,
}

impl MirrorFetcher {
    pub fn new(config: MirrorConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("dswarm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Transport)?;
        Ok(Self {
            client,
            config,
            stats: RwLock::new(HashMap::new()),
        })
    }

    pub fn max_response_size(&self) -> u64 {
        self.config.max_response_size
    }

    /// Fetch a whole body.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        retry(&self.config.retry, |_| self.attempt(url, None))
            .await
            .map_err(flatten)
    }

    /// Fetch the inclusive byte range `[start, end]`; `end < 0` means
    /// open-ended. `(0, -1)` is a plain fetch. When the server ignores
    /// `Range` and answers 200 with the full body, the prefix is skipped
    /// and the suffix truncated so the caller still gets the range it
    /// asked for.
    pub async fn fetch_range(&self, url: &str, start: u64, end: i64) -> Result<Bytes, FetchError> {
        if start == 0 && end < 0 {
            return self.fetch(url).await;
        }
        retry(&self.config.retry, |_| {
            self.attempt(url, Some((start, end)))
        })
        .await
        .map_err(flatten)
    }

    /// HEAD the url and return the response headers.
    pub async fn head(&self, url: &str) -> Result<http::HeaderMap, FetchError> {
        retry(&self.config.retry, |_| async {
            let started = Instant::now();
            let host = host_of(url);
            let response = self
                .client
                .head(url)
                .send()
                .await
                .map_err(|e| self.transport_failure(&host, e))?;
            let status = response.status();
            if status.is_client_error() {
                self.record_failure(&host);
                return Err(AttemptError::Fatal(FetchError::Status {
                    status: status.as_u16(),
                }));
            }
            if status.is_server_error() {
                self.record_failure(&host);
                return Err(AttemptError::Retryable(FetchError::Status {
                    status: status.as_u16(),
                }));
            }
            self.record_success(&host, 0, started.elapsed());
            Ok(response.headers().clone())
        })
        .await
        .map_err(flatten)
    }

    /// HEAD helper: the advertised content length, if any.
    pub async fn content_length(&self, url: &str) -> Result<Option<u64>, FetchError> {
        let headers = self.head(url).await?;
        Ok(headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }

    /// Open a streaming body. Returns the reader (capped at the response
    /// size limit) and the advertised content length. Not retried.
    pub async fn stream(
        &self,
        url: &str,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, Option<u64>), FetchError> {
        let host = host_of(url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| {
                self.record_failure(&host);
                FetchError::Transport(e)
            })?;
        let status = response.status();
        if !status.is_success() {
            self.record_failure(&host);
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        self.record_success(&host, 0, Duration::ZERO);
        let content_length = response.content_length();
        let stream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        let reader = tokio_util::io::StreamReader::new(stream);
        let capped = tokio::io::AsyncReadExt::take(reader, self.config.max_response_size);
        Ok((Box::new(capped), content_length))
    }

    /// Stream a body straight into `writer`. Not retried: the writer
    /// cannot be rewound. Returns the number of bytes written.
    pub async fn fetch_to_writer<W: AsyncWrite + Unpin>(
        &self,
        url: &str,
        writer: &mut W,
    ) -> Result<u64, FetchError> {
        let host = host_of(url);
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| {
                self.record_failure(&host);
                FetchError::Transport(e)
            })?;
        let status = response.status();
        if !status.is_success() {
            self.record_failure(&host);
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        let mut response = response;
        let mut written: u64 = 0;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    self.record_failure(&host);
                    return Err(FetchError::Transport(e));
                }
            };
            written += chunk.len() as u64;
            if written > self.config.max_response_size {
                self.record_failure(&host);
                return Err(FetchError::SizeLimit {
                    limit: self.config.max_response_size,
                });
            }
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        self.record_success(&host, written, started.elapsed());
        Ok(written)
    }

    /// Stats snapshot for every host contacted so far.
    pub fn stats(&self) -> Vec<MirrorStats> {
        self.stats.read().values().cloned().collect()
    }

    async fn attempt(
        &self,
        url: &str,
        range: Option<(u64, i64)>,
    ) -> Result<Bytes, AttemptError<FetchError>> {
        let host = host_of(url);
        let started = Instant::now();

        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            let value = if end < 0 {
                format!("bytes={start}-")
            } else {
                format!("bytes={start}-{end}")
            };
            request = request.header(http::header::RANGE, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_failure(&host, e))?;
        let status = response.status();
        if status.is_client_error() {
            self.record_failure(&host);
            return Err(AttemptError::Fatal(FetchError::Status {
                status: status.as_u16(),
            }));
        }
        if status.is_server_error() {
            self.record_failure(&host);
            return Err(AttemptError::Retryable(FetchError::Status {
                status: status.as_u16(),
            }));
        }

        // An open-ended range is deliberately allowed to truncate at the
        // cap instead of failing; everything else treats the cap as a
        // terminal error.
        let truncate_at_cap = matches!(range, Some((_, end)) if end < 0);

        let mut body = BytesMut::new();
        let mut response = response;
        let mut truncated = false;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(self.transport_failure(&host, e)),
            };
            let remaining = self.config.max_response_size as usize - body.len();
            if chunk.len() > remaining {
                if truncate_at_cap {
                    body.extend_from_slice(&chunk[..remaining]);
                    truncated = true;
                    break;
                }
                self.record_failure(&host);
                return Err(AttemptError::Fatal(FetchError::SizeLimit {
                    limit: self.config.max_response_size,
                }));
            }
            body.extend_from_slice(&chunk);
        }
        let mut body = body.freeze();
        if truncated {
            tracing::warn!(
                target: LOG_TARGET,
                url,
                limit = self.config.max_response_size,
                "open-ended range truncated at response size cap",
            );
        }

        // Server ignored Range and sent the whole body: carve out the
        // requested window ourselves.
        if let Some((start, end)) = range {
            if status == http::StatusCode::OK {
                if start as usize >= body.len() {
                    self.record_failure(&host);
                    return Err(AttemptError::Fatal(FetchError::RangeNotSatisfiable));
                }
                let stop = if end < 0 {
                    body.len()
                } else {
                    ((end as usize) + 1).min(body.len())
                };
                body = body.slice(start as usize..stop);
            }
        }

        self.record_success(&host, body.len() as u64, started.elapsed());
        Ok(body)
    }

    fn transport_failure(&self, host: &str, err: reqwest::Error) -> AttemptError<FetchError> {
        self.record_failure(host);
        AttemptError::Retryable(FetchError::Transport(err))
    }

    fn record_success(&self, host: &str, bytes: u64, duration: Duration) {
        let mut stats = self.stats.write();
        let entry = stats
            .entry(host.to_owned())
            .or_insert_with(|| MirrorStats::new(host));
        entry.success += 1;
        entry.last_contact_unix = unix_now();
        let latency_ms = duration.as_secs_f64() * 1000.0;
        entry.latency_samples += 1;
        entry.avg_latency_ms = running_avg(entry.avg_latency_ms, entry.latency_samples, latency_ms);
        // Zero-duration successes carry no usable throughput signal.
        let secs = duration.as_secs_f64();
        if bytes > 0 && secs > 0.0 {
            entry.throughput_samples += 1;
            entry.avg_throughput_bps = running_avg(
                entry.avg_throughput_bps,
                entry.throughput_samples,
                bytes as f64 / secs,
            );
        }
    }

    fn record_failure(&self, host: &str) {
        let mut stats = self.stats.write();
        let entry = stats
            .entry(host.to_owned())
            .or_insert_with(|| MirrorStats::new(host));
        entry.failure += 1;
        entry.last_contact_unix = unix_now();
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_owned())
}
