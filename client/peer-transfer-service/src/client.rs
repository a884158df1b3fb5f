//! Outbound transfer client.
//!
//! Dials a peer's advertised addresses, runs one request/response
//! exchange, and feeds the outcome back into the scorer and the adaptive
//! timeout manager. Address-level eclipse filtering happens where
//! providers are discovered, not here: locally-configured or
//! mDNS-discovered peers may legitimately live on private addresses.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use dsc_common::{ContentFingerprint, PeerInfo};
use dsc_peer_manager::{Operation, PeerRateLimiters, PeerScorer, TimeoutManager};

use std::sync::Arc;

use crate::wire::{self, TransferRequest};

const LOG_TARGET: &str = "peer-transfer-client";

/// Payload bytes read per rate-limit acquisition.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The peer answered `size = 0`: it does not hold the content (or
    /// refused to serve it right now).
    #[error("peer does not have the content")]
    NotAvailable,
    #[error("peer has no dialable address")]
    NoAddress,
    #[error("could not connect to peer: {0}")]
    Connect(std::io::Error),
    #[error("transfer timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transfer exceeds size limit ({limit} bytes)")]
    SizeLimit { limit: u64 },
    #[error("transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct PeerTransferClient {
    scorer: Arc<PeerScorer>,
    timeouts: Arc<TimeoutManager>,
    limiters: Arc<PeerRateLimiters>,
    max_transfer_size: u64,
}

impl PeerTransferClient {
    pub fn new(
        scorer: Arc<PeerScorer>,
        timeouts: Arc<TimeoutManager>,
        limiters: Arc<PeerRateLimiters>,
        max_transfer_size: u64,
    ) -> Self {
        Self {
            scorer,
            timeouts,
            limiters,
            max_transfer_size,
        }
    }

    /// Fetch the whole blob `hash` from `peer`.
    pub async fn download_full(
        &self,
        peer: &PeerInfo,
        hash: &ContentFingerprint,
    ) -> Result<Bytes, TransferError> {
        self.request(peer, TransferRequest::Full { hash: *hash }, None)
            .await
    }

    /// Fetch the inclusive byte range `[start, end]` of `hash` from
    /// `peer`. The response must be exactly `end - start + 1` bytes.
    pub async fn download_range(
        &self,
        peer: &PeerInfo,
        hash: &ContentFingerprint,
        start: u64,
        end: u64,
    ) -> Result<Bytes, TransferError> {
        if start > end || end > i64::MAX as u64 {
            return Err(TransferError::Protocol(format!(
                "invalid range {start}..={end}"
            )));
        }
        let expected = end - start + 1;
        self.request(
            peer,
            TransferRequest::Range {
                hash: *hash,
                start,
                end,
            },
            Some(expected),
        )
        .await
    }

    async fn request(
        &self,
        peer: &PeerInfo,
        request: TransferRequest,
        expected_len: Option<u64>,
    ) -> Result<Bytes, TransferError> {
        let mut stream = self.dial(peer).await?;

        let transfer_timeout = self.timeouts.get(Operation::PeerTransfer);
        let started = Instant::now();
        let outcome = timeout(
            transfer_timeout,
            self.exchange(&mut stream, peer, &request, expected_len),
        )
        .await;

        match outcome {
            Err(_) => {
                self.scorer
                    .record_failure(&peer.peer_id, "transfer timeout");
                self.timeouts.record_failure(Operation::PeerTransfer);
                Err(TransferError::Timeout)
            }
            Ok(Err(err)) => {
                if !matches!(err, TransferError::NotAvailable) {
                    self.scorer
                        .record_failure(&peer.peer_id, &err.to_string());
                    self.timeouts.record_failure(Operation::PeerTransfer);
                }
                Err(err)
            }
            Ok(Ok(bytes)) => {
                let duration = started.elapsed();
                self.timeouts
                    .record_success(Operation::PeerTransfer, duration);
                let secs = duration.as_secs_f64();
                let throughput = if secs > 0.0 {
                    bytes.len() as f64 / secs
                } else {
                    // Discarded by the scorer's anti-poison rule.
                    0.0
                };
                self.scorer.record_success(
                    &peer.peer_id,
                    bytes.len() as u64,
                    duration.as_secs_f64() * 1000.0,
                    throughput,
                );
                Ok(bytes)
            }
        }
    }

    async fn dial(&self, peer: &PeerInfo) -> Result<TcpStream, TransferError> {
        let connect_timeout = self.timeouts.get(Operation::PeerConnect);
        let mut last_err: Option<std::io::Error> = None;
        for addr in &peer.addrs {
            let started = Instant::now();
            let attempt = if let Some(socket_addr) = addr.socket_addr() {
                timeout(connect_timeout, TcpStream::connect(socket_addr)).await
            } else if let (Some(host), Some(port)) = (addr.dns_name(), addr.port()) {
                timeout(connect_timeout, TcpStream::connect((host, port))).await
            } else {
                continue;
            };
            match attempt {
                Ok(Ok(stream)) => {
                    self.timeouts
                        .record_success(Operation::PeerConnect, started.elapsed());
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        peer = %peer.peer_id,
                        addr = %addr,
                        error = %err,
                        "connect failed",
                    );
                    last_err = Some(err);
                }
                Err(_) => {
                    self.timeouts.record_failure(Operation::PeerConnect);
                    last_err = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ));
                }
            }
        }
        match last_err {
            Some(err) => {
                self.scorer.record_failure(&peer.peer_id, "connect failed");
                Err(TransferError::Connect(err))
            }
            None => Err(TransferError::NoAddress),
        }
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        peer: &PeerInfo,
        request: &TransferRequest,
        expected_len: Option<u64>,
    ) -> Result<Bytes, TransferError> {
        stream.write_all(&request.encode()).await?;
        stream.flush().await?;

        let size = wire::read_size(stream).await?;
        if size == 0 {
            return Err(TransferError::NotAvailable);
        }
        if size > self.max_transfer_size {
            return Err(TransferError::SizeLimit {
                limit: self.max_transfer_size,
            });
        }
        if let Some(expected) = expected_len {
            if size != expected {
                return Err(TransferError::Protocol(format!(
                    "expected {expected} bytes, peer announced {size}"
                )));
            }
        }

        let mut payload = BytesMut::with_capacity(size as usize);
        let mut remaining = size as usize;
        let mut buf = vec![0u8; READ_CHUNK.min(remaining)];
        while remaining > 0 {
            let want = READ_CHUNK.min(remaining);
            self.limiters.acquire(&peer.peer_id, want).await;
            stream.read_exact(&mut buf[..want]).await?;
            payload.extend_from_slice(&buf[..want]);
            remaining -= want;
        }
        Ok(payload.freeze())
    }
}
