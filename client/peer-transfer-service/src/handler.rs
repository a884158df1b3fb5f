//! Inbound transfer handler and upload admission.
//!
//! Serves cached blobs to peers. Every accepted stream gets a hard
//! deadline before any I/O; the request is read, checked against the
//! admission limits, and answered either with the payload (rate limited)
//! or with a zero size word. Structural and semantic request errors all
//! take the zero-size path so remote peers can back off cleanly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use dsc_common::PeerId;
use dsc_package_cache::PackageCache;
use dsc_peer_manager::{PeerRateLimiters, PeerScorer};

use crate::wire::{self, TransferRequest, WireError};
use crate::{DEFAULT_MAX_CONCURRENT_UPLOADS, DEFAULT_MAX_TRANSFER_SIZE, DEFAULT_MAX_UPLOADS_PER_PEER};

const LOG_TARGET: &str = "peer-transfer-service";
const AUDIT_TARGET: &str = "audit";

/// Payload bytes written per rate-limit acquisition.
const WRITE_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct TransferServiceConfig {
    pub max_concurrent_uploads: usize,
    pub max_uploads_per_peer: usize,
    pub max_transfer_size: u64,
    /// Whole-stream deadline, set before any I/O on the stream.
    pub stream_deadline: Duration,
}

impl Default for TransferServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            max_uploads_per_peer: DEFAULT_MAX_UPLOADS_PER_PEER,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            stream_deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct UploadCounters {
    active: usize,
    per_peer: HashMap<String, usize>,
}

pub struct PeerTransferService {
    cache: Arc<dyn PackageCache>,
    scorer: Arc<PeerScorer>,
    limiters: Arc<PeerRateLimiters>,
    config: TransferServiceConfig,
    uploads: Mutex<UploadCounters>,
}

impl PeerTransferService {
    pub fn new(
        cache: Arc<dyn PackageCache>,
        scorer: Arc<PeerScorer>,
        limiters: Arc<PeerRateLimiters>,
        config: TransferServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            scorer,
            limiters,
            config,
            uploads: Mutex::new(UploadCounters::default()),
        })
    }

    /// Accept loop. Runs until `cancel` fires; each stream is served on
    /// its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        tracing::info!(
            target: LOG_TARGET,
            addr = ?listener.local_addr().ok(),
            "peer transfer service listening",
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move {
                            service.handle_conn(stream, remote).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(target: LOG_TARGET, error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::debug!(target: LOG_TARGET, "peer transfer service stopped");
    }

    async fn handle_conn(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        // Plain TCP carries no authenticated peer identity, so admission
        // is keyed by the remote IP.
        let peer_key = remote.ip().to_string();
        match timeout(
            self.config.stream_deadline,
            self.answer(&mut stream, &peer_key),
        )
        .await
        {
            Err(_) => {
                tracing::debug!(target: LOG_TARGET, peer = %peer_key, "stream deadline exceeded");
            }
            Ok(Err(err)) => {
                tracing::debug!(target: LOG_TARGET, peer = %peer_key, error = %err, "stream error");
            }
            Ok(Ok(())) => {}
        }
    }

    async fn answer(&self, stream: &mut TcpStream, peer_key: &str) -> std::io::Result<()> {
        let request = match wire::read_request(stream).await {
            Ok(request) => request,
            Err(WireError::Malformed(reason)) => {
                tracing::debug!(target: LOG_TARGET, peer = %peer_key, reason, "malformed request");
                return wire::write_size(stream, 0).await;
            }
            Err(WireError::Io(err)) => return Err(err),
        };

        if !self.try_admit(peer_key) {
            tracing::debug!(target: LOG_TARGET, peer = %peer_key, "upload admission denied");
            return wire::write_size(stream, 0).await;
        }
        let _admission = AdmissionGuard {
            service: self,
            key: peer_key.to_owned(),
        };

        let Some(payload) = self.lookup(&request).await else {
            return wire::write_size(stream, 0).await;
        };

        wire::write_size(stream, payload.len() as u64).await?;

        let peer_id = PeerId::from(peer_key);
        for chunk in payload.chunks(WRITE_CHUNK) {
            self.limiters.acquire(&peer_id, chunk.len()).await;
            stream.write_all(chunk).await?;
        }
        stream.flush().await?;

        self.scorer.record_upload(&peer_id, payload.len() as u64);
        tracing::info!(
            target: AUDIT_TARGET,
            peer = %peer_id,
            hash = %request.hash(),
            bytes = payload.len(),
            range = matches!(request, TransferRequest::Range { .. }),
            "upload served",
        );
        Ok(())
    }

    /// Resolve a request to its payload, or `None` for any request that
    /// must be answered with `size = 0`.
    async fn lookup(&self, request: &TransferRequest) -> Option<Bytes> {
        let (mut reader, meta) = self.cache.get(request.hash()).await.ok()?;

        let (start, end) = match *request {
            TransferRequest::Full { .. } => {
                if meta.size > self.config.max_transfer_size {
                    return None;
                }
                if meta.size == 0 {
                    return None;
                }
                (0, meta.size - 1)
            }
            TransferRequest::Range { start, end, .. } => {
                if start > i64::MAX as u64 || end > i64::MAX as u64 {
                    return None;
                }
                if start > end || end >= meta.size {
                    return None;
                }
                if end - start + 1 > self.config.max_transfer_size {
                    return None;
                }
                (start, end)
            }
        };

        let mut data = Vec::with_capacity(meta.size as usize);
        reader.read_to_end(&mut data).await.ok()?;
        if (data.len() as u64) != meta.size {
            tracing::warn!(
                target: LOG_TARGET,
                hash = %request.hash(),
                expected = meta.size,
                got = data.len(),
                "cache returned truncated blob",
            );
            return None;
        }
        Some(Bytes::from(data).slice(start as usize..=end as usize))
    }

    fn try_admit(&self, key: &str) -> bool {
        let mut uploads = self.uploads.lock();
        if uploads.active >= self.config.max_concurrent_uploads {
            return false;
        }
        let per_peer = uploads.per_peer.entry(key.to_owned()).or_insert(0);
        if *per_peer >= self.config.max_uploads_per_peer {
            return false;
        }
        *per_peer += 1;
        uploads.active += 1;
        true
    }

    fn release(&self, key: &str) {
        let mut uploads = self.uploads.lock();
        uploads.active = uploads.active.saturating_sub(1);
        if let Some(count) = uploads.per_peer.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                uploads.per_peer.remove(key);
            }
        }
    }

    /// Current number of in-flight uploads.
    pub fn active_uploads(&self) -> usize {
        self.uploads.lock().active
    }
}

struct AdmissionGuard<'a> {
    service: &'a PeerTransferService,
    key: String,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.service.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_common::{ContentFingerprint, Multiaddr, PeerInfo};
    use dsc_package_cache::MemoryPackageCache;
    use dsc_peer_manager::{RateLimitConfig, TimeoutManager};
    use crate::client::{PeerTransferClient, TransferError};

    struct TestNode {
        cache: Arc<MemoryPackageCache>,
        service: Arc<PeerTransferService>,
        addr: SocketAddr,
        cancel: CancellationToken,
    }

    async fn start_node(config: TransferServiceConfig) -> TestNode {
        let cache = Arc::new(MemoryPackageCache::new());
        let scorer = Arc::new(PeerScorer::new(Default::default()));
        let limiters = Arc::new(PeerRateLimiters::new(RateLimitConfig::default()));
        let service = PeerTransferService::new(
            cache.clone() as Arc<dyn PackageCache>,
            scorer,
            limiters,
            config,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&service).serve(listener, cancel.clone()));
        TestNode {
            cache,
            service,
            addr,
            cancel,
        }
    }

    async fn preload(node: &TestNode, content: &[u8]) -> ContentFingerprint {
        let hash = ContentFingerprint::digest(content);
        let mut reader = std::io::Cursor::new(content.to_vec());
        node.cache
            .put(&mut reader, &hash, "pool/test.deb")
            .await
            .unwrap();
        hash
    }

    fn test_client() -> PeerTransferClient {
        PeerTransferClient::new(
            Arc::new(PeerScorer::new(Default::default())),
            Arc::new(TimeoutManager::new()),
            Arc::new(PeerRateLimiters::new(RateLimitConfig::default())),
            DEFAULT_MAX_TRANSFER_SIZE,
        )
    }

    fn peer_info(addr: SocketAddr) -> PeerInfo {
        PeerInfo::new(
            dsc_common::PeerId::from("test-peer"),
            vec![Multiaddr::parse(&format!(
                "/ip4/{}/tcp/{}",
                addr.ip(),
                addr.port()
            ))],
        )
    }

    #[tokio::test]
    async fn full_transfer_wire_format() {
        let node = start_node(Default::default()).await;
        let content = b"test content for download";
        let hash = preload(&node, content).await;

        // Drive the protocol by hand to pin the wire layout.
        let mut stream = TcpStream::connect(node.addr).await.unwrap();
        let frame = TransferRequest::Full { hash }.encode();
        assert_eq!(frame.len(), 65);
        stream.write_all(&frame).await.unwrap();

        let mut size_word = [0u8; 8];
        stream.read_exact(&mut size_word).await.unwrap();
        assert_eq!(size_word, 25u64.to_be_bytes());

        let mut payload = vec![0u8; 25];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, content);

        node.cancel.cancel();
    }

    #[tokio::test]
    async fn client_downloads_full_content() {
        let node = start_node(Default::default()).await;
        let content = b"test content for download";
        let hash = preload(&node, content).await;

        let client = test_client();
        let bytes = client
            .download_full(&peer_info(node.addr), &hash)
            .await
            .unwrap();
        assert_eq!(&bytes[..], content);
    }

    #[tokio::test]
    async fn range_transfer_returns_exact_slice() {
        let node = start_node(Default::default()).await;
        let content = b"0123456789ABCDEF";
        let hash = preload(&node, content).await;

        let client = test_client();
        let bytes = client
            .download_range(&peer_info(node.addr), &hash, 5, 11)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"56789AB");
    }

    #[tokio::test]
    async fn unknown_hash_answers_size_zero() {
        let node = start_node(Default::default()).await;
        let client = test_client();
        let missing = ContentFingerprint::digest(b"never stored");
        let err = client
            .download_full(&peer_info(node.addr), &missing)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotAvailable));
    }

    #[tokio::test]
    async fn invalid_ranges_answer_size_zero() {
        let node = start_node(Default::default()).await;
        let content = b"0123456789ABCDEF";
        let hash = preload(&node, content).await;

        for (start, end) in [(11u64, 5u64), (16, 20), (0, 16), (5, i64::MAX as u64 + 1)] {
            let mut stream = TcpStream::connect(node.addr).await.unwrap();
            let frame = TransferRequest::Range { hash, start, end }.encode();
            stream.write_all(&frame).await.unwrap();
            let mut size_word = [0u8; 8];
            stream.read_exact(&mut size_word).await.unwrap();
            assert_eq!(u64::from_be_bytes(size_word), 0, "range {start}..={end}");
        }
    }

    #[tokio::test]
    async fn malformed_hex_answers_size_zero() {
        let node = start_node(Default::default()).await;
        let mut stream = TcpStream::connect(node.addr).await.unwrap();
        let mut frame = vec![b'x'; 64];
        frame.push(b'\n');
        stream.write_all(&frame).await.unwrap();
        let mut size_word = [0u8; 8];
        stream.read_exact(&mut size_word).await.unwrap();
        assert_eq!(u64::from_be_bytes(size_word), 0);
    }

    #[tokio::test]
    async fn admission_denial_answers_size_zero() {
        let node = start_node(TransferServiceConfig {
            max_concurrent_uploads: 0,
            ..Default::default()
        })
        .await;
        let content = b"present but inadmissible";
        let hash = preload(&node, content).await;

        let client = test_client();
        let err = client
            .download_full(&peer_info(node.addr), &hash)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotAvailable));
        assert_eq!(node.service.active_uploads(), 0);
    }

    #[tokio::test]
    async fn admission_counters_return_to_zero() {
        let node = start_node(Default::default()).await;
        let hash = preload(&node, b"counted content").await;
        let client = test_client();
        client
            .download_full(&peer_info(node.addr), &hash)
            .await
            .unwrap();
        assert_eq!(node.service.active_uploads(), 0);
    }
}
