//! Chunk sources: where the downloader can pull bytes from.
//!
//! A source serves full blobs and inclusive byte ranges. Peer sources
//! wrap the transfer client; the mirror source wraps the HTTP fetcher.
//! Failures are classified so the downloader knows whether to requeue a
//! chunk or abort the whole download.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use dsc_common::{ContentFingerprint, PeerId, PeerInfo};
use dsc_peer_transfer_service::{PeerTransferClient, TransferError};

use crate::mirror::{FetchError, MirrorFetcher};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkSourceKind {
    Peer,
    Mirror,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source does not hold the content.
    #[error("content not available from source")]
    NotAvailable,
    /// Terminal for the whole download (mirror 4xx, size cap).
    #[error("terminal source failure: {0}")]
    Fatal(String),
    /// Worth retrying on another source.
    #[error("transient source failure: {0}")]
    Transient(String),
}

/// One place the downloader can pull bytes from.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn kind(&self) -> ChunkSourceKind;

    /// Stable label for logs.
    fn label(&self) -> String;

    /// The peer behind this source, when there is one.
    fn peer_id(&self) -> Option<&PeerId> {
        None
    }

    async fn download_full(&self) -> Result<Bytes, SourceError>;

    /// Inclusive byte range `[start, end]`.
    async fn download_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError>;
}

pub struct PeerSource {
    info: PeerInfo,
    hash: ContentFingerprint,
    client: Arc<PeerTransferClient>,
}

impl PeerSource {
    pub fn new(info: PeerInfo, hash: ContentFingerprint, client: Arc<PeerTransferClient>) -> Self {
        Self { info, hash, client }
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }
}

fn classify_transfer(err: TransferError) -> SourceError {
    match err {
        TransferError::NotAvailable => SourceError::NotAvailable,
        other => SourceError::Transient(other.to_string()),
    }
}

#[async_trait]
impl ChunkSource for PeerSource {
    fn kind(&self) -> ChunkSourceKind {
        ChunkSourceKind::Peer
    }

    fn label(&self) -> String {
        format!("peer:{}", self.info.peer_id)
    }

    fn peer_id(&self) -> Option<&PeerId> {
        Some(&self.info.peer_id)
    }

    async fn download_full(&self) -> Result<Bytes, SourceError> {
        self.client
            .download_full(&self.info, &self.hash)
            .await
            .map_err(classify_transfer)
    }

    async fn download_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError> {
        self.client
            .download_range(&self.info, &self.hash, start, end)
            .await
            .map_err(classify_transfer)
    }
}

pub struct MirrorSource {
    url: String,
    fetcher: Arc<MirrorFetcher>,
}

impl MirrorSource {
    pub fn new(url: String, fetcher: Arc<MirrorFetcher>) -> Self {
        Self { url, fetcher }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify_fetch(err: FetchError) -> SourceError {
    if err.is_client_error() || err.is_size_limit() {
        SourceError::Fatal(err.to_string())
    } else {
        SourceError::Transient(err.to_string())
    }
}

#[async_trait]
impl ChunkSource for MirrorSource {
    fn kind(&self) -> ChunkSourceKind {
        ChunkSourceKind::Mirror
    }

    fn label(&self) -> String {
        format!("mirror:{}", self.url)
    }

    async fn download_full(&self) -> Result<Bytes, SourceError> {
        self.fetcher
            .fetch(&self.url)
            .await
            .map_err(classify_fetch)
    }

    async fn download_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError> {
        self.fetcher
            .fetch_range(&self.url, start, end as i64)
            .await
            .map_err(classify_fetch)
    }
}
