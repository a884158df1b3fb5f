use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};

use dsc_common::ContentFingerprint;

use crate::error::CacheError;

/// Bookkeeping for one cached blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedBlobMeta {
    pub sha256: ContentFingerprint,
    pub size: u64,
    /// Repository-relative path the blob was first fetched under.
    pub filename: String,
    pub added_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub pinned: bool,
    pub announced_at: Option<DateTime<Utc>>,
}

/// A streaming handle to a cached blob. Holds a reader reference on the
/// blob for its whole lifetime; dropping it releases the reference.
pub struct BlobReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    // Dropped together with the reader; decrements the blob's reader
    // count in whatever way the implementation chose.
    _guard: Box<dyn Send>,
}

impl BlobReader {
    pub fn new(inner: Box<dyn AsyncRead + Send + Unpin>, guard: Box<dyn Send>) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Storage contract for the content-addressed package cache.
///
/// `put` must hash the stream end-to-end and reject content whose
/// fingerprint does not match `expected`, leaving the cache unchanged.
/// `delete` must refuse ([`CacheError::InUse`]) while readers from `get`
/// are outstanding.
#[async_trait]
pub trait PackageCache: Send + Sync + 'static {
    async fn has(&self, hash: &ContentFingerprint) -> bool;

    /// Open a blob for streaming. Updates access bookkeeping.
    async fn get(
        &self,
        hash: &ContentFingerprint,
    ) -> Result<(BlobReader, CachedBlobMeta), CacheError>;

    /// Ingest a blob, hashing while reading. `path` is the repository-
    /// relative filename recorded in the metadata.
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        expected: &ContentFingerprint,
        path: &str,
    ) -> Result<CachedBlobMeta, CacheError>;

    async fn delete(&self, hash: &ContentFingerprint) -> Result<(), CacheError>;

    async fn pin(&self, hash: &ContentFingerprint) -> Result<(), CacheError>;

    async fn unpin(&self, hash: &ContentFingerprint) -> Result<(), CacheError>;

    async fn list(&self) -> Vec<CachedBlobMeta>;

    /// Total bytes stored.
    async fn size(&self) -> u64;

    /// Number of blobs stored.
    async fn count(&self) -> usize;

    /// Blobs that were never announced, or whose last announce is older
    /// than `reannounce_after`.
    async fn get_unannounced(&self, reannounce_after: Duration) -> Vec<ContentFingerprint>;

    async fn mark_announced(&self, hash: &ContentFingerprint) -> Result<(), CacheError>;
}
