//! In-memory cache implementation.
//!
//! Backs tests and single-node deployments that do not need the blobs to
//! survive a restart. Blob payloads are shared [`Bytes`], so concurrent
//! readers cost no copies.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use dsc_common::ContentFingerprint;

use crate::error::CacheError;
use crate::traits::{BlobReader, CachedBlobMeta, PackageCache};

const LOG_TARGET: &str = "package-cache";

struct Entry {
    data: Bytes,
    meta: CachedBlobMeta,
    readers: Arc<AtomicUsize>,
}

#[derive(Default)]
pub struct MemoryPackageCache {
    blobs: RwLock<HashMap<ContentFingerprint, Entry>>,
}

impl MemoryPackageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

struct ReaderGuard {
    readers: Arc<AtomicUsize>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PackageCache for MemoryPackageCache {
    async fn has(&self, hash: &ContentFingerprint) -> bool {
        self.blobs.read().contains_key(hash)
    }

    async fn get(
        &self,
        hash: &ContentFingerprint,
    ) -> Result<(BlobReader, CachedBlobMeta), CacheError> {
        let mut blobs = self.blobs.write();
        let entry = blobs.get_mut(hash).ok_or(CacheError::NotFound)?;
        entry.meta.last_accessed = Utc::now();
        entry.meta.access_count += 1;
        entry.readers.fetch_add(1, Ordering::SeqCst);
        let guard = ReaderGuard {
            readers: Arc::clone(&entry.readers),
        };
        let reader = BlobReader::new(
            Box::new(Cursor::new(entry.data.clone())),
            Box::new(guard),
        );
        Ok((reader, entry.meta.clone()))
    }

    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        expected: &ContentFingerprint,
        path: &str,
    ) -> Result<CachedBlobMeta, CacheError> {
        let mut hasher = Sha256::new();
        let mut data = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            data.extend_from_slice(&buf[..n]);
        }
        let computed = ContentFingerprint::new(hasher.finalize().into());
        if computed != *expected {
            tracing::warn!(
                target: LOG_TARGET,
                expected = %expected,
                computed = %computed,
                "rejecting blob with mismatched fingerprint",
            );
            return Err(CacheError::HashMismatch {
                expected: *expected,
                computed,
            });
        }

        let now = Utc::now();
        let meta = CachedBlobMeta {
            sha256: computed,
            size: data.len() as u64,
            filename: path.to_owned(),
            added_at: now,
            last_accessed: now,
            access_count: 0,
            pinned: false,
            announced_at: None,
        };
        let entry = Entry {
            data: Bytes::from(data),
            meta: meta.clone(),
            readers: Arc::new(AtomicUsize::new(0)),
        };
        self.blobs.write().insert(computed, entry);
        tracing::debug!(target: LOG_TARGET, hash = %computed, size = meta.size, "blob stored");
        Ok(meta)
    }

    async fn delete(&self, hash: &ContentFingerprint) -> Result<(), CacheError> {
        let mut blobs = self.blobs.write();
        let entry = blobs.get(hash).ok_or(CacheError::NotFound)?;
        let readers = entry.readers.load(Ordering::SeqCst);
        if readers > 0 {
            return Err(CacheError::InUse { readers });
        }
        blobs.remove(hash);
        Ok(())
    }

    async fn pin(&self, hash: &ContentFingerprint) -> Result<(), CacheError> {
        let mut blobs = self.blobs.write();
        let entry = blobs.get_mut(hash).ok_or(CacheError::NotFound)?;
        entry.meta.pinned = true;
        Ok(())
    }

    async fn unpin(&self, hash: &ContentFingerprint) -> Result<(), CacheError> {
        let mut blobs = self.blobs.write();
        let entry = blobs.get_mut(hash).ok_or(CacheError::NotFound)?;
        entry.meta.pinned = false;
        Ok(())
    }

    async fn list(&self) -> Vec<CachedBlobMeta> {
        self.blobs
            .read()
            .values()
            .map(|entry| entry.meta.clone())
            .collect()
    }

    async fn size(&self) -> u64 {
        self.blobs
            .read()
            .values()
            .map(|entry| entry.meta.size)
            .sum()
    }

    async fn count(&self) -> usize {
        self.blobs.read().len()
    }

    async fn get_unannounced(&self, reannounce_after: Duration) -> Vec<ContentFingerprint> {
        // Clamp to a decade so absurd TTLs cannot overflow the datetime.
        let secs = reannounce_after.as_secs().min(10 * 365 * 24 * 3600) as i64;
        let cutoff = Utc::now() - chrono::Duration::seconds(secs);
        self.blobs
            .read()
            .values()
            .filter(|entry| match entry.meta.announced_at {
                None => true,
                Some(at) => at < cutoff,
            })
            .map(|entry| entry.meta.sha256)
            .collect()
    }

    async fn mark_announced(&self, hash: &ContentFingerprint) -> Result<(), CacheError> {
        let mut blobs = self.blobs.write();
        let entry = blobs.get_mut(hash).ok_or(CacheError::NotFound)?;
        entry.meta.announced_at = Some(Utc::now());
        Ok(())
    }
}
