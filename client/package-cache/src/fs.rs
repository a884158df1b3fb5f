//! Disk-backed cache implementation.
//!
//! Blobs live under `<root>/blobs/<hex[..2]>/<hex>`, the metadata index
//! in `<root>/meta.json`. Ingest streams to a temp file while hashing
//! and only renames into place once the fingerprint checks out, so a
//! crashed `put` never leaves a half-written blob addressable. Reader
//! refcounts are process-local; the final authority on content is the
//! fingerprint in the path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use dsc_common::ContentFingerprint;

use crate::error::CacheError;
use crate::traits::{BlobReader, CachedBlobMeta, PackageCache};

const LOG_TARGET: &str = "package-cache";
const INDEX_FILE: &str = "meta.json";

struct FsEntry {
    meta: CachedBlobMeta,
    readers: Arc<AtomicUsize>,
}

pub struct FsPackageCache {
    root: PathBuf,
    entries: RwLock<HashMap<ContentFingerprint, FsEntry>>,
    tmp_counter: AtomicU64,
}

impl FsPackageCache {
    /// Open (or initialize) a cache rooted at `root`, reloading the
    /// metadata index from a previous run. Blobs whose files have gone
    /// missing are dropped from the index.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_owned();
        std::fs::create_dir_all(root.join("blobs"))?;
        std::fs::create_dir_all(root.join("tmp"))?;

        let mut entries = HashMap::new();
        let index_path = root.join(INDEX_FILE);
        if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            let metas: Vec<CachedBlobMeta> = serde_json::from_str(&content).unwrap_or_else(|err| {
                tracing::warn!(
                    target: LOG_TARGET,
                    error = %err,
                    "cache index unreadable, rebuilding empty",
                );
                Vec::new()
            });
            for meta in metas {
                if blob_path(&root, &meta.sha256).exists() {
                    entries.insert(
                        meta.sha256,
                        FsEntry {
                            meta,
                            readers: Arc::new(AtomicUsize::new(0)),
                        },
                    );
                } else {
                    tracing::warn!(
                        target: LOG_TARGET,
                        hash = %meta.sha256,
                        "indexed blob missing on disk, dropping entry",
                    );
                }
            }
        }
        tracing::info!(
            target: LOG_TARGET,
            root = %root.display(),
            blobs = entries.len(),
            "disk cache opened",
        );
        Ok(Self {
            root,
            entries: RwLock::new(entries),
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn persist_index(&self) -> Result<(), CacheError> {
        let metas: Vec<CachedBlobMeta> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.meta.clone())
            .collect();
        let json = serde_json::to_string_pretty(&metas)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        // Unique temp name: concurrent writers race only on the final
        // atomic rename, where last-writer-wins is fine.
        let tmp = self.root.join("tmp").join(format!(
            "meta-{}.json",
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.root.join(INDEX_FILE))?;
        Ok(())
    }

    fn blob_path(&self, hash: &ContentFingerprint) -> PathBuf {
        blob_path(&self.root, hash)
    }
}

fn blob_path(root: &Path, hash: &ContentFingerprint) -> PathBuf {
    let hex = hash.to_hex();
    root.join("blobs").join(&hex[..2]).join(hex)
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
impl PackageCache for FsPackageCache {
    async fn has(&self, hash: &ContentFingerprint) -> bool {
        self.entries.read().contains_key(hash)
    }

    async fn get(
        &self,
        hash: &ContentFingerprint,
    ) -> Result<(BlobReader, CachedBlobMeta), CacheError> {
        let (meta, readers) = {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(hash).ok_or(CacheError::NotFound)?;
            entry.meta.last_accessed = Utc::now();
            entry.meta.access_count += 1;
            entry.readers.fetch_add(1, Ordering::SeqCst);
            (entry.meta.clone(), Arc::clone(&entry.readers))
        };
        let file = match tokio::fs::File::open(self.blob_path(hash)).await {
            Ok(file) => file,
            Err(err) => {
                readers.fetch_sub(1, Ordering::SeqCst);
                return Err(CacheError::Io(err));
            }
        };
        let reader = BlobReader::new(Box::new(file), Box::new(ReaderGuard { readers }));
        Ok((reader, meta))
    }

    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        expected: &ContentFingerprint,
        path: &str,
    ) -> Result<CachedBlobMeta, CacheError> {
        let tmp_path = self.root.join("tmp").join(format!(
            "put-{}-{}.part",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        let outcome = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(err) => break Err(CacheError::Io(err)),
            };
            hasher.update(&buf[..n]);
            size += n as u64;
            if let Err(err) = file.write_all(&buf[..n]).await {
                break Err(CacheError::Io(err));
            }
        };
        if let Err(err) = outcome {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        file.flush().await?;
        drop(file);

        let computed = ContentFingerprint::new(hasher.finalize().into());
        if computed != *expected {
            let _ = tokio::fs::remove_file(&tmp_path).await;
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

        let final_path = self.blob_path(&computed);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let now = Utc::now();
        let meta = CachedBlobMeta {
            sha256: computed,
            size,
            filename: path.to_owned(),
            added_at: now,
            last_accessed: now,
            access_count: 0,
            pinned: false,
            announced_at: None,
        };
        self.entries.write().insert(
            computed,
            FsEntry {
                meta: meta.clone(),
                readers: Arc::new(AtomicUsize::new(0)),
            },
        );
        self.persist_index()?;
        tracing::debug!(target: LOG_TARGET, hash = %computed, size, "blob stored");
        Ok(meta)
    }

    async fn delete(&self, hash: &ContentFingerprint) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.write();
            let entry = entries.get(hash).ok_or(CacheError::NotFound)?;
            let readers = entry.readers.load(Ordering::SeqCst);
            if readers > 0 {
                return Err(CacheError::InUse { readers });
            }
            entries.remove(hash);
        }
        match tokio::fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::Io(err)),
        }
        self.persist_index()?;
        Ok(())
    }

    async fn pin(&self, hash: &ContentFingerprint) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(hash).ok_or(CacheError::NotFound)?;
            entry.meta.pinned = true;
        }
        self.persist_index()
    }

    async fn unpin(&self, hash: &ContentFingerprint) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(hash).ok_or(CacheError::NotFound)?;
            entry.meta.pinned = false;
        }
        self.persist_index()
    }

    async fn list(&self) -> Vec<CachedBlobMeta> {
        self.entries
            .read()
            .values()
            .map(|entry| entry.meta.clone())
            .collect()
    }

    async fn size(&self) -> u64 {
        self.entries
            .read()
            .values()
            .map(|entry| entry.meta.size)
            .sum()
    }

    async fn count(&self) -> usize {
        self.entries.read().len()
    }

    async fn get_unannounced(&self, reannounce_after: Duration) -> Vec<ContentFingerprint> {
        let secs = reannounce_after.as_secs().min(10 * 365 * 24 * 3600) as i64;
        let cutoff = Utc::now() - chrono::Duration::seconds(secs);
        self.entries
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
        {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(hash).ok_or(CacheError::NotFound)?;
            entry.meta.announced_at = Some(Utc::now());
        }
        self.persist_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    async fn put_bytes(
        cache: &FsPackageCache,
        content: &[u8],
    ) -> Result<CachedBlobMeta, CacheError> {
        let expected = ContentFingerprint::digest(content);
        let mut reader = Cursor::new(content.to_vec());
        cache.put(&mut reader, &expected, "pool/test.deb").await
    }

    #[tokio::test]
    async fn put_get_round_trips_via_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsPackageCache::open(dir.path()).unwrap();
        let content = b"disk cached package bytes";
        let meta = put_bytes(&cache, content).await.unwrap();

        let (mut reader, got) = cache.get(&meta.sha256).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, content);
        assert_eq!(got.size, content.len() as u64);

        // The blob file is content-addressed on disk.
        let hex = meta.sha256.to_hex();
        assert!(dir.path().join("blobs").join(&hex[..2]).join(&hex).exists());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"durable blob";
        let hash = {
            let cache = FsPackageCache::open(dir.path()).unwrap();
            let meta = put_bytes(&cache, content).await.unwrap();
            cache.mark_announced(&meta.sha256).await.unwrap();
            meta.sha256
        };

        let cache = FsPackageCache::open(dir.path()).unwrap();
        assert!(cache.has(&hash).await);
        assert_eq!(cache.count().await, 1);
        // announced_at survived the restart.
        assert!(cache
            .get_unannounced(Duration::from_secs(3600))
            .await
            .is_empty());

        let (mut reader, _) = cache.get(&hash).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn mismatched_put_leaves_no_blob_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsPackageCache::open(dir.path()).unwrap();
        let wrong = ContentFingerprint::digest(b"expected something else");
        let mut reader = Cursor::new(b"actual bytes".to_vec());
        let err = cache.put(&mut reader, &wrong, "pool/x.deb").await.unwrap_err();
        assert!(matches!(err, CacheError::HashMismatch { .. }));
        assert_eq!(cache.count().await, 0);
        // No stray temp files either.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn delete_respects_live_readers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsPackageCache::open(dir.path()).unwrap();
        let meta = put_bytes(&cache, b"guarded").await.unwrap();

        let (reader, _) = cache.get(&meta.sha256).await.unwrap();
        assert!(matches!(
            cache.delete(&meta.sha256).await.unwrap_err(),
            CacheError::InUse { readers: 1 }
        ));
        drop(reader);
        cache.delete(&meta.sha256).await.unwrap();
        assert!(!cache.has(&meta.sha256).await);
        assert!(!dir
            .path()
            .join("blobs")
            .join(&meta.sha256.to_hex()[..2])
            .join(meta.sha256.to_hex())
            .exists());
    }

    #[tokio::test]
    async fn missing_blob_files_are_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let hash = {
            let cache = FsPackageCache::open(dir.path()).unwrap();
            put_bytes(&cache, b"soon gone").await.unwrap().sha256
        };
        let hex = hash.to_hex();
        std::fs::remove_file(dir.path().join("blobs").join(&hex[..2]).join(&hex)).unwrap();

        let cache = FsPackageCache::open(dir.path()).unwrap();
        assert!(!cache.has(&hash).await);
    }
}
