//! Optional persistence of completed chunks.
//!
//! When a state store is attached, the downloader saves each completed
//! chunk keyed by its offset and reloads them on the next attempt, so a
//! process restart does not repeat finished work. The assembled file is
//! still hash-verified end-to-end, so stale or corrupted state can never
//! reach the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use dsc_common::ContentFingerprint;

const LOG_TARGET: &str = "download-state";

#[async_trait]
pub trait DownloadStateStore: Send + Sync {
    async fn save_chunk(
        &self,
        hash: &ContentFingerprint,
        offset: u64,
        data: &[u8],
    ) -> std::io::Result<()>;

    /// Completed chunks of `hash`, keyed by offset.
    async fn load_chunks(
        &self,
        hash: &ContentFingerprint,
    ) -> std::io::Result<HashMap<u64, Bytes>>;

    async fn clear(&self, hash: &ContentFingerprint) -> std::io::Result<()>;
}

/// Directory-backed store: `<root>/<hex>/<offset>.chunk`.
pub struct DirStateStore {
    root: PathBuf,
}

impl DirStateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }

    fn dir_for(&self, hash: &ContentFingerprint) -> PathBuf {
        self.root.join(hash.to_hex())
    }
}

#[async_trait]
impl DownloadStateStore for DirStateStore {
    async fn save_chunk(
        &self,
        hash: &ContentFingerprint,
        offset: u64,
        data: &[u8],
    ) -> std::io::Result<()> {
        let dir = self.dir_for(hash);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{offset}.chunk"));
        tokio::fs::write(&path, data).await
    }

    async fn load_chunks(
        &self,
        hash: &ContentFingerprint,
    ) -> std::io::Result<HashMap<u64, Bytes>> {
        let dir = self.dir_for(hash);
        let mut chunks = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(chunks),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(offset) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".chunk"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            match tokio::fs::read(entry.path()).await {
                Ok(data) => {
                    chunks.insert(offset, Bytes::from(data));
                }
                Err(err) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        path = %entry.path().display(),
                        error = %err,
                        "skipping unreadable chunk file",
                    );
                }
            }
        }
        Ok(chunks)
    }

    async fn clear(&self, hash: &ContentFingerprint) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(self.dir_for(hash)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
