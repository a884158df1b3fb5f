//! Parallel chunked downloader.
//!
//! Splits a target into contiguous chunks covering `[0, size)`, fans the
//! chunks out across peer and mirror sources with bounded concurrency,
//! reassembles, and verifies the full-file SHA-256. Peers whose chunks
//! contributed to a failed verification are blacklisted and the download
//! is retried from the mirror alone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use dsc_common::{ContentFingerprint, PeerId, SourceKind};
use dsc_peer_manager::PeerScorer;

use crate::resume::DownloadStateStore;
use crate::source::{ChunkSource, ChunkSourceKind, SourceError};

const LOG_TARGET: &str = "parallel-downloader";
const AUDIT_TARGET: &str = "audit";

#[derive(Clone, Debug)]
pub struct DownloaderConfig {
    /// Chunk length; the last chunk may be smaller.
    pub chunk_size: u64,
    /// Concurrent chunk tasks.
    pub max_concurrent: usize,
    /// Peer failures per chunk before falling back to the mirror.
    pub peer_attempts: u32,
    /// Total attempts per chunk before the download fails.
    pub max_chunk_retries: u32,
    /// Blacklist duration for peers implicated in a hash mismatch.
    pub blacklist_duration: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_concurrent: 8,
            peer_attempts: 2,
            max_chunk_retries: 6,
            blacklist_duration: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no sources available")]
    NoSources,
    #[error("downloaded content failed hash verification (expected {expected})")]
    HashMismatch { expected: ContentFingerprint },
    #[error("chunk {index} failed after {attempts} attempts: {reason}")]
    ChunkFailed {
        index: usize,
        attempts: u32,
        reason: String,
    },
    #[error("terminal source failure: {0}")]
    Fatal(String),
}

#[derive(Debug)]
pub struct DownloadResult {
    pub data: Bytes,
    pub size: u64,
    pub source: SourceKind,
    pub peer_bytes: u64,
    pub mirror_bytes: u64,
    pub chunks_total: u32,
    pub chunks_from_peer: u32,
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug)]
struct ChunkTask {
    index: usize,
    offset: u64,
    length: usize,
    attempts: u32,
    peer_failures: u32,
}

struct RunState {
    queue: Mutex<VecDeque<ChunkTask>>,
    results: Mutex<Vec<Option<Bytes>>>,
    contributors: Mutex<Vec<Option<PeerId>>>,
    peer_bytes: AtomicU64,
    mirror_bytes: AtomicU64,
    chunks_from_peer: AtomicU32,
    fatal: Mutex<Option<DownloadError>>,
    cancel: CancellationToken,
}

struct RunOutcome {
    data: Bytes,
    peer_bytes: u64,
    mirror_bytes: u64,
    chunks_total: u32,
    chunks_from_peer: u32,
    contributors: Vec<PeerId>,
}

pub struct ParallelDownloader {
    config: DownloaderConfig,
    scorer: Arc<PeerScorer>,
    state_store: Option<Arc<dyn DownloadStateStore>>,
}

impl ParallelDownloader {
    pub fn new(config: DownloaderConfig, scorer: Arc<PeerScorer>) -> Self {
        Self {
            config,
            scorer,
            state_store: None,
        }
    }

    /// Persist completed chunks so an interrupted download resumes.
    pub fn with_state_store(mut self, store: Arc<dyn DownloadStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Download `size` bytes of `hash`, racing `peer_sources` against
    /// `mirror_source`, and verify the assembled content end-to-end.
    pub async fn download(
        &self,
        hash: &ContentFingerprint,
        size: u64,
        peer_sources: Vec<Arc<dyn ChunkSource>>,
        mirror_source: Option<Arc<dyn ChunkSource>>,
    ) -> Result<DownloadResult, DownloadError> {
        if peer_sources.is_empty() && mirror_source.is_none() {
            return Err(DownloadError::NoSources);
        }
        let started = Instant::now();

        let outcome = self
            .run_once(hash, size, peer_sources.clone(), mirror_source.clone())
            .await?;
        let computed = ContentFingerprint::digest(&outcome.data);
        if computed == *hash {
            self.clear_state(hash).await;
            return Ok(Self::finish(outcome, size, started));
        }

        // Somebody fed us bad bytes. Every peer that contributed a chunk
        // is implicated; the mirror gets one clean shot.
        tracing::warn!(
            target: LOG_TARGET,
            expected = %hash,
            computed = %computed,
            "hash verification failed, blacklisting contributors",
        );
        tracing::warn!(
            target: AUDIT_TARGET,
            hash = %hash,
            peers = outcome.contributors.len(),
            "download hash mismatch",
        );
        for peer in &outcome.contributors {
            self.scorer
                .blacklist(peer, "hash mismatch", self.config.blacklist_duration);
        }
        self.clear_state(hash).await;

        let Some(mirror) = mirror_source else {
            return Err(DownloadError::HashMismatch { expected: *hash });
        };
        let outcome = self
            .run_once(hash, size, Vec::new(), Some(mirror))
            .await?;
        let computed = ContentFingerprint::digest(&outcome.data);
        if computed != *hash {
            return Err(DownloadError::HashMismatch { expected: *hash });
        }
        self.clear_state(hash).await;
        Ok(Self::finish(outcome, size, started))
    }

    async fn clear_state(&self, hash: &ContentFingerprint) {
        if let Some(store) = &self.state_store {
            if let Err(err) = store.clear(hash).await {
                tracing::debug!(target: LOG_TARGET, error = %err, "failed to clear resume state");
            }
        }
    }

    fn finish(outcome: RunOutcome, size: u64, started: Instant) -> DownloadResult {
        let source = match (outcome.peer_bytes > 0, outcome.mirror_bytes > 0) {
            (true, true) => SourceKind::Mixed,
            (true, false) => SourceKind::Peer,
            _ => SourceKind::Mirror,
        };
        DownloadResult {
            data: outcome.data,
            size,
            source,
            peer_bytes: outcome.peer_bytes,
            mirror_bytes: outcome.mirror_bytes,
            chunks_total: outcome.chunks_total,
            chunks_from_peer: outcome.chunks_from_peer,
            duration: started.elapsed(),
        }
    }

    fn chunk_specs(&self, size: u64) -> Vec<ChunkTask> {
        let chunk_size = self.config.chunk_size.max(1);
        let mut specs = Vec::new();
        let mut offset = 0u64;
        let mut index = 0usize;
        while offset < size {
            let length = chunk_size.min(size - offset) as usize;
            specs.push(ChunkTask {
                index,
                offset,
                length,
                attempts: 0,
                peer_failures: 0,
            });
            offset += length as u64;
            index += 1;
        }
        specs
    }

    async fn run_once(
        &self,
        hash: &ContentFingerprint,
        size: u64,
        peer_sources: Vec<Arc<dyn ChunkSource>>,
        mirror_source: Option<Arc<dyn ChunkSource>>,
    ) -> Result<RunOutcome, DownloadError> {
        let specs = self.chunk_specs(size);
        let chunks_total = specs.len() as u32;
        let mut results: Vec<Option<Bytes>> = vec![None; specs.len()];

        // Reload chunks a previous run already completed.
        let mut pending = VecDeque::new();
        if let Some(store) = &self.state_store {
            match store.load_chunks(hash).await {
                Ok(saved) if !saved.is_empty() => {
                    for spec in specs {
                        match saved.get(&spec.offset) {
                            Some(data) if data.len() == spec.length => {
                                results[spec.index] = Some(data.clone());
                            }
                            _ => pending.push_back(spec),
                        }
                    }
                    tracing::debug!(
                        target: LOG_TARGET,
                        hash = %hash,
                        resumed = results.iter().filter(|r| r.is_some()).count(),
                        "resuming download from persisted chunks",
                    );
                }
                Ok(_) => pending.extend(specs),
                Err(err) => {
                    tracing::debug!(target: LOG_TARGET, error = %err, "resume state unavailable");
                    pending.extend(specs);
                }
            }
        } else {
            pending.extend(specs);
        }

        let state = Arc::new(RunState {
            queue: Mutex::new(pending),
            results: Mutex::new(results),
            contributors: Mutex::new(vec![None; chunks_total as usize]),
            peer_bytes: AtomicU64::new(0),
            mirror_bytes: AtomicU64::new(0),
            chunks_from_peer: AtomicU32::new(0),
            fatal: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let peers = Arc::new(peer_sources);
        let workers = self.config.max_concurrent.max(1).min(chunks_total.max(1) as usize);
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let state = Arc::clone(&state);
            let peers = Arc::clone(&peers);
            let mirror = mirror_source.clone();
            let scorer = Arc::clone(&self.scorer);
            let store = self.state_store.clone();
            let config = self.config.clone();
            let hash = *hash;
            tasks.spawn(async move {
                chunk_worker(state, peers, mirror, scorer, store, config, hash).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    tracing::error!(target: LOG_TARGET, error = %err, "chunk worker panicked");
                }
            }
        }

        if let Some(fatal) = state.fatal.lock().take() {
            return Err(fatal);
        }

        let results = std::mem::take(&mut *state.results.lock());
        let mut data = BytesMut::with_capacity(size as usize);
        for (index, chunk) in results.into_iter().enumerate() {
            match chunk {
                Some(bytes) => data.extend_from_slice(&bytes),
                None => {
                    return Err(DownloadError::ChunkFailed {
                        index,
                        attempts: 0,
                        reason: "chunk never completed".to_owned(),
                    })
                }
            }
        }

        let contributors = state
            .contributors
            .lock()
            .iter()
            .flatten()
            .cloned()
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        Ok(RunOutcome {
            data: data.freeze(),
            peer_bytes: state.peer_bytes.load(Ordering::SeqCst),
            mirror_bytes: state.mirror_bytes.load(Ordering::SeqCst),
            chunks_total,
            chunks_from_peer: state.chunks_from_peer.load(Ordering::SeqCst),
            contributors,
        })
    }
}

async fn chunk_worker(
    state: Arc<RunState>,
    peers: Arc<Vec<Arc<dyn ChunkSource>>>,
    mirror: Option<Arc<dyn ChunkSource>>,
    scorer: Arc<PeerScorer>,
    store: Option<Arc<dyn DownloadStateStore>>,
    config: DownloaderConfig,
    hash: ContentFingerprint,
) {
    loop {
        if state.cancel.is_cancelled() {
            break;
        }
        let Some(mut task) = state.queue.lock().pop_front() else {
            break;
        };

        let use_peer = !peers.is_empty() && task.peer_failures < config.peer_attempts;
        let source: Arc<dyn ChunkSource> = if use_peer {
            // Rotate the starting peer with the retry count so a stale
            // peer does not pin its chunk.
            Arc::clone(&peers[(task.index + task.attempts as usize) % peers.len()])
        } else if let Some(mirror) = &mirror {
            Arc::clone(mirror)
        } else {
            let mut fatal = state.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(DownloadError::ChunkFailed {
                    index: task.index,
                    attempts: task.attempts,
                    reason: "all peer sources exhausted and no mirror".to_owned(),
                });
            }
            state.cancel.cancel();
            break;
        };

        let end = task.offset + task.length as u64 - 1;
        match source.download_range(task.offset, end).await {
            Ok(bytes) if bytes.len() == task.length => {
                match source.kind() {
                    ChunkSourceKind::Peer => {
                        state
                            .peer_bytes
                            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
                        state.chunks_from_peer.fetch_add(1, Ordering::SeqCst);
                        if let Some(peer) = source.peer_id() {
                            state.contributors.lock()[task.index] = Some(peer.clone());
                        }
                    }
                    ChunkSourceKind::Mirror => {
                        state
                            .mirror_bytes
                            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
                    }
                }
                if let Some(store) = &store {
                    if let Err(err) = store.save_chunk(&hash, task.offset, &bytes).await {
                        tracing::debug!(target: LOG_TARGET, error = %err, "failed to persist chunk");
                    }
                }
                state.results.lock()[task.index] = Some(bytes);
            }
            Ok(bytes) => {
                let reason = format!(
                    "length mismatch: wanted {}, got {}",
                    task.length,
                    bytes.len()
                );
                if let Some(peer) = source.peer_id() {
                    scorer.record_failure(peer, &reason);
                }
                requeue(&state, &mut task, source.kind(), &config, &reason);
            }
            Err(SourceError::Fatal(reason)) => {
                let mut fatal = state.fatal.lock();
                if fatal.is_none() {
                    *fatal = Some(DownloadError::Fatal(reason));
                }
                state.cancel.cancel();
                break;
            }
            Err(err @ (SourceError::NotAvailable | SourceError::Transient(_))) => {
                let reason = err.to_string();
                if matches!(err, SourceError::NotAvailable) {
                    if let Some(peer) = source.peer_id() {
                        scorer.record_failure(peer, &reason);
                    }
                }
                requeue(&state, &mut task, source.kind(), &config, &reason);
            }
        }
    }
}

fn requeue(
    state: &RunState,
    task: &mut ChunkTask,
    failed_kind: ChunkSourceKind,
    config: &DownloaderConfig,
    reason: &str,
) {
    task.attempts += 1;
    if failed_kind == ChunkSourceKind::Peer {
        task.peer_failures += 1;
    }
    if task.attempts > config.max_chunk_retries {
        let mut fatal = state.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(DownloadError::ChunkFailed {
                index: task.index,
                attempts: task.attempts,
                reason: reason.to_owned(),
            });
        }
        state.cancel.cancel();
    } else {
        tracing::trace!(
            target: LOG_TARGET,
            chunk = task.index,
            attempts = task.attempts,
            reason,
            "requeueing chunk",
        );
        state.queue.lock().push_back(*task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    enum Behavior {
        /// Serve correct slices.
        Ok,
        /// Serve correct bytes only for offsets below the threshold.
        BelowOffset(u64),
        /// Always claim not to have the content.
        NotAvailable,
        /// Always fail terminally.
        Fatal,
        /// Serve corrupted bytes of the right length.
        Corrupt,
        /// Serve one byte short.
        ShortRead,
    }

    struct FakeSource {
        kind: ChunkSourceKind,
        peer: Option<PeerId>,
        data: Bytes,
        behavior: Behavior,
        calls: AtomicUsize,
        offsets: Mutex<Vec<u64>>,
    }

    impl FakeSource {
        fn new(kind: ChunkSourceKind, data: &[u8], behavior: Behavior) -> Arc<Self> {
            let peer = match kind {
                ChunkSourceKind::Peer => Some(PeerId::from("fake-peer")),
                ChunkSourceKind::Mirror => None,
            };
            Arc::new(Self {
                kind,
                peer,
                data: Bytes::copy_from_slice(data),
                behavior,
                calls: AtomicUsize::new(0),
                offsets: Mutex::new(Vec::new()),
            })
        }

        fn named_peer(data: &[u8], name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                kind: ChunkSourceKind::Peer,
                peer: Some(PeerId::from(name)),
                data: Bytes::copy_from_slice(data),
                behavior,
                calls: AtomicUsize::new(0),
                offsets: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChunkSource for FakeSource {
        fn kind(&self) -> ChunkSourceKind {
            self.kind
        }

        fn label(&self) -> String {
            "fake".to_owned()
        }

        fn peer_id(&self) -> Option<&PeerId> {
            self.peer.as_ref()
        }

        async fn download_full(&self) -> Result<Bytes, SourceError> {
            self.download_range(0, self.data.len() as u64 - 1).await
        }

        async fn download_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.offsets.lock().push(start);
            let slice = || self.data.slice(start as usize..=(end as usize));
            match &self.behavior {
                Behavior::Ok => Ok(slice()),
                Behavior::BelowOffset(limit) => {
                    if start < *limit {
                        Ok(slice())
                    } else {
                        Err(SourceError::NotAvailable)
                    }
                }
                Behavior::NotAvailable => Err(SourceError::NotAvailable),
                Behavior::Fatal => Err(SourceError::Fatal("HTTP status 404".to_owned())),
                Behavior::Corrupt => Ok(Bytes::from(vec![0xAA; (end - start + 1) as usize])),
                Behavior::ShortRead => {
                    let full = slice();
                    Ok(full.slice(..full.len().saturating_sub(1)))
                }
            }
        }
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn as_source(source: &Arc<FakeSource>) -> Arc<dyn ChunkSource> {
        Arc::clone(source) as Arc<dyn ChunkSource>
    }

    fn downloader(config: DownloaderConfig) -> (ParallelDownloader, Arc<PeerScorer>) {
        let scorer = Arc::new(PeerScorer::new(Default::default()));
        (
            ParallelDownloader::new(config, Arc::clone(&scorer)),
            scorer,
        )
    }

    fn small_chunks() -> DownloaderConfig {
        DownloaderConfig {
            chunk_size: 1024,
            max_concurrent: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mirror_only_download_covers_every_byte() {
        let data = test_data(5000);
        let hash = ContentFingerprint::digest(&data);
        let mirror = FakeSource::new(ChunkSourceKind::Mirror, &data, Behavior::Ok);
        let (downloader, _) = downloader(small_chunks());

        let result = downloader
            .download(&hash, data.len() as u64, Vec::new(), Some(as_source(&mirror)))
            .await
            .unwrap();

        assert_eq!(&result.data[..], &data[..]);
        assert_eq!(result.chunks_total, 5);
        assert_eq!(result.source, SourceKind::Mirror);
        assert_eq!(result.mirror_bytes, 5000);
        assert_eq!(result.peer_bytes, 0);
    }

    #[tokio::test]
    async fn peer_only_download_accounts_chunks() {
        let data = test_data(3000);
        let hash = ContentFingerprint::digest(&data);
        let peer = FakeSource::new(ChunkSourceKind::Peer, &data, Behavior::Ok);
        let (downloader, _) = downloader(small_chunks());

        let result = downloader
            .download(&hash, data.len() as u64, vec![as_source(&peer)], None)
            .await
            .unwrap();

        assert_eq!(&result.data[..], &data[..]);
        assert_eq!(result.source, SourceKind::Peer);
        assert_eq!(result.chunks_from_peer, 3);
        assert_eq!(result.peer_bytes, 3000);
    }

    #[tokio::test]
    async fn failing_peers_fall_back_to_the_mirror() {
        let data = test_data(2048);
        let hash = ContentFingerprint::digest(&data);
        let peer = FakeSource::new(ChunkSourceKind::Peer, &data, Behavior::NotAvailable);
        let mirror = FakeSource::new(ChunkSourceKind::Mirror, &data, Behavior::Ok);
        let (downloader, _) = downloader(small_chunks());

        let result = downloader
            .download(
                &hash,
                data.len() as u64,
                vec![as_source(&peer)],
                Some(as_source(&mirror)),
            )
            .await
            .unwrap();

        assert_eq!(&result.data[..], &data[..]);
        assert_eq!(result.source, SourceKind::Mirror);
        // Each chunk tried the peer `peer_attempts` times first.
        assert!(peer.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn mixed_download_reports_both_sources() {
        let data = test_data(4096);
        let hash = ContentFingerprint::digest(&data);
        // The peer only holds the first half.
        let peer = FakeSource::new(ChunkSourceKind::Peer, &data, Behavior::BelowOffset(2048));
        let mirror = FakeSource::new(ChunkSourceKind::Mirror, &data, Behavior::Ok);
        let (downloader, _) = downloader(DownloaderConfig {
            chunk_size: 1024,
            max_concurrent: 2,
            peer_attempts: 1,
            ..Default::default()
        });

        let result = downloader
            .download(
                &hash,
                data.len() as u64,
                vec![as_source(&peer)],
                Some(as_source(&mirror)),
            )
            .await
            .unwrap();

        assert_eq!(&result.data[..], &data[..]);
        assert_eq!(result.source, SourceKind::Mixed);
        assert_eq!(result.peer_bytes, 2048);
        assert_eq!(result.mirror_bytes, 2048);
    }

    #[tokio::test]
    async fn corrupt_peer_is_blacklisted_and_mirror_retries() {
        let data = test_data(2048);
        let hash = ContentFingerprint::digest(&data);
        let peer = FakeSource::named_peer(&data, "corruptor", Behavior::Corrupt);
        let mirror = FakeSource::new(ChunkSourceKind::Mirror, &data, Behavior::Ok);
        let (downloader, scorer) = downloader(small_chunks());

        let result = downloader
            .download(
                &hash,
                data.len() as u64,
                vec![as_source(&peer)],
                Some(as_source(&mirror)),
            )
            .await
            .unwrap();

        assert_eq!(&result.data[..], &data[..]);
        assert_eq!(result.source, SourceKind::Mirror);
        assert!(scorer.is_blacklisted(&PeerId::from("corruptor")));
    }

    #[tokio::test]
    async fn corrupt_peer_without_mirror_surfaces_verification_error() {
        let data = test_data(1024);
        let hash = ContentFingerprint::digest(&data);
        let peer = FakeSource::named_peer(&data, "corruptor", Behavior::Corrupt);
        let (downloader, _) = downloader(small_chunks());

        let err = downloader
            .download(&hash, data.len() as u64, vec![as_source(&peer)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn fatal_mirror_error_aborts_the_download() {
        let data = test_data(2048);
        let hash = ContentFingerprint::digest(&data);
        let mirror = FakeSource::new(ChunkSourceKind::Mirror, &data, Behavior::Fatal);
        let (downloader, _) = downloader(small_chunks());

        let err = downloader
            .download(&hash, data.len() as u64, Vec::new(), Some(as_source(&mirror)))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Fatal(_)), "{err:?}");
    }

    #[tokio::test]
    async fn short_reads_are_requeued_until_budget_runs_out() {
        let data = test_data(1024);
        let hash = ContentFingerprint::digest(&data);
        let mirror = FakeSource::new(ChunkSourceKind::Mirror, &data, Behavior::ShortRead);
        let (downloader, _) = downloader(DownloaderConfig {
            chunk_size: 1024,
            max_chunk_retries: 3,
            ..Default::default()
        });

        let err = downloader
            .download(&hash, data.len() as u64, Vec::new(), Some(as_source(&mirror)))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ChunkFailed { .. }), "{err:?}");
        assert_eq!(mirror.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn no_sources_is_rejected() {
        let hash = ContentFingerprint::digest(b"x");
        let (downloader, _) = downloader(small_chunks());
        let err = downloader.download(&hash, 10, Vec::new(), None).await.unwrap_err();
        assert!(matches!(err, DownloadError::NoSources));
    }

    #[tokio::test]
    async fn zero_size_download_yields_empty_verified_content() {
        let hash = ContentFingerprint::digest(b"");
        let mirror = FakeSource::new(ChunkSourceKind::Mirror, b"", Behavior::Ok);
        let (downloader, _) = downloader(small_chunks());

        let result = downloader
            .download(&hash, 0, Vec::new(), Some(as_source(&mirror)))
            .await
            .unwrap();
        assert!(result.data.is_empty());
        assert_eq!(result.chunks_total, 0);
    }

    #[tokio::test]
    async fn resume_skips_persisted_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::resume::DirStateStore::new(dir.path()));
        let data = test_data(3072);
        let hash = ContentFingerprint::digest(&data);

        // First chunk already on disk from an interrupted run.
        store.save_chunk(&hash, 0, &data[..1024]).await.unwrap();

        let mirror = FakeSource::new(ChunkSourceKind::Mirror, &data, Behavior::Ok);
        let scorer = Arc::new(PeerScorer::new(Default::default()));
        let downloader = ParallelDownloader::new(small_chunks(), scorer)
            .with_state_store(store.clone());

        let result = downloader
            .download(&hash, data.len() as u64, Vec::new(), Some(as_source(&mirror)))
            .await
            .unwrap();

        assert_eq!(&result.data[..], &data[..]);
        assert!(
            !mirror.offsets.lock().contains(&0),
            "offset 0 must come from the resume state"
        );
    }
}
