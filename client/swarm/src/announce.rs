//! Content announcement.
//!
//! A bounded worker pool owns every DHT publish: `announce` is a
//! non-blocking enqueue, a full queue drops the announce (the periodic
//! reannounce pass recovers it later), and shutdown cancels the announce
//! context before the queue closes so no worker waits on a dead channel.
//! In private-swarm mode announcements are suppressed entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use dsc_common::ContentFingerprint;
use dsc_package_cache::PackageCache;

use crate::dht::ProviderDht;

const LOG_TARGET: &str = "announce";

#[derive(Clone, Debug)]
pub struct AnnounceConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub announce_timeout: Duration,
    /// Private-swarm mode: skip all DHT publishes.
    pub suppress: bool,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            workers: 4,
            announce_timeout: Duration::from_secs(30),
            suppress: false,
        }
    }
}

pub struct AnnouncePool {
    tx: Mutex<Option<mpsc::Sender<ContentFingerprint>>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dropped: AtomicU64,
    announced: AtomicU64,
    suppress: bool,
}

impl AnnouncePool {
    pub fn new(dht: Arc<dyn ProviderDht>, config: AnnounceConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();

        let pool = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            cancel: cancel.clone(),
            workers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            announced: AtomicU64::new(0),
            suppress: config.suppress,
        });

        if !config.suppress {
            let mut workers = pool.workers.lock();
            for _ in 0..config.workers.max(1) {
                let rx = Arc::clone(&rx);
                let dht = Arc::clone(&dht);
                let cancel = cancel.clone();
                let announce_timeout = config.announce_timeout;
                let pool_ref = Arc::clone(&pool);
                workers.push(tokio::spawn(async move {
                    loop {
                        let received = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = cancel.cancelled() => None,
                                msg = rx.recv() => msg,
                            }
                        };
                        let Some(hash) = received else { break };
                        let key = hash.dht_key();
                        match timeout(announce_timeout, dht.provide(&key)).await {
                            Ok(Ok(())) => {
                                pool_ref.announced.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(target: LOG_TARGET, key, "announced");
                            }
                            Ok(Err(err)) => {
                                tracing::warn!(target: LOG_TARGET, key, error = %err, "announce failed");
                            }
                            Err(_) => {
                                tracing::warn!(target: LOG_TARGET, key, "announce timed out");
                            }
                        }
                    }
                }));
            }
        }

        pool
    }

    /// Enqueue an announce without blocking. Returns whether the hash
    /// was accepted (false when suppressed or the queue is full).
    pub fn announce(&self, hash: ContentFingerprint) -> bool {
        if self.suppress {
            return false;
        }
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(hash) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(hash)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: LOG_TARGET,
                    hash = %hash,
                    "announce queue full, dropping (reannounce will recover)",
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn announced(&self) -> u64 {
        self.announced.load(Ordering::Relaxed)
    }

    /// Cancel the announce context, close the queue and wait (bounded)
    /// for the workers to drain.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.cancel.cancel();
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if timeout(drain_timeout, worker).await.is_err() {
                tracing::warn!(target: LOG_TARGET, "announce worker did not drain in time");
            }
        }
    }
}

/// Periodically re-announce cached blobs whose records have gone stale,
/// and pick up announces the bounded queue had to drop.
pub fn spawn_reannounce_loop(
    cache: Arc<dyn PackageCache>,
    pool: Arc<AnnouncePool>,
    interval: Duration,
    reannounce_after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let stale = cache.get_unannounced(reannounce_after).await;
            if stale.is_empty() {
                continue;
            }
            tracing::debug!(target: LOG_TARGET, count = stale.len(), "reannouncing blobs");
            for hash in stale {
                if pool.announce(hash) {
                    if let Err(err) = cache.mark_announced(&hash).await {
                        tracing::debug!(target: LOG_TARGET, hash = %hash, error = %err, "mark_announced failed");
                    }
                }
            }
        }
    })
}
