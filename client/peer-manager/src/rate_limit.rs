//! Byte-rate limiting.
//!
//! A token bucket of rate R bytes/s with burst R backs every limiter.
//! I/O wrappers debit tokens for the bytes they move and pace the next
//! operation with a sleep, so dropping a wrapper (or the future reading
//! from it) abandons the wait immediately. [`PeerRateLimiters`] composes
//! a per-peer bucket with the global one; both must admit.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

use dsc_common::PeerId;

use crate::scorer::PeerScore;

const LOG_TARGET: &str = "rate-limit";

struct TokenBucket {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        Self {
            tokens: rate,
            rate,
            burst: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Debit `n` tokens unconditionally; when the bucket goes negative,
    /// returns how long until the deficit is repaid.
    fn register(&mut self, n: f64) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        self.refill();
        self.tokens -= n;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.tokens / self.rate))
        }
    }
}

/// A shareable byte-rate limiter. A rate of zero makes it inert.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate_bytes_per_sec as f64)),
        }
    }

    pub fn inert() -> Self {
        Self::new(0)
    }

    pub fn is_inert(&self) -> bool {
        self.bucket.lock().rate <= 0.0
    }

    pub fn current_rate(&self) -> u64 {
        self.bucket.lock().rate.max(0.0) as u64
    }

    /// Replace the rate (and burst) in place; used by adaptive mode.
    pub fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.rate = rate_bytes_per_sec as f64;
        bucket.burst = rate_bytes_per_sec as f64;
        bucket.tokens = bucket.tokens.min(bucket.burst);
    }

    fn register(&self, n: usize) -> Option<Duration> {
        self.bucket.lock().register(n as f64)
    }

    /// Debit `n` bytes, sleeping out any resulting deficit. Cancelled by
    /// dropping the future.
    pub async fn acquire(&self, n: usize) {
        if let Some(wait) = self.register(n) {
            sleep(wait).await;
        }
    }

    /// Wrap a reader so bytes read are paced at this limiter's rate.
    pub fn reader<R: AsyncRead + Unpin>(self: &Arc<Self>, inner: R) -> RateLimited<R> {
        RateLimited::new(inner, vec![Arc::clone(self)])
    }

    /// Wrap a writer so bytes written are paced at this limiter's rate.
    pub fn writer<W: AsyncWrite + Unpin>(self: &Arc<Self>, inner: W) -> RateLimited<W> {
        RateLimited::new(inner, vec![Arc::clone(self)])
    }
}

/// I/O wrapper applying one or more limiters (every limiter must admit
/// the bytes; the longest wait wins).
pub struct RateLimited<T> {
    inner: T,
    limiters: Vec<Arc<RateLimiter>>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<T> RateLimited<T> {
    pub fn new(inner: T, limiters: Vec<Arc<RateLimiter>>) -> Self {
        Self {
            inner,
            limiters,
            delay: None,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn register(&mut self, n: usize) {
        let mut max_wait: Option<Duration> = None;
        for limiter in &self.limiters {
            if let Some(wait) = limiter.register(n) {
                max_wait = Some(max_wait.map_or(wait, |current| current.max(wait)));
            }
        }
        if let Some(wait) = max_wait {
            self.delay = Some(Box::pin(sleep(wait)));
        }
    }

    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(delay) = self.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }
        Poll::Ready(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateLimited<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            this.register(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RateLimited<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if n > 0 {
            this.register(n);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Rate-limit configuration, one knob per concern.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Global cap in bytes/s; 0 disables global limiting.
    pub global_limit: u64,
    /// Fixed per-peer cap; 0 derives `global_limit / expected_peers`.
    pub per_peer_limit: u64,
    /// Divisor for the derived per-peer cap.
    pub expected_peers: u32,
    /// Floor for adapted per-peer rates.
    pub min_peer_limit: u64,
    /// Recompute per-peer rates from scorer state.
    pub adaptive_enabled: bool,
    /// Upper multiplier for top-scored peers.
    pub max_boost_factor: f64,
    /// Peers above this latency get only the floor allocation.
    pub latency_threshold_ms: f64,
    /// Buckets for peers silent this long are dropped.
    pub idle_timeout: Duration,
    /// Adaptive recalculation cadence.
    pub adaptive_recalc_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_limit: 0,
            per_peer_limit: 0,
            expected_peers: 10,
            min_peer_limit: 64 * 1024,
            adaptive_enabled: false,
            max_boost_factor: 2.0,
            latency_threshold_ms: 500.0,
            idle_timeout: Duration::from_secs(300),
            adaptive_recalc_interval: Duration::from_secs(30),
        }
    }
}

struct PeerBucket {
    limiter: Arc<RateLimiter>,
    last_used: Instant,
}

/// Per-peer limiters composed with the global one.
pub struct PeerRateLimiters {
    config: RateLimitConfig,
    global: Arc<RateLimiter>,
    peers: Mutex<HashMap<PeerId, PeerBucket>>,
}

impl PeerRateLimiters {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = Arc::new(RateLimiter::new(config.global_limit));
        Self {
            config,
            global,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn global(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.global)
    }

    fn base_peer_rate(&self) -> u64 {
        if self.config.per_peer_limit > 0 {
            self.config.per_peer_limit
        } else if self.config.global_limit > 0 {
            (self.config.global_limit / u64::from(self.config.expected_peers.max(1)))
                .max(self.config.min_peer_limit)
        } else {
            0
        }
    }

    /// The limiters that apply to traffic with `peer`: the global bucket
    /// plus the peer's own (created on first use).
    pub fn limiters_for(&self, peer: &PeerId) -> Vec<Arc<RateLimiter>> {
        let mut limiters = vec![Arc::clone(&self.global)];
        let rate = self.base_peer_rate();
        if rate > 0 {
            let mut peers = self.peers.lock();
            let bucket = peers.entry(peer.clone()).or_insert_with(|| PeerBucket {
                limiter: Arc::new(RateLimiter::new(rate)),
                last_used: Instant::now(),
            });
            bucket.last_used = Instant::now();
            limiters.push(Arc::clone(&bucket.limiter));
        }
        limiters
    }

    /// Debit `n` bytes against both buckets, sleeping out any deficit.
    pub async fn acquire(&self, peer: &PeerId, n: usize) {
        for limiter in self.limiters_for(peer) {
            limiter.acquire(n).await;
        }
    }

    /// Recompute per-peer rates from scorer state. No-op unless adaptive
    /// mode is on.
    pub fn recalculate(&self, scores: &[PeerScore]) {
        if !self.config.adaptive_enabled {
            return;
        }
        let base = self.base_peer_rate();
        if base == 0 {
            return;
        }
        let peers = self.peers.lock();
        for score in scores {
            let Some(bucket) = peers.get(&score.peer_id) else {
                continue;
            };
            let rate = if score.avg_latency_ms > self.config.latency_threshold_ms {
                self.config.min_peer_limit
            } else {
                let boost = 1.0 + (self.config.max_boost_factor - 1.0).max(0.0) * score.score();
                (base as f64 * boost) as u64
            };
            let mut rate = rate.max(self.config.min_peer_limit);
            if self.config.global_limit > 0 {
                rate = rate.min(self.config.global_limit);
            }
            bucket.limiter.set_rate(rate);
        }
        tracing::trace!(target: LOG_TARGET, peers = peers.len(), "per-peer rates recalculated");
    }

    /// Drop buckets for peers idle past the configured timeout.
    pub fn prune_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|_, bucket| bucket.last_used.elapsed() < idle_timeout);
        before - peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn writer_paces_to_the_configured_rate() {
        let limiter = Arc::new(RateLimiter::new(1000));
        let mut writer = limiter.writer(tokio::io::sink());
        let payload = vec![0u8; 3000];

        let start = Instant::now();
        writer.write_all(&payload).await.unwrap();
        writer.flush().await.unwrap();
        let elapsed = start.elapsed();

        // N/R - burst/R = 3000/1000 - 1000/1000 = 2s.
        assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reader_paces_to_the_configured_rate() {
        let limiter = Arc::new(RateLimiter::new(1000));
        let mut reader = limiter.reader(Cursor::new(vec![0u8; 3000]));
        let mut out = Vec::new();

        let start = Instant::now();
        reader.read_to_end(&mut out).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(out.len(), 3000);
        assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn inert_limiter_never_waits() {
        let limiter = Arc::new(RateLimiter::inert());
        let start = Instant::now();
        limiter.acquire(10_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(limiter.is_inert());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_passes_without_delay() {
        let limiter = Arc::new(RateLimiter::new(1000));
        let start = Instant::now();
        limiter.acquire(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn per_peer_composes_with_global() {
        let manager = PeerRateLimiters::new(RateLimitConfig {
            global_limit: 10_000,
            per_peer_limit: 2_000,
            ..Default::default()
        });
        let limiters = manager.limiters_for(&PeerId::from("a"));
        assert_eq!(limiters.len(), 2);
        assert_eq!(limiters[0].current_rate(), 10_000);
        assert_eq!(limiters[1].current_rate(), 2_000);
    }

    #[test]
    fn per_peer_rate_derives_from_expected_peers() {
        let manager = PeerRateLimiters::new(RateLimitConfig {
            global_limit: 1_000_000,
            per_peer_limit: 0,
            expected_peers: 10,
            min_peer_limit: 1,
            ..Default::default()
        });
        let limiters = manager.limiters_for(&PeerId::from("a"));
        assert_eq!(limiters[1].current_rate(), 100_000);
    }

    #[test]
    fn adaptive_recalc_boosts_good_peers_and_floors_laggards() {
        let scorer = crate::scorer::PeerScorer::new(Default::default());
        let fast = PeerId::from("fast");
        let slow = PeerId::from("slow");
        for _ in 0..10 {
            scorer.record_success(&fast, 1 << 20, 10.0, 20.0 * 1024.0 * 1024.0);
            scorer.record_success(&slow, 1 << 10, 900.0, 1024.0);
        }

        let manager = PeerRateLimiters::new(RateLimitConfig {
            global_limit: 1_000_000,
            per_peer_limit: 100_000,
            min_peer_limit: 10_000,
            adaptive_enabled: true,
            max_boost_factor: 2.0,
            latency_threshold_ms: 500.0,
            ..Default::default()
        });
        // Materialize both buckets.
        manager.limiters_for(&fast);
        manager.limiters_for(&slow);

        manager.recalculate(&scorer.snapshot());

        let fast_rate = manager.limiters_for(&fast)[1].current_rate();
        let slow_rate = manager.limiters_for(&slow)[1].current_rate();
        assert!(fast_rate > 100_000, "boosted: {fast_rate}");
        assert!(fast_rate <= 200_000);
        assert_eq!(slow_rate, 10_000);
    }

    #[test]
    fn idle_buckets_are_pruned() {
        let manager = PeerRateLimiters::new(RateLimitConfig {
            per_peer_limit: 1_000,
            idle_timeout: Duration::from_millis(5),
            ..Default::default()
        });
        manager.limiters_for(&PeerId::from("a"));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.prune_idle(), 1);
    }
}
