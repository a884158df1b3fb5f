//! Per-operation timeouts that adapt to observed latency.
//!
//! Each operation kind keeps a latency EWMA and a current timeout inside
//! a configured band: failures and tail latencies grow it, steady fast
//! successes shrink it back toward the base value.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

const LOG_TARGET: &str = "timeout-manager";

/// EWMA smoothing for observed latencies.
const LATENCY_ALPHA: f64 = 0.2;
/// Growth multiplier applied on failure.
const FAILURE_GROWTH: f64 = 1.5;
/// Growth multiplier applied on a tail latency.
const TAIL_GROWTH: f64 = 1.2;
/// Shrink multiplier applied on a comfortably fast success.
const SUCCESS_SHRINK: f64 = 0.95;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Operation {
    PeerConnect,
    PeerTransfer,
    DhtLookup,
}

impl Operation {
    pub const ALL: [Operation; 3] = [
        Operation::PeerConnect,
        Operation::PeerTransfer,
        Operation::DhtLookup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::PeerConnect => "peer_connect",
            Operation::PeerTransfer => "peer_transfer",
            Operation::DhtLookup => "dht_lookup",
        }
    }

    fn band(&self) -> (Duration, Duration, Duration) {
        // (base, min, max)
        match self {
            Operation::PeerConnect => (
                Duration::from_secs(5),
                Duration::from_secs(2),
                Duration::from_secs(30),
            ),
            Operation::PeerTransfer => (
                Duration::from_secs(30),
                Duration::from_secs(10),
                Duration::from_secs(120),
            ),
            Operation::DhtLookup => (
                Duration::from_secs(10),
                Duration::from_secs(5),
                Duration::from_secs(60),
            ),
        }
    }
}

#[derive(Clone, Debug)]
struct OpState {
    base: Duration,
    min: Duration,
    max: Duration,
    current: Duration,
    avg_latency_ms: f64,
    samples: u64,
}

impl OpState {
    fn new(op: Operation) -> Self {
        let (base, min, max) = op.band();
        Self {
            base,
            min,
            max,
            current: base,
            avg_latency_ms: 0.0,
            samples: 0,
        }
    }

    fn clamp(&self, d: Duration) -> Duration {
        d.clamp(self.min, self.max)
    }
}

pub struct TimeoutManager {
    ops: RwLock<HashMap<Operation, OpState>>,
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutManager {
    pub fn new() -> Self {
        let mut ops = HashMap::new();
        for op in Operation::ALL {
            ops.insert(op, OpState::new(op));
        }
        Self {
            ops: RwLock::new(ops),
        }
    }

    /// The current timeout for `op`.
    pub fn get(&self, op: Operation) -> Duration {
        self.ops
            .read()
            .get(&op)
            .map(|state| state.current)
            .unwrap_or_else(|| op.band().0)
    }

    pub fn avg_latency_ms(&self, op: Operation) -> f64 {
        self.ops
            .read()
            .get(&op)
            .map(|state| state.avg_latency_ms)
            .unwrap_or(0.0)
    }

    /// Re-center an operation's band on a configured base value.
    pub fn set_base(&self, op: Operation, base: Duration) {
        let mut ops = self.ops.write();
        let state = ops.entry(op).or_insert_with(|| OpState::new(op));
        state.base = base;
        state.min = state.min.min(base);
        state.max = state.max.max(base.mul_f64(6.0));
        state.current = base;
    }

    pub fn record_success(&self, op: Operation, duration: Duration) {
        let mut ops = self.ops.write();
        let state = ops.entry(op).or_insert_with(|| OpState::new(op));
        let latency_ms = duration.as_secs_f64() * 1000.0;
        state.samples += 1;
        state.avg_latency_ms = if state.samples == 1 {
            latency_ms
        } else {
            state.avg_latency_ms * (1.0 - LATENCY_ALPHA) + latency_ms * LATENCY_ALPHA
        };

        if duration > state.current.mul_f64(0.8) {
            // Success, but close to the wire: widen.
            state.current = state.clamp(state.current.mul_f64(TAIL_GROWTH));
        } else if duration < state.current.mul_f64(0.5) {
            let shrunk = state.current.mul_f64(SUCCESS_SHRINK);
            state.current = state.clamp(shrunk.max(state.base.min(state.current)));
        }
    }

    pub fn record_failure(&self, op: Operation) {
        let mut ops = self.ops.write();
        let state = ops.entry(op).or_insert_with(|| OpState::new(op));
        state.current = state.clamp(state.current.mul_f64(FAILURE_GROWTH));
        tracing::trace!(
            target: LOG_TARGET,
            op = op.as_str(),
            timeout_ms = state.current.as_millis() as u64,
            "timeout grown after failure",
        );
    }

    /// Pull every operation's timeout back toward its base by `factor`
    /// in `(0, 1]`. Called periodically so past congestion does not pin
    /// timeouts high forever.
    pub fn reset_decay(&self, factor: f64) {
        let factor = factor.clamp(0.0, 1.0);
        let mut ops = self.ops.write();
        for state in ops.values_mut() {
            let current = state.current.as_secs_f64();
            let base = state.base.as_secs_f64();
            let next = current + (base - current) * factor;
            state.current = state.clamp(Duration::from_secs_f64(next));
        }
    }
}
