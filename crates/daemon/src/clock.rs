// Wall-clock source for durable timestamps.
//
// Durable documents carry epoch milliseconds. `TokioClock` anchors the wall
// clock once and then follows `tokio::time::Instant`, so paused-time tests
// move lease expiry and backoff deadlines along with the timers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tether_common::types::EpochMs;
use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> EpochMs;
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_wall_ms: EpochMs,
    anchor: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self { anchor_wall_ms: Utc::now().timestamp_millis(), anchor: Instant::now() }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> EpochMs {
        self.anchor_wall_ms + self.anchor.elapsed().as_millis() as i64
    }
}

/// Hand-driven clock for unit tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: EpochMs) -> Arc<Self> {
        Arc::new(Self { now: AtomicI64::new(start) })
    }

    pub fn set(&self, now: EpochMs) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> EpochMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Render an epoch-ms timestamp as RFC 3339 (UTC, millisecond precision).
pub fn to_rfc3339(ms: EpochMs) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}
