// Runtime-lag watchdog.
//
// A periodic task measures how late each of its own wake-ups is. A starved
// executor delays every timer in the process (lease refresh included), so a
// sustained p95 drift above the threshold asks for a controlled restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error};

use crate::auto_heal::{ExitHook, ExitReason};

pub struct LagWatchdog {
    window: usize,
    p95_threshold_ms: u64,
    samples: Mutex<VecDeque<u64>>,
    exit: ExitHook,
    fired: AtomicBool,
}

impl LagWatchdog {
    pub fn new(window: usize, p95_threshold_ms: u64, exit: ExitHook) -> Self {
        let window = window.max(1);
        Self {
            window,
            p95_threshold_ms,
            samples: Mutex::new(VecDeque::with_capacity(window)),
            exit,
            fired: AtomicBool::new(false),
        }
    }

    /// Record one wake-up: `elapsed` since the previous one, against the
    /// configured `interval`. Returns `true` when this sample fired the hook.
    pub fn record(&self, interval: Duration, elapsed: Duration) -> bool {
        let drift_ms = elapsed.saturating_sub(interval).as_millis() as u64;
        let p95 = {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            if samples.len() == self.window {
                samples.pop_front();
            }
            samples.push_back(drift_ms);
            if samples.len() < self.window {
                return false;
            }
            percentile_95(samples.iter().copied())
        };
        debug!(drift_ms, p95, "runtime lag sample");

        if p95 <= self.p95_threshold_ms || self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!(p95, threshold_ms = self.p95_threshold_ms, "runtime stalled, requesting restart");
        (self.exit)(ExitReason::RuntimeStall);
        true
    }

    pub fn p95_ms(&self) -> Option<u64> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        (!samples.is_empty()).then(|| percentile_95(samples.iter().copied()))
    }
}

fn percentile_95(values: impl Iterator<Item = u64>) -> u64 {
    let mut sorted: Vec<u64> = values.collect();
    sorted.sort_unstable();
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() * 95).div_ceil(100).max(1);
    sorted[rank - 1]
}
