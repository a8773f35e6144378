// Disconnect-storm circuit breaker.
//
// Counts close events in a sliding window. Too many closes in the window puts
// the reconnect mode into COOLDOWN until the cooldown expires. The mode is
// reported and raises an incident; reconnect delays keep the normal backoff.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tether_common::types::EpochMs;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconnectMode {
    Normal,
    Cooldown,
}

#[derive(Debug, Default)]
struct CircuitState {
    closes: VecDeque<EpochMs>,
    cooldown_until: Option<EpochMs>,
}

pub struct DisconnectCircuit {
    threshold: usize,
    window_ms: i64,
    cooldown_ms: i64,
    state: Mutex<CircuitState>,
}

impl DisconnectCircuit {
    pub fn new(threshold: usize, window_ms: u64, cooldown_ms: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            window_ms: window_ms as i64,
            cooldown_ms: cooldown_ms as i64,
            state: Mutex::new(CircuitState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a close. Returns `true` when this close trips the breaker.
    pub fn record_close(&self, now: EpochMs) -> bool {
        let mut state = self.state();
        state.closes.push_back(now);
        while state.closes.front().is_some_and(|at| now - at > self.window_ms) {
            state.closes.pop_front();
        }
        if state.cooldown_until.is_some_and(|until| until > now) {
            return false;
        }
        if state.closes.len() < self.threshold {
            return false;
        }

        let until = now + self.cooldown_ms;
        warn!(closes = state.closes.len(), window_ms = self.window_ms, cooldown_until = until, "disconnect storm, entering cooldown");
        state.closes.clear();
        state.cooldown_until = Some(until);
        true
    }

    /// End of the running cooldown, if one is running at `now`.
    pub fn cooldown_until(&self, now: EpochMs) -> Option<EpochMs> {
        self.state().cooldown_until.filter(|until| *until > now)
    }

    pub fn mode(&self, now: EpochMs) -> ReconnectMode {
        match self.cooldown_until(now) {
            Some(_) => ReconnectMode::Cooldown,
            None => ReconnectMode::Normal,
        }
    }

    /// Clear an elapsed cooldown. Returns `true` once per cooldown.
    pub fn expire(&self, now: EpochMs) -> bool {
        let mut state = self.state();
        match state.cooldown_until {
            Some(until) if until <= now => {
                state.cooldown_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn recent_closes(&self) -> usize {
        self.state().closes.len()
    }
}
