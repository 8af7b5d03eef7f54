//! Per-symbol circuit breaker around upstream calls.
//!
//! Opens after a run of consecutive failures and rejects calls for a
//! cool-down window. After the window one trial call is let through; its
//! outcome decides whether the circuit closes again or re-opens.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call for `key` may proceed right now.
    pub fn allow(&self, key: &str) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(key) else {
            return true;
        };
        match state.opened_at {
            None => true,
            Some(opened) if opened.elapsed() >= self.cooldown => {
                // Half-open: let one trial through; the next failure re-opens
                // immediately, a success resets everything.
                state.opened_at = None;
                state.consecutive_failures = self.threshold.saturating_sub(1);
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&self, key: &str) {
        self.states.lock().remove(key);
    }

    /// Record a failure; returns true when this failure opened the circuit.
    pub fn record_failure(&self, key: &str) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(key.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.opened_at.is_none() && state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
            warn!(
                key,
                failures = state.consecutive_failures,
                "circuit opened after consecutive upstream failures"
            );
            return true;
        }
        false
    }

    pub fn is_open(&self, key: &str) -> bool {
        let states = self.states.lock();
        states
            .get(key)
            .and_then(|s| s.opened_at)
            .is_some_and(|opened| opened.elapsed() < self.cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(300));
        assert!(breaker.allow("AAPL"));
        assert!(!breaker.record_failure("AAPL"));
        assert!(!breaker.record_failure("AAPL"));
        assert!(breaker.record_failure("AAPL"), "third failure opens");
        assert!(!breaker.allow("AAPL"));
        assert!(breaker.is_open("AAPL"));
    }

    #[test]
    fn success_resets_the_run() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(300));
        breaker.record_failure("AAPL");
        breaker.record_failure("AAPL");
        breaker.record_success("AAPL");
        breaker.record_failure("AAPL");
        assert!(breaker.allow("AAPL"));
    }

    #[test]
    fn keys_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(300));
        breaker.record_failure("AAPL");
        assert!(!breaker.allow("AAPL"));
        assert!(breaker.allow("MSFT"));
    }

    #[test]
    fn half_open_after_cooldown() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.record_failure("AAPL");
        breaker.record_failure("AAPL");
        assert!(!breaker.allow("AAPL"));

        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow("AAPL"), "cooldown elapsed lets a trial through");
        // Trial failure re-opens at once.
        assert!(breaker.record_failure("AAPL"));
        assert!(!breaker.allow("AAPL"));
    }
}
