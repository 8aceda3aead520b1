//! Per-provider rolling-window circuit breaker.
//!
//! Opens when the error share over the last `BREAKER_VOLUME_THRESHOLD` calls
//! crosses `BREAKER_ERROR_PERCENT`; half-opens after the cooldown and lets a
//! single trial call decide.

use std::collections::VecDeque;

use tracing::{info, warn};

use numio_core::{
    Timestamp, BREAKER_ERROR_PERCENT, BREAKER_HALF_OPEN_SECS, BREAKER_VOLUME_THRESHOLD,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BreakerState {
    Closed,
    Open { since: Timestamp },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    /// Outcomes of the most recent calls, true = success.
    window: VecDeque<bool>,
    state: BreakerState,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(BREAKER_VOLUME_THRESHOLD),
            state: BreakerState::Closed,
        }
    }

    /// True when calls must be skipped this cycle. Flips to half-open (and
    /// returns false) once the cooldown has passed.
    pub fn is_open(&mut self, now: Timestamp) -> bool {
        match self.state {
            BreakerState::Open { since } if now - since >= BREAKER_HALF_OPEN_SECS => {
                self.state = BreakerState::HalfOpen;
                info!("breaker half-open, trial call allowed");
                false
            }
            BreakerState::Open { .. } => true,
            _ => false,
        }
    }

    /// Whether only a single trial call should be made.
    pub fn is_half_open(&self) -> bool {
        self.state == BreakerState::HalfOpen
    }

    pub fn record_success(&mut self, _now: Timestamp) {
        if self.state == BreakerState::HalfOpen {
            // Trial succeeded; forget the bad window.
            self.window.clear();
            self.state = BreakerState::Closed;
            info!("breaker closed after successful trial");
            return;
        }
        self.push(true);
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open { since: now };
            warn!("breaker re-opened after failed trial");
            return;
        }
        self.push(false);
        if self.should_open() {
            self.state = BreakerState::Open { since: now };
            warn!("breaker opened");
        }
    }

    fn push(&mut self, ok: bool) {
        if self.window.len() == BREAKER_VOLUME_THRESHOLD {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }

    fn should_open(&self) -> bool {
        if self.window.len() < BREAKER_VOLUME_THRESHOLD {
            return false;
        }
        let errors = self.window.iter().filter(|ok| !**ok).count();
        errors * 100 > BREAKER_ERROR_PERCENT as usize * self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_under_volume_threshold() {
        let mut b = CircuitBreaker::new();
        for _ in 0..9 {
            b.record_failure(0);
        }
        assert!(!b.is_open(0));
    }

    #[test]
    fn opens_past_error_percentage() {
        let mut b = CircuitBreaker::new();
        for _ in 0..4 {
            b.record_success(0);
        }
        for _ in 0..6 {
            b.record_failure(0);
        }
        // 6 errors of 10 calls = 60% > 50%.
        assert!(b.is_open(1));
    }

    #[test]
    fn exactly_half_does_not_open() {
        let mut b = CircuitBreaker::new();
        for i in 0..10 {
            if i % 2 == 0 {
                b.record_success(0);
            } else {
                b.record_failure(0);
            }
        }
        assert!(!b.is_open(1));
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_success() {
        let mut b = CircuitBreaker::new();
        for _ in 0..10 {
            b.record_failure(100);
        }
        assert!(b.is_open(100));
        assert!(b.is_open(100 + BREAKER_HALF_OPEN_SECS - 1));
        // Cooldown elapsed: one trial allowed.
        assert!(!b.is_open(100 + BREAKER_HALF_OPEN_SECS));
        assert!(b.is_half_open());
        b.record_success(200);
        assert!(!b.is_open(200));
        assert!(!b.is_half_open());
    }

    #[test]
    fn failed_trial_reopens() {
        let mut b = CircuitBreaker::new();
        for _ in 0..10 {
            b.record_failure(100);
        }
        assert!(!b.is_open(100 + BREAKER_HALF_OPEN_SECS));
        b.record_failure(140);
        assert!(b.is_open(141));
        // A fresh cooldown applies from the failed trial.
        assert!(!b.is_open(140 + BREAKER_HALF_OPEN_SECS));
    }

    #[test]
    fn window_rolls_old_outcomes_out() {
        let mut b = CircuitBreaker::new();
        for _ in 0..5 {
            b.record_failure(0);
        }
        // Ten successes push every failure out of the window.
        for _ in 0..10 {
            b.record_success(0);
        }
        assert!(!b.is_open(1));
    }
}
