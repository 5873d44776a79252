//! Adaptive pacing for the whole worker process.
//!
//! Counts consecutive blocking failures (rate limits, timeouts, failed
//! navigations) across every execution slot. Once the count reaches the
//! threshold, each slot pauses before its next scrape job, and every pause
//! taken without an intervening success is twice as long as the previous one:
//!
//! ```text
//! errors < threshold      --> no pause
//! errors >= threshold     --> pause min(base * 2^(multiplier-1), max); multiplier += 1
//! any success             --> errors = 0, multiplier = 1
//! ```
//!
//! This is independent of the queue's per-job retry backoff: a blocking
//! pattern means the *next* job is likely to fail too, whatever job it is.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Configuration for the throttle controller.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Consecutive blocking failures before slots start pausing.
    pub blocking_threshold: u32,

    /// Length of the first pause.
    pub base_backoff: Duration,

    /// Upper bound on a single pause.
    pub max_backoff: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            blocking_threshold: 5,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Snapshot of the shared throttle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleState {
    pub consecutive_blocking_errors: u32,
    pub backoff_multiplier: u32,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            consecutive_blocking_errors: 0,
            backoff_multiplier: 1,
        }
    }
}

/// Process-wide throttle shared by all worker slots.
///
/// Constructed once per worker process and handed to the worker loop; every
/// read-then-update happens under one lock so concurrent slots never lose an
/// update.
#[derive(Debug, Default)]
pub struct ThrottleController {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

impl ThrottleController {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned throttle mutex");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn state(&self) -> ThrottleState {
        *self.lock_state()
    }

    /// Pause length for a given multiplier: `base * 2^(multiplier-1)`, capped.
    pub fn backoff_for(&self, multiplier: u32) -> Duration {
        let exponent = multiplier.saturating_sub(1);
        1u32.checked_shl(exponent)
            .and_then(|factor| self.config.base_backoff.checked_mul(factor))
            .map_or(self.config.max_backoff, |d| d.min(self.config.max_backoff))
    }

    /// Called by a slot before it runs a scrape job.
    ///
    /// Returns the pause the slot must take, if the blocking threshold has
    /// been reached. The multiplier is bumped in the same critical section,
    /// so the next pause (by any slot) probes a longer wait.
    pub fn pause_before_job(&self) -> Option<Duration> {
        let mut state = self.lock_state();
        if state.consecutive_blocking_errors < self.config.blocking_threshold {
            return None;
        }

        let delay = self.backoff_for(state.backoff_multiplier);
        state.backoff_multiplier = state.backoff_multiplier.saturating_add(1);
        Some(delay)
    }

    /// Record a transient/blocking failure. Returns the updated state.
    pub fn record_blocking(&self) -> ThrottleState {
        let mut state = self.lock_state();
        state.consecutive_blocking_errors = state.consecutive_blocking_errors.saturating_add(1);

        if state.consecutive_blocking_errors == self.config.blocking_threshold {
            tracing::warn!(
                errors = state.consecutive_blocking_errors,
                "Blocking threshold reached, pausing slots before each job"
            );
        }
        *state
    }

    /// Record a successful scrape: reset the counters.
    pub fn record_success(&self) {
        let mut state = self.lock_state();
        if state.consecutive_blocking_errors >= self.config.blocking_threshold {
            tracing::info!(
                errors = state.consecutive_blocking_errors,
                "Scrape succeeded, lifting throttle"
            );
        }
        *state = ThrottleState::default();
    }
}
