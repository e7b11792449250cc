//! Reconnect policy: a few fast retries, then capped exponential back-off.

use std::time::Duration;

use parking_lot::Mutex;

/// Number of initial attempts that reuse `initial_delay` unchanged, so a
/// brief network blip reconnects quickly.
pub const FAST_RETRY_COUNT: u32 = 3;

/// Tunables for [`ReconnectStrategy`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay used for the fast retries and as the back-off base.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt after the fast retries.
    pub multiplier: f64,
    /// Maximum attempts before giving up. `0` means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            max_attempts: 0, // unlimited
        }
    }
}

/// Counters since the last successful connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub current_attempt: u32,
    pub last_delay: Duration,
}

/// Stateful delay calculator shared by the read loop and monitoring code.
#[derive(Debug, Default)]
pub struct ReconnectStrategy {
    config: ReconnectConfig,
    state: Mutex<ReconnectState>,
}

impl ReconnectStrategy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ReconnectState::default()),
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&self) -> Duration {
        let mut state = self.state.lock();
        let delay = self.delay_for_attempt(state.current_attempt);
        state.current_attempt = state.current_attempt.saturating_add(1);
        state.last_delay = delay;
        delay
    }

    /// Delay for a 0-indexed attempt, without touching the counters.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_secs = self.config.max_delay.as_secs_f64();
        let base_secs = self.config.initial_delay.as_secs_f64();

        if attempt < FAST_RETRY_COUNT {
            return Duration::from_secs_f64(base_secs.min(max_secs));
        }

        let exponent = i32::try_from(attempt - FAST_RETRY_COUNT).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        // `min` also absorbs overflow to infinity.
        let secs = (base_secs * factor).min(max_secs);
        Duration::from_secs_f64(secs)
    }

    /// Zero the counters after a successful (re)connection.
    pub fn reset(&self) {
        *self.state.lock() = ReconnectState::default();
    }

    pub fn can_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.state.lock().current_attempt < self.config.max_attempts
    }

    /// Attempts left before giving up, or `-1` when unlimited.
    pub fn remaining_attempts(&self) -> i64 {
        if self.config.max_attempts == 0 {
            return -1;
        }
        let used = self.state.lock().current_attempt;
        i64::from(self.config.max_attempts.saturating_sub(used))
    }

    pub fn current_attempt(&self) -> u32 {
        self.state.lock().current_attempt
    }

    pub fn last_delay(&self) -> Duration {
        self.state.lock().last_delay
    }

    pub fn snapshot(&self) -> ReconnectState {
        *self.state.lock()
    }
}
