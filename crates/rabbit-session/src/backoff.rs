//! # Reconnect Backoff
//!
//! Exponential backoff used between failed connection attempts.
//!
//! Connection establishment never gives up, so unlike a retry policy there is no
//! attempt limit here. The delay starts at [`DEFAULT_INITIAL_DELAY`], grows by the
//! multiplier on every failure and is capped at [`MAX_RECONNECT_DELAY`].

use rand::Rng;
use std::time::Duration;

/// Delay before the second connection attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the delay between connection attempts.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Backoff configuration for connection attempts
///
/// # Examples
///
/// ```rust
/// use rabbit_session::backoff::BackoffPolicy;
/// use std::time::Duration;
///
/// // Default policy: 500ms initial, 5s max, 2.0x multiplier, no jitter
/// let policy = BackoffPolicy::default();
/// assert_eq!(policy.delay_for(0), Duration::from_millis(500));
/// assert_eq!(policy.delay_for(10), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Maximum delay between attempts
    pub max_delay: Duration,

    /// Exponential growth factor
    pub multiplier: f64,

    /// Whether to randomize delays. Off by default, which keeps the
    /// sequence of delays non-decreasing.
    pub use_jitter: bool,

    /// Jitter range as percentage (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
            multiplier: 2.0,
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    ///
    /// A multiplier below 1.0 would shrink delays over time, so it is raised to 1.0.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: multiplier.max(1.0),
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }

    /// Randomize delays by ±`jitter_percent`.
    pub fn with_jitter(mut self) -> Self {
        self.use_jitter = true;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the given failed attempt (0-based).
    ///
    /// Uses `initial * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs.max(0.0))
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        (delay_secs + jitter).max(0.0)
    }
}

/// Tracks consecutive failures for one connection establishment loop.
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    failures: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self, policy: &BackoffPolicy) -> Duration {
        let delay = policy.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
