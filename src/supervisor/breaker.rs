//! Failure-count circuit breaker for unreliable sidecars
//!
//! Counts consecutive failures; once the threshold is reached the breaker
//! opens for a cooldown window during which callers short-circuit to their
//! fallback path. The first call after the cooldown is let through again.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default consecutive failures before tripping
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Default cooldown while tripped
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Breaker state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through
    Closed,
    /// Calls short-circuit until the instant passes
    Open {
        /// When the cooldown expires
        until: Instant,
    },
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
    trips: u64,
}

/// Shared circuit breaker; clones observe the same counters
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    threshold: u32,
    cooldown: Duration,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures
    #[must_use]
    pub fn new(name: &str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: Arc::from(name),
            threshold: threshold.max(1),
            cooldown,
            inner: Arc::new(Mutex::new(BreakerInner {
                consecutive_failures: 0,
                disabled_until: None,
                trips: 0,
            })),
        }
    }

    /// Name of the guarded dependency
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a real call may be attempted now
    ///
    /// An expired cooldown resets the breaker so the next call probes the
    /// real path.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.disabled_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                tracing::info!(service = %self.name, "breaker cooldown expired, allowing retry");
                inner.disabled_until = None;
                inner.consecutive_failures = 0;
                true
            }
            None => true,
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.disabled_until = None;
    }

    /// Record a failed call; returns true if this failure tripped the breaker
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if inner.disabled_until.is_none() && inner.consecutive_failures >= self.threshold {
            inner.disabled_until = Some(Instant::now() + self.cooldown);
            inner.trips += 1;
            tracing::warn!(
                service = %self.name,
                failures = inner.consecutive_failures,
                cooldown = ?self.cooldown,
                "circuit breaker tripped"
            );
            return true;
        }

        false
    }

    /// Current state without side effects
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.disabled_until {
            Some(until) if Instant::now() < until => BreakerState::Open { until },
            _ => BreakerState::Closed,
        }
    }

    /// Whether the breaker is currently open
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state(), BreakerState::Open { .. })
    }

    /// Consecutive failures since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// When the current cooldown ends, if open
    #[must_use]
    pub fn disabled_until(&self) -> Option<Instant> {
        match self.state() {
            BreakerState::Open { until } => Some(until),
            BreakerState::Closed => None,
        }
    }

    /// Number of times the breaker has tripped
    #[must_use]
    pub fn trips(&self) -> u64 {
        self.lock().trips
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("service", DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold() {
        let breaker = CircuitBreaker::new("stt", 2, Duration::from_secs(60));

        assert!(breaker.allow());
        assert!(!breaker.record_failure());
        assert!(breaker.allow());
        assert!(breaker.record_failure());

        assert!(!breaker.allow());
        assert!(breaker.is_open());
        assert_eq!(breaker.trips(), 1);
    }

    #[test]
    fn success_resets_counter() {
        let breaker = CircuitBreaker::new("stt", 3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.consecutive_failures(), 2);

        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.allow());
    }

    #[test]
    fn cooldown_expiry_allows_probe() {
        let breaker = CircuitBreaker::new("tts", 1, Duration::from_millis(20));

        breaker.record_failure();
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(30));

        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn clones_share_state() {
        let breaker = CircuitBreaker::new("tts", 1, Duration::from_secs(60));
        let observer = breaker.clone();

        breaker.record_failure();
        assert!(observer.is_open());
        assert!(observer.disabled_until().is_some());
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let breaker = CircuitBreaker::new("x", 0, Duration::from_secs(1));
        assert!(breaker.record_failure());
    }
}
