//! Small shared helpers: float comparison and rate-limited logging.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock;

const FLOAT_EPSILON: f64 = 1e-9;

/// Tolerant equality for rule thresholds and ratios.
pub(crate) fn float64_equals(a: f64, b: f64) -> bool {
    (a - b).abs() < FLOAT_EPSILON
}

/// Allows at most one log line per interval per call site.
///
/// Hot paths that can fail on every call (e.g. leap-array reads during a
/// clock rewind) gate their error logging through this so a transient
/// fault cannot flood the log.
pub(crate) struct LogThrottle {
    interval_ms: u64,
    last_log_ms: AtomicU64,
}

impl LogThrottle {
    pub(crate) const fn new(interval_ms: u64) -> Self {
        Self { interval_ms, last_log_ms: AtomicU64::new(0) }
    }

    /// Returns true if the caller may log now.
    pub(crate) fn allow(&self) -> bool {
        let now = clock::now_millis();
        let last = self.last_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_log_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// Serialises unit tests that reload the process-global rule managers.
#[cfg(test)]
pub(crate) static TEST_RULES_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_equality_is_tolerant() {
        assert!(float64_equals(0.1 + 0.2, 0.3));
        assert!(!float64_equals(0.3, 0.300001));
    }

    #[test]
    fn throttle_allows_once_per_interval() {
        let throttle = LogThrottle::new(60_000);
        assert!(throttle.allow());
        assert!(!throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn zero_interval_always_allows() {
        let throttle = LogThrottle::new(0);
        assert!(throttle.allow());
        assert!(throttle.allow());
    }
}
