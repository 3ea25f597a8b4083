//! Published system metric values consumed by the adaptive gate and the
//! memory-adaptive flow calculator.
//!
//! OS-level sampling lives outside the core; samplers (or tests) publish
//! readings here through plain setters, and the hot path reads atomics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Placeholder reported before load was ever sampled.
pub const NOT_RETRIEVED_LOAD_VALUE: f64 = -1.0;
/// Placeholder reported before CPU usage was ever sampled.
pub const NOT_RETRIEVED_CPU_USAGE_VALUE: f64 = -1.0;
/// Placeholder reported before memory usage was ever sampled.
pub const NOT_RETRIEVED_MEMORY_VALUE: i64 = -1;

static CURRENT_LOAD: AtomicU64 = AtomicU64::new(f64::to_bits(NOT_RETRIEVED_LOAD_VALUE));
static CURRENT_CPU_USAGE: AtomicU64 = AtomicU64::new(f64::to_bits(NOT_RETRIEVED_CPU_USAGE_VALUE));
static CURRENT_MEMORY_USAGE: AtomicI64 = AtomicI64::new(NOT_RETRIEVED_MEMORY_VALUE);

/// Publish the current system load (load1 on Unix).
pub fn set_system_load(load: f64) {
    CURRENT_LOAD.store(load.to_bits(), Ordering::Relaxed);
}

/// Last published system load, or [`NOT_RETRIEVED_LOAD_VALUE`].
pub fn current_load() -> f64 {
    f64::from_bits(CURRENT_LOAD.load(Ordering::Relaxed))
}

/// Publish the current process CPU usage ratio.
pub fn set_cpu_usage(usage: f64) {
    CURRENT_CPU_USAGE.store(usage.to_bits(), Ordering::Relaxed);
}

/// Last published CPU usage, or [`NOT_RETRIEVED_CPU_USAGE_VALUE`].
pub fn current_cpu_usage() -> f64 {
    f64::from_bits(CURRENT_CPU_USAGE.load(Ordering::Relaxed))
}

/// Publish the current process memory usage in bytes.
pub fn set_memory_usage(bytes: i64) {
    CURRENT_MEMORY_USAGE.store(bytes, Ordering::Relaxed);
}

/// Last published memory usage in bytes, or [`NOT_RETRIEVED_MEMORY_VALUE`].
pub fn current_memory_usage() -> i64 {
    CURRENT_MEMORY_USAGE.load(Ordering::Relaxed)
}

/// Serialises tests that publish into the process-wide metric atomics.
#[cfg(test)]
pub(crate) static TEST_METRIC_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
