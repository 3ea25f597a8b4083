//! Clock and ticker abstractions used by every time-based component.
//!
//! All statistics are bucketed on Unix milliseconds, so the process-global
//! clock is wall-clock based. It can be swapped for a [`ManualClock`] in
//! tests. An optional cached-millis mode trades one syscall per read for a
//! background refresh task, which matters under extreme call rates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

/// Thread-safe time source abstraction.
///
/// Readings are Unix-epoch based. Calls must be safe concurrently
/// (`Send + Sync`).
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current Unix timestamp in milliseconds.
    fn now_millis(&self) -> u64;
    /// Current Unix timestamp in nanoseconds.
    fn now_nanos(&self) -> u64;
}

/// Production clock backed by [`SystemTime`].
///
/// When the cached-millis ticker is running, `now_millis` reads the cached
/// atomic instead of performing a syscall.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let cached = CACHED_NOW_MS.load(Ordering::Relaxed);
        if cached > 0 {
            return cached;
        }
        system_now_millis()
    }

    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at the given Unix millisecond.
    pub fn new(start_millis: u64) -> Self {
        Self { nanos: AtomicU64::new(start_millis * 1_000_000) }
    }

    /// Advance the clock by `d`.
    pub fn advance(&self, d: Duration) {
        self.nanos.fetch_add(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Jump the clock to an absolute Unix millisecond.
    pub fn set_millis(&self, millis: u64) {
        self.nanos.store(millis * 1_000_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst) / 1_000_000
    }

    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

fn system_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

static GLOBAL_CLOCK: OnceLock<ArcSwap<Box<dyn Clock>>> = OnceLock::new();

fn global_clock() -> &'static ArcSwap<Box<dyn Clock>> {
    GLOBAL_CLOCK.get_or_init(|| ArcSwap::from_pointee(Box::new(SystemClock) as Box<dyn Clock>))
}

/// Replace the process-global clock. Intended for tests.
pub fn set_clock(clock: Box<dyn Clock>) {
    global_clock().store(Arc::new(clock));
}

/// Snapshot the process-global clock.
pub fn current_clock() -> Arc<Box<dyn Clock>> {
    global_clock().load_full()
}

/// Current Unix timestamp in milliseconds from the global clock.
pub fn now_millis() -> u64 {
    global_clock().load().now_millis()
}

/// Current Unix timestamp in nanoseconds from the global clock.
pub fn now_nanos() -> u64 {
    global_clock().load().now_nanos()
}

static CACHED_NOW_MS: AtomicU64 = AtomicU64::new(0);
static TICKER_STARTED: Once = Once::new();

/// Start the background task that refreshes the cached millisecond
/// timestamp roughly once per millisecond. Idempotent.
pub fn start_time_ticker() {
    TICKER_STARTED.call_once(|| {
        CACHED_NOW_MS.store(system_now_millis(), Ordering::SeqCst);
        std::thread::Builder::new()
            .name("floodgate-time-ticker".into())
            .spawn(|| loop {
                CACHED_NOW_MS.store(system_now_millis(), Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
            })
            .map(|_| ())
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "failed to spawn cached-time ticker");
            });
    });
}

/// Last value published by the cached-time ticker, 0 if never started.
pub fn cached_time_millis() -> u64 {
    CACHED_NOW_MS.load(Ordering::Relaxed)
}

/// Factory for periodic tick streams.
///
/// Background tasks (metric flushers, samplers) consume ticks through this
/// so tests can substitute a manual source.
pub trait TickerFactory: Send + Sync {
    /// Create a ticker firing every `period`. Each tick carries the Unix
    /// millisecond at which it fired. Dropping the receiver stops the
    /// ticker.
    fn new_ticker(&self, period: Duration) -> mpsc::Receiver<u64>;
}

/// Ticker factory backed by `tokio::time`. Requires a running runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTickerFactory;

impl TickerFactory for TokioTickerFactory {
    fn new_ticker(&self, period: Duration) -> mpsc::Receiver<u64> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if tx.send(now_millis()).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

static GLOBAL_TICKER_FACTORY: OnceLock<ArcSwap<Box<dyn TickerFactory>>> = OnceLock::new();

fn global_ticker_factory() -> &'static ArcSwap<Box<dyn TickerFactory>> {
    GLOBAL_TICKER_FACTORY
        .get_or_init(|| ArcSwap::from_pointee(Box::new(TokioTickerFactory) as Box<dyn TickerFactory>))
}

/// Replace the process-global ticker factory. Intended for tests.
pub fn set_ticker_factory(factory: Box<dyn TickerFactory>) {
    global_ticker_factory().store(Arc::new(factory));
}

/// Create a ticker from the process-global factory.
pub fn new_ticker(period: Duration) -> mpsc::Receiver<u64> {
    global_ticker_factory().load().new_ticker(period)
}
