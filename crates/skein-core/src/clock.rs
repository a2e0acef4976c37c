//! Time and randomness sources.
//!
//! Both are injected per channel through [`ChannelOptions`](crate::ChannelOptions)
//! so tests can pin them; nothing in the crate reads a process-wide clock or RNG
//! directly.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Source of wall-clock time.
pub trait Timers: Send + Sync + 'static {
    /// Current time as milliseconds since the unix epoch.
    fn now_ms(&self) -> u64;
}

/// Source of random numbers.
pub trait Random: Send + Sync + 'static {
    /// A uniformly distributed value in `0.0..1.0`.
    fn next_f64(&self) -> f64;

    /// A uniformly distributed 64-bit value.
    fn next_u64(&self) -> u64;

    /// An index in `0..len`. `len` must be non-zero.
    fn index(&self, len: usize) -> usize {
        debug_assert!(len > 0);
        ((self.next_f64() * len as f64) as usize).min(len - 1)
    }
}

/// [`Timers`] backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimers;

impl Timers for SystemTimers {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

/// [`Random`] backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl Random for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn next_u64(&self) -> u64 {
        rand::thread_rng().gen::<u64>()
    }
}

/// Manually advanced clock, for tests.
#[derive(Default)]
pub struct ManualTimers {
    now_ms: AtomicU64,
}

impl ManualTimers {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for ManualTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimers")
            .field("now_ms", &self.now_ms.load(Ordering::Relaxed))
            .finish()
    }
}

impl Timers for ManualTimers {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// Deterministic [`Random`] that always yields the same fraction, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl Random for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }

    fn next_u64(&self) -> u64 {
        (self.0 * u64::MAX as f64) as u64
    }
}
