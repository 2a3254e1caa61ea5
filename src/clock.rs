//! Injected time sources for lifecycle bookkeeping
//!
//! Every component that needs "now" receives a [`Clock`] at construction
//! instead of reading process-wide time. This keeps expiry decisions
//! deterministic under test: swap in a [`ManualClock`] and advance it by
//! hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic millisecond time source.
///
/// The epoch is arbitrary but fixed for the lifetime of the clock; only
/// differences between readings are meaningful.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since the clock's fixed epoch.
    fn now_millis(&self) -> u64;
}

/// Wall-clock backed time source, anchored to its moment of construction.
///
/// Uses [`Instant`] internally, so readings never go backwards even when
/// the system clock is adjusted.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is "now".
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// A clock that only moves when told to.
///
/// Intended for tests that need to cross expiry boundaries exactly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Advance the clock by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
