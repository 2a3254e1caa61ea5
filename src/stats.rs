//! Per-tier operation counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters describing a tier's traffic.
///
/// All counters use `Relaxed` ordering: they feed observability, not
/// correctness, and slight cross-thread skew is acceptable.
#[derive(Debug, Default)]
pub struct TierStats {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    failed_evictions: AtomicU64,
}

impl TierStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_eviction(&self) {
        self.failed_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Total read hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total read misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total writes.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Total capacity-driven removals.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Total time-driven removals.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Total correctness-driven removals.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Insertions that exhausted the eviction retry budget and left the
    /// tier transiently over capacity.
    pub fn failed_evictions(&self) -> u64 {
        self.failed_evictions.load(Ordering::Relaxed)
    }

    /// Fraction of reads that hit, in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_handles_empty_stats() {
        let stats = TierStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn counters_accumulate() {
        let stats = TierStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_eviction();
        stats.record_expiration();
        stats.record_invalidation();

        assert_eq!(stats.hits(), 3);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(stats.evictions(), 1);
        assert_eq!(stats.expirations(), 1);
        assert_eq!(stats.invalidations(), 1);
        assert_eq!(stats.failed_evictions(), 0);
    }
}
