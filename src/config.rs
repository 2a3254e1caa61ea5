//! Tier configuration
//!
//! Plain serde-derived structures with sensible defaults and builder-style
//! setters. Capacity is a unit-tagged quantity: the primary tier is bounded
//! by entry count, the secondary tier by entry count or by the byte size of
//! its encoded values.

use serde::{Deserialize, Serialize};

/// A unit-tagged resource bound for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    /// Maximum number of resident entries.
    Entries(usize),
    /// Maximum total size of encoded values, in bytes.
    Bytes(usize),
}

impl Capacity {
    /// The raw limit in the capacity's own unit.
    pub fn limit(&self) -> usize {
        match self {
            Capacity::Entries(n) | Capacity::Bytes(n) => *n,
        }
    }
}

/// What happens when a computation for a key is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RacePolicy {
    /// Wait for the in-flight computation and share its result.
    #[default]
    Block,
    /// Run the computation anyway and return its result without storing it.
    ComputeAndDiscard,
}

/// Configuration for the primary (in-process) tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapTierConfig {
    /// Resource bound; the primary tier accepts [`Capacity::Entries`] only.
    #[serde(default = "default_heap_capacity")]
    pub capacity: Capacity,

    /// Number of independently locked shards.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Entries drawn per eviction sample.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Fresh samples attempted per overflowing insertion before accepting
    /// a transient capacity excess.
    #[serde(default = "default_eviction_retries")]
    pub eviction_retries: usize,

    /// Behavior of concurrent computations for the same key.
    #[serde(default)]
    pub race_policy: RacePolicy,
}

impl Default for HeapTierConfig {
    fn default() -> Self {
        Self {
            capacity: default_heap_capacity(),
            shards: default_shards(),
            sample_size: default_sample_size(),
            eviction_retries: default_eviction_retries(),
            race_policy: RacePolicy::default(),
        }
    }
}

impl HeapTierConfig {
    /// Configuration bounded to `entries` resident entries.
    pub fn new(entries: usize) -> Self {
        Self {
            capacity: Capacity::Entries(entries),
            ..Default::default()
        }
    }

    /// Set the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the eviction sample size.
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Set the eviction retry budget.
    pub fn with_eviction_retries(mut self, retries: usize) -> Self {
        self.eviction_retries = retries;
        self
    }

    /// Set the computation race policy.
    pub fn with_race_policy(mut self, policy: RacePolicy) -> Self {
        self.race_policy = policy;
        self
    }
}

/// Configuration for the secondary (byte store) tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteTierConfig {
    /// Resource bound, in entries or encoded bytes.
    #[serde(default = "default_byte_capacity")]
    pub capacity: Capacity,

    /// Number of independently locked shards.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Entries drawn per eviction sample.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Fresh samples attempted per overflowing insertion before accepting
    /// a transient capacity excess.
    #[serde(default = "default_eviction_retries")]
    pub eviction_retries: usize,
}

impl Default for ByteTierConfig {
    fn default() -> Self {
        Self {
            capacity: default_byte_capacity(),
            shards: default_shards(),
            sample_size: default_sample_size(),
            eviction_retries: default_eviction_retries(),
        }
    }
}

impl ByteTierConfig {
    /// Configuration with the given bound.
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Set the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the eviction sample size.
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Set the eviction retry budget.
    pub fn with_eviction_retries(mut self, retries: usize) -> Self {
        self.eviction_retries = retries;
        self
    }
}

fn default_heap_capacity() -> Capacity {
    Capacity::Entries(1024)
}

fn default_byte_capacity() -> Capacity {
    // 64 MiB of encoded values
    Capacity::Bytes(64 * 1024 * 1024)
}

fn default_shards() -> usize {
    16
}

fn default_sample_size() -> usize {
    8
}

fn default_eviction_retries() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_defaults() {
        let config = HeapTierConfig::default();
        assert_eq!(config.capacity, Capacity::Entries(1024));
        assert_eq!(config.shards, 16);
        assert_eq!(config.sample_size, 8);
        assert_eq!(config.eviction_retries, 5);
        assert_eq!(config.race_policy, RacePolicy::Block);
    }

    #[test]
    fn builders_override_defaults() {
        let config = HeapTierConfig::new(3)
            .with_shards(1)
            .with_sample_size(4)
            .with_eviction_retries(2)
            .with_race_policy(RacePolicy::ComputeAndDiscard);
        assert_eq!(config.capacity, Capacity::Entries(3));
        assert_eq!(config.shards, 1);
        assert_eq!(config.sample_size, 4);
        assert_eq!(config.eviction_retries, 2);
        assert_eq!(config.race_policy, RacePolicy::ComputeAndDiscard);
    }

    #[test]
    fn byte_tier_accepts_both_units() {
        let by_bytes = ByteTierConfig::new(Capacity::Bytes(4096));
        assert_eq!(by_bytes.capacity.limit(), 4096);

        let by_entries = ByteTierConfig::new(Capacity::Entries(100));
        assert_eq!(by_entries.capacity.limit(), 100);
    }
}
