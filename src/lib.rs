//! Strata Cache - Multi-tier caching engine with sampled eviction
//!
//! This library provides a capacity-bounded, expiry-aware store composed of
//! storage tiers of increasing latency and capacity:
//! - Sharded primary tier with synchronous sampled eviction (approximate LRU)
//! - Serialized secondary tier with an exclusive fault/flush protocol
//! - Compound orchestration: transparent fall-through, promotion on access,
//!   demotion on eviction, cross-tier invalidation
//! - Per-key concurrency; unrelated keys never contend on a shared lock
//! - Injected clock, pluggable expiry policies, eviction vetoes and
//!   prioritizers, pluggable value codec
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strata_cache::{
//!     BincodeCodec, ByteTier, ByteTierConfig, Capacity, CompoundTier, HeapTier,
//!     HeapTierConfig,
//! };
//!
//! # fn main() -> strata_cache::CacheResult<()> {
//! let primary: Arc<HeapTier<String, String>> =
//!     Arc::new(HeapTier::builder(HeapTierConfig::new(1024)).build()?);
//! let secondary: Arc<ByteTier<String, String>> = Arc::new(
//!     ByteTier::builder(
//!         ByteTierConfig::new(Capacity::Bytes(16 * 1024 * 1024)),
//!         Arc::new(BincodeCodec),
//!     )
//!     .build()?,
//! );
//! let cache = CompoundTier::new(primary, secondary);
//!
//! let holder = cache.get_or_compute_if_absent(&"answer".to_string(), |_| {
//!     Ok("42".to_string())
//! })?;
//! assert_eq!(holder.value()?, "42");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod eviction;
pub mod expiry;
pub mod holder;
pub mod stats;
pub mod tier;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{BincodeCodec, Codec};
pub use config::{ByteTierConfig, Capacity, HeapTierConfig, RacePolicy};
pub use error::{CacheError, CacheResult};
pub use events::{EvictionSink, InvalidationListener, TierEventListener};
pub use eviction::{EvictionPrioritizer, EvictionVeto, LeastRecentlyUsed, NoVeto};
pub use expiry::{Expiry, ExpiryPolicy, NoExpiry, TimeToIdle, TimeToLive};
pub use holder::{ValueHolder, NO_EXPIRATION};
pub use stats::TierStats;
pub use tier::bytes::{ByteTier, ByteTierBuilder, Fault};
pub use tier::compound::CompoundTier;
pub use tier::heap::{HeapTier, HeapTierBuilder, StorageDiscipline};
pub use tier::LowerTier;
