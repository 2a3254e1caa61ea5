//! Stored value holders
//!
//! A [`ValueHolder`] is the unit of stored state: the value itself plus the
//! lifecycle bookkeeping every tier operation reads or updates: creation
//! time, last access time, expiration time, and a hit counter. Access
//! metadata uses atomics so holders shared across threads can be touched
//! without a lock; `Relaxed` ordering is sufficient because the metadata
//! feeds eviction heuristics, not correctness decisions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::CacheResult;
use crate::expiry::Expiry;

/// Sentinel expiration time meaning "never expires".
pub const NO_EXPIRATION: u64 = u64::MAX;

/// How a holder keeps its value.
pub(crate) enum StoredValue<V> {
    /// The value itself, shared as stored.
    Direct(V),
    /// An encoded copy; every read decodes a fresh, independent value.
    Encoded {
        bytes: Vec<u8>,
        codec: Arc<dyn Codec<V>>,
    },
}

/// A value plus its lifecycle metadata.
///
/// Invariants: `last_access >= created_at`; `hits` never decreases; an
/// entry is expired exactly when `expires_at <= now` (so a value with a
/// lifetime of `D` is live through `created_at + D - 1` and expired at
/// `created_at + D`).
pub struct ValueHolder<V> {
    value: StoredValue<V>,
    id: i64,
    created_at: u64,
    last_access: AtomicU64,
    expires_at: AtomicU64,
    hits: AtomicU64,
}

impl<V> ValueHolder<V> {
    /// Create a holder around a directly held value.
    pub fn new(value: V, now: u64, expiry: Expiry) -> Self {
        Self::with_parts(StoredValue::Direct(value), -1, now, now, deadline(now, expiry), 0)
    }

    pub(crate) fn with_parts(
        value: StoredValue<V>,
        id: i64,
        created_at: u64,
        last_access: u64,
        expires_at: u64,
        hits: u64,
    ) -> Self {
        Self {
            value,
            id,
            created_at,
            last_access: AtomicU64::new(last_access),
            expires_at: AtomicU64::new(expires_at),
            hits: AtomicU64::new(hits),
        }
    }

    /// Stable identifier correlating this holder with its stored slot in
    /// the secondary tier; `-1` when unassigned.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Creation time in clock milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Last access time in clock milliseconds.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Expiration time in clock milliseconds; [`NO_EXPIRATION`] means never.
    pub fn expires_at(&self) -> u64 {
        self.expires_at.load(Ordering::Relaxed)
    }

    /// Number of times this holder has been read.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Whether the holder is expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        let expires_at = self.expires_at();
        expires_at != NO_EXPIRATION && expires_at <= now
    }

    /// The stored value.
    ///
    /// By-reference holders clone the value; encoded holders decode a
    /// fresh, independent copy, which may fail with a serialization error.
    pub fn value(&self) -> CacheResult<V>
    where
        V: Clone,
    {
        match &self.value {
            StoredValue::Direct(v) => Ok(v.clone()),
            StoredValue::Encoded { bytes, codec } => codec.decode(bytes),
        }
    }

    /// Borrow the value when it is held directly.
    pub(crate) fn peek(&self) -> Option<&V> {
        match &self.value {
            StoredValue::Direct(v) => Some(v),
            StoredValue::Encoded { .. } => None,
        }
    }

    /// Serial form of the value: the stored bytes when already encoded,
    /// otherwise a fresh encoding through `codec`.
    pub(crate) fn encode_with(&self, codec: &dyn Codec<V>) -> CacheResult<Vec<u8>> {
        match &self.value {
            StoredValue::Direct(v) => codec.encode(v),
            StoredValue::Encoded { bytes, .. } => Ok(bytes.clone()),
        }
    }

    /// Record a read: bump the hit counter, refresh the access time, and
    /// apply any expiry extension.
    ///
    /// Tiers call this on every hit; callers holding a fault use it to
    /// accumulate access deltas that the eventual flush writes back.
    pub fn touch(&self, now: u64, extension: Option<Expiry>) {
        self.last_access.store(now, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(expiry) = extension {
            self.expires_at.store(deadline(now, expiry), Ordering::Relaxed);
        }
    }
}

impl<V> fmt::Debug for ValueHolder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHolder")
            .field(
                "storage",
                &match self.value {
                    StoredValue::Direct(_) => "direct",
                    StoredValue::Encoded { .. } => "encoded",
                },
            )
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_access", &self.last_access())
            .field("expires_at", &self.expires_at())
            .field("hits", &self.hits())
            .finish()
    }
}

/// Absolute expiration time for an expiry decision taken at `now`.
pub(crate) fn deadline(now: u64, expiry: Expiry) -> u64 {
    match expiry {
        Expiry::After(millis) => now.saturating_add(millis),
        Expiry::Never => NO_EXPIRATION,
        Expiry::Immediate => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_holder_starts_with_creation_metadata() {
        let holder = ValueHolder::new("v", 100, Expiry::After(50));
        assert_eq!(holder.created_at(), 100);
        assert_eq!(holder.last_access(), 100);
        assert_eq!(holder.expires_at(), 150);
        assert_eq!(holder.hits(), 0);
        assert_eq!(holder.id(), -1);
    }

    #[test]
    fn expiry_boundary_is_exclusive_of_the_deadline() {
        let holder = ValueHolder::new("v", 100, Expiry::After(50));
        assert!(!holder.is_expired(149));
        assert!(holder.is_expired(150));
        assert!(holder.is_expired(151));
    }

    #[test]
    fn never_expires_with_no_expiration() {
        let holder = ValueHolder::new("v", 0, Expiry::Never);
        assert!(!holder.is_expired(u64::MAX - 1));
    }

    #[test]
    fn immediate_expiry_is_expired_at_creation() {
        let holder = ValueHolder::new("v", 42, Expiry::Immediate);
        assert!(holder.is_expired(42));
    }

    #[test]
    fn touch_updates_access_metadata() {
        let holder = ValueHolder::new("v", 100, Expiry::After(50));
        holder.touch(120, None);
        assert_eq!(holder.last_access(), 120);
        assert_eq!(holder.hits(), 1);
        assert_eq!(holder.expires_at(), 150);

        holder.touch(130, Some(Expiry::After(50)));
        assert_eq!(holder.last_access(), 130);
        assert_eq!(holder.hits(), 2);
        assert_eq!(holder.expires_at(), 180);
    }

    #[test]
    fn direct_value_clones_out() {
        let holder = ValueHolder::new(vec![1, 2, 3], 0, Expiry::Never);
        assert_eq!(holder.value().unwrap(), vec![1, 2, 3]);
        assert!(holder.peek().is_some());
    }

    #[test]
    fn encoded_value_decodes_out() {
        use crate::codec::BincodeCodec;

        let codec: Arc<dyn crate::codec::Codec<String>> = Arc::new(BincodeCodec);
        let bytes = codec.encode(&"hello".to_string()).unwrap();
        let holder = ValueHolder::with_parts(
            StoredValue::Encoded { bytes, codec },
            7,
            0,
            0,
            NO_EXPIRATION,
            0,
        );
        assert_eq!(holder.value().unwrap(), "hello");
        assert!(holder.peek().is_none());
        assert_eq!(holder.id(), 7);
    }
}
