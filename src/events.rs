//! Tier event notifications
//!
//! Tiers raise three distinct signals, never conflated: *eviction*
//! (capacity-driven removal), *expiration* (time-driven removal), and
//! *invalidation* (correctness-driven removal requested by a caller or a
//! composing tier). Listeners are invoked synchronously, on the thread
//! performing the removal, after the removal itself has completed; a
//! listener must not call back into the tier that fired it.

use std::sync::Arc;

use crate::holder::ValueHolder;

/// Receives eviction and expiration notifications.
pub trait TierEventListener<K, V>: Send + Sync {
    /// An entry was removed to make room.
    fn on_eviction(&self, _key: &K, _holder: &ValueHolder<V>) {}

    /// An entry was found expired and removed.
    fn on_expiration(&self, _key: &K, _holder: &ValueHolder<V>) {}
}

/// Receives invalidation notifications.
///
/// Called only when an entry was in fact removed; never with a holder for
/// a no-op invalidation.
pub trait InvalidationListener<K, V>: Send + Sync {
    /// `key`'s holder was invalidated.
    fn on_invalidation(&self, key: &K, holder: &ValueHolder<V>);
}

impl<K, V, F> InvalidationListener<K, V> for F
where
    F: Fn(&K, &ValueHolder<V>) + Send + Sync,
{
    fn on_invalidation(&self, key: &K, holder: &ValueHolder<V>) {
        self(key, holder)
    }
}

/// Receives each eviction victim before the eviction notification fires.
///
/// The compound tier installs a sink on its primary tier to move victims
/// into the secondary tier. The sink runs inside the victim's critical
/// section so a concurrent invalidation cannot slip between removal and
/// demotion.
pub trait EvictionSink<K, V>: Send + Sync {
    /// `key`'s holder was evicted and is leaving the tier.
    fn on_evicted(&self, key: &K, holder: &Arc<ValueHolder<V>>);
}
