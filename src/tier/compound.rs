//! Compound tier: a primary tier composed over a secondary tier
//!
//! The composition is a single coherent unit: a lookup that misses the
//! primary tier falls through to the secondary tier and promotes the
//! result back up, eviction victims from the primary tier are demoted
//! into the secondary tier, and invalidation removes a key from both
//! tiers with exactly one consolidated notification.
//!
//! Promotion and demotion are moves, never copies: at any external
//! observation point a live key is resident in exactly one tier.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{CacheError, CacheResult};
use crate::events::{EvictionSink, InvalidationListener};
use crate::holder::ValueHolder;
use crate::tier::heap::HeapTier;
use crate::tier::LowerTier;

/// A primary tier over a secondary tier behind one get-or-compute
/// surface.
pub struct CompoundTier<K, V> {
    primary: Arc<HeapTier<K, V>>,
    lower: Arc<dyn LowerTier<K, V>>,
    invalidation: RwLock<Option<Arc<dyn InvalidationListener<K, V>>>>,
}

/// Moves primary-tier eviction victims into the lower tier.
struct Demotion<K, V> {
    lower: Arc<dyn LowerTier<K, V>>,
}

impl<K, V> EvictionSink<K, V> for Demotion<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn on_evicted(&self, key: &K, holder: &Arc<ValueHolder<V>>) {
        if let Err(error) = self.lower.accept_demoted(key, holder) {
            warn!(%error, "demotion to the lower tier failed; evicted value dropped");
        }
    }
}

/// Re-fires lower-tier invalidations through the compound's listener.
struct LowerRelay<K, V> {
    compound: Weak<CompoundTier<K, V>>,
}

impl<K, V> InvalidationListener<K, V> for LowerRelay<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_invalidation(&self, key: &K, holder: &ValueHolder<V>) {
        if let Some(compound) = self.compound.upgrade() {
            compound.fire_invalidation(key, holder);
        }
    }
}

impl<K, V> CompoundTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Compose `primary` over `lower`.
    ///
    /// Wires the eviction sink that demotes primary-tier victims into
    /// `lower`, and registers the compound as `lower`'s invalidation
    /// listener so lower-tier-originated invalidations (an expired entry
    /// discovered during promotion, a direct invalidation on the lower
    /// tier) reach the compound's listener exactly once.
    pub fn new(primary: Arc<HeapTier<K, V>>, lower: Arc<dyn LowerTier<K, V>>) -> Arc<Self> {
        let compound = Arc::new(Self {
            primary: primary.clone(),
            lower: lower.clone(),
            invalidation: RwLock::new(None),
        });
        primary.set_eviction_sink(Arc::new(Demotion { lower: lower.clone() }));
        lower.set_invalidation_listener(Arc::new(LowerRelay {
            compound: Arc::downgrade(&compound),
        }));
        compound
    }

    fn fire_invalidation(&self, key: &K, holder: &ValueHolder<V>) {
        if let Some(listener) = self.invalidation.read().clone() {
            listener.on_invalidation(key, holder);
        }
    }

    /// Look up `key` across both tiers, computing its value on a full
    /// miss.
    ///
    /// A primary-tier miss first asks the lower tier: a live value found
    /// there is promoted: moved into the primary tier, leaving the lower
    /// copy absent. Only when both tiers miss does `compute` run. Returns
    /// whatever holder ends up resident in the primary tier for the key;
    /// a failing `compute` propagates as [`CacheError::Compute`] and
    /// leaves no placeholder behind.
    pub fn get_or_compute_if_absent<F>(
        &self,
        key: &K,
        compute: F,
    ) -> CacheResult<Arc<ValueHolder<V>>>
    where
        F: FnOnce(&K) -> Result<V, Box<dyn std::error::Error + Send + Sync>>,
    {
        let resolved = self.primary.get_or_maybe_compute(key, |k| {
            if let Some(promoted) = self.lower.get_and_remove(k)? {
                self.primary.record_promotion_access(k, &promoted)?;
                return Ok(Some(promoted));
            }
            let value = compute(k).map_err(CacheError::Compute)?;
            Ok(Some(self.primary.new_holder(k, value)?))
        })?;
        resolved.ok_or_else(|| CacheError::Compute("computation produced no value".into()))
    }

    /// Read-through lookup without a computation: a primary-tier miss
    /// promotes from the lower tier, and a miss in both is `None`.
    pub fn get(&self, key: &K) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        self.primary.get_or_maybe_compute(key, |k| {
            match self.lower.get_and_remove(k)? {
                Some(promoted) => {
                    self.primary.record_promotion_access(k, &promoted)?;
                    Ok(Some(promoted))
                }
                None => Ok(None),
            }
        })
    }

    /// Insert or replace `key`'s value in the primary tier, silently
    /// discarding any stale lower-tier copy.
    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        self.primary.put(key.clone(), value)?;
        self.lower.take(&key)?;
        Ok(())
    }

    /// Unconditionally drop `key` from both tiers. Silent.
    pub fn remove(&self, key: &K) -> CacheResult<()> {
        self.primary.remove(key)?;
        self.lower.take(key)?;
        Ok(())
    }

    /// Remove `key` from both tiers and deliver exactly one consolidated
    /// invalidation notification, carrying whichever holder was found,
    /// with the primary tier's taking precedence.
    ///
    /// The lower tier's copy is taken inside the primary tier's per-key
    /// critical section, so a promotion racing this call either completed
    /// before the invalidation or is fenced: its install into the primary
    /// tier is suppressed and the value cannot reappear afterwards.
    pub fn invalidate(&self, key: &K) -> CacheResult<()> {
        let (from_primary, from_lower) = self.primary.invalidate(key, || self.lower.take(key))?;
        let from_lower = from_lower?;
        if let Some(holder) = from_primary.or(from_lower) {
            self.fire_invalidation(key, &holder);
        }
        Ok(())
    }

    /// Clear both tiers. No per-key notifications fire.
    pub fn clear(&self) -> CacheResult<()> {
        self.primary.clear()?;
        self.lower.clear()
    }

    /// Install the compound's invalidation listener, replacing any
    /// previous one.
    pub fn set_invalidation_listener(&self, listener: Arc<dyn InvalidationListener<K, V>>) {
        *self.invalidation.write() = Some(listener);
    }

    /// The composed primary tier, for stats and introspection.
    pub fn primary(&self) -> &HeapTier<K, V> {
        &self.primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::HeapTierConfig;
    use crate::expiry::Expiry;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    /// In-memory lower tier with scripted behavior, for exercising the
    /// orchestration without a byte store.
    #[derive(Default)]
    struct ScriptedLower {
        entries: Mutex<HashMap<String, Arc<ValueHolder<String>>>>,
        listener: RwLock<Option<Arc<dyn InvalidationListener<String, String>>>>,
        demotions: AtomicUsize,
    }

    impl ScriptedLower {
        fn seed(&self, key: &str, value: &str) {
            self.entries.lock().insert(
                key.to_string(),
                Arc::new(ValueHolder::new(value.to_string(), 0, Expiry::Never)),
            );
        }

        fn contains(&self, key: &str) -> bool {
            self.entries.lock().contains_key(key)
        }

        fn invalidate(&self, key: &str) {
            let removed = self.entries.lock().remove(key);
            if let Some(holder) = removed {
                if let Some(listener) = self.listener.read().clone() {
                    listener.on_invalidation(&key.to_string(), &holder);
                }
            }
        }
    }

    impl LowerTier<String, String> for ScriptedLower {
        fn get_and_remove(&self, key: &String) -> CacheResult<Option<Arc<ValueHolder<String>>>> {
            Ok(self.entries.lock().remove(key))
        }

        fn take(&self, key: &String) -> CacheResult<Option<Arc<ValueHolder<String>>>> {
            Ok(self.entries.lock().remove(key))
        }

        fn accept_demoted(&self, key: &String, holder: &ValueHolder<String>) -> CacheResult<()> {
            self.demotions.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().insert(
                key.clone(),
                Arc::new(ValueHolder::new(
                    holder.value()?,
                    holder.created_at(),
                    Expiry::Never,
                )),
            );
            Ok(())
        }

        fn set_invalidation_listener(&self, listener: Arc<dyn InvalidationListener<String, String>>) {
            *self.listener.write() = Some(listener);
        }

        fn clear(&self) -> CacheResult<()> {
            self.entries.lock().clear();
            Ok(())
        }
    }

    fn compound_on(
        capacity: usize,
        clock: Arc<ManualClock>,
        lower: Arc<ScriptedLower>,
    ) -> Arc<CompoundTier<String, String>> {
        let primary = Arc::new(
            HeapTier::builder(HeapTierConfig::new(capacity).with_shards(1))
                .clock(clock)
                .build()
                .unwrap(),
        );
        CompoundTier::new(primary, lower)
    }

    fn compound_over(
        capacity: usize,
        lower: Arc<ScriptedLower>,
    ) -> Arc<CompoundTier<String, String>> {
        compound_on(capacity, Arc::new(ManualClock::new(0)), lower)
    }

    #[test]
    fn lower_tier_hit_is_promoted_not_recomputed() {
        let lower = Arc::new(ScriptedLower::default());
        lower.seed("k", "from-lower");
        let compound = compound_over(10, lower.clone());

        let holder = compound
            .get_or_compute_if_absent(&"k".to_string(), |_| {
                panic!("value resident in the lower tier; compute must not run")
            })
            .unwrap();

        assert_eq!(holder.value().unwrap(), "from-lower");
        // promotion is a move: the lower copy is gone
        assert!(!lower.contains("k"));
        assert_eq!(compound.primary().len(), 1);
    }

    #[test]
    fn full_miss_runs_the_computation_once() {
        let lower = Arc::new(ScriptedLower::default());
        let compound = compound_over(10, lower.clone());
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            let holder = compound
                .get_or_compute_if_absent(&"k".to_string(), move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok("computed".to_string())
                })
                .unwrap();
            assert_eq!(holder.value().unwrap(), "computed");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eviction_demotes_into_the_lower_tier() {
        let lower = Arc::new(ScriptedLower::default());
        let clock = Arc::new(ManualClock::new(0));
        let compound = compound_on(1, clock.clone(), lower.clone());

        compound.put("k1".to_string(), "v1".to_string()).unwrap();
        clock.advance(1);
        compound.put("k2".to_string(), "v2".to_string()).unwrap();

        assert_eq!(lower.demotions.load(Ordering::SeqCst), 1);
        assert!(lower.contains("k1"));
        assert_eq!(compound.primary().len(), 1);
    }

    #[test]
    fn invalidate_consolidates_to_one_notification() {
        let lower = Arc::new(ScriptedLower::default());
        lower.seed("k", "lower-copy");
        let compound = compound_over(10, lower.clone());
        compound
            .primary()
            .put("k".to_string(), "primary-copy".to_string())
            .unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        compound.set_invalidation_listener(Arc::new(
            move |key: &String, holder: &ValueHolder<String>| {
                sink.lock().push(format!("{key}={}", holder.value().unwrap()));
            },
        ));

        compound.invalidate(&"k".to_string()).unwrap();

        // one notification, carrying the primary tier's holder
        assert_eq!(seen.lock().as_slice(), ["k=primary-copy".to_string()]);
        assert!(!lower.contains("k"));
        assert!(compound.get(&"k".to_string()).unwrap().is_none());
    }

    #[test]
    fn invalidate_reports_the_lower_holder_when_primary_misses() {
        let lower = Arc::new(ScriptedLower::default());
        lower.seed("k", "lower-copy");
        let compound = compound_over(10, lower.clone());

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        compound.set_invalidation_listener(Arc::new(
            move |key: &String, holder: &ValueHolder<String>| {
                sink.lock().push(format!("{key}={}", holder.value().unwrap()));
            },
        ));

        compound.invalidate(&"k".to_string()).unwrap();
        assert_eq!(seen.lock().as_slice(), ["k=lower-copy".to_string()]);

        // invalidating an absent key reports nothing
        compound.invalidate(&"k".to_string()).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn lower_originated_invalidations_relay_once() {
        let lower = Arc::new(ScriptedLower::default());
        lower.seed("k", "v");
        let compound = compound_over(10, lower.clone());

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        compound.set_invalidation_listener(Arc::new(
            move |key: &String, _holder: &ValueHolder<String>| {
                sink.lock().push(key.clone());
            },
        ));

        lower.invalidate("k");
        assert_eq!(seen.lock().as_slice(), ["k".to_string()]);
    }

    #[test]
    fn put_discards_the_stale_lower_copy() {
        let lower = Arc::new(ScriptedLower::default());
        lower.seed("k", "stale");
        let compound = compound_over(10, lower.clone());

        compound.put("k".to_string(), "fresh".to_string()).unwrap();

        assert!(!lower.contains("k"));
        assert_eq!(
            compound
                .get(&"k".to_string())
                .unwrap()
                .unwrap()
                .value()
                .unwrap(),
            "fresh"
        );
    }

    #[test]
    fn remove_drops_both_copies_silently() {
        let lower = Arc::new(ScriptedLower::default());
        lower.seed("k", "v");
        let compound = compound_over(10, lower.clone());
        compound.primary().put("k".to_string(), "v".to_string()).unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        compound.set_invalidation_listener(Arc::new(
            move |key: &String, _holder: &ValueHolder<String>| {
                sink.lock().push(key.clone());
            },
        ));

        compound.remove(&"k".to_string()).unwrap();

        assert!(seen.lock().is_empty());
        assert!(compound.get(&"k".to_string()).unwrap().is_none());
    }

    #[test]
    fn clear_empties_both_tiers() {
        let lower = Arc::new(ScriptedLower::default());
        lower.seed("a", "v");
        let compound = compound_over(10, lower.clone());
        compound.primary().put("b".to_string(), "v".to_string()).unwrap();

        compound.clear().unwrap();

        assert!(!lower.contains("a"));
        assert!(compound.primary().is_empty());
    }

    #[test]
    fn get_misses_when_both_tiers_miss() {
        let lower = Arc::new(ScriptedLower::default());
        let compound = compound_over(10, lower);
        assert!(compound.get(&"absent".to_string()).unwrap().is_none());
    }
}
