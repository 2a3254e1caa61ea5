//! Primary tier: a bounded, sharded in-process map
//!
//! Entries live in independently locked shards so traffic on different
//! keys does not contend. Each key's slot is either a resolved holder or a
//! pending marker for an in-flight computation; per-key coordination rides
//! on the slot, never on a tier-wide lock.
//!
//! Capacity is enforced synchronously: the insertion that pushes the tier
//! over its bound runs eviction before returning. Eviction draws a small
//! random sample of resident entries, drops vetoed candidates, reaps
//! expired ones, and evicts the least element under the configured
//! prioritizer. A bounded number of fresh samples is attempted before the
//! insertion is allowed to leave the tier transiently one entry over its
//! target.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::codec::Codec;
use crate::config::{Capacity, HeapTierConfig, RacePolicy};
use crate::error::{CacheError, CacheResult};
use crate::events::{EvictionSink, InvalidationListener, TierEventListener};
use crate::eviction::{EvictionPrioritizer, EvictionVeto, LeastRecentlyUsed};
use crate::expiry::{ExpiryPolicy, NoExpiry};
use crate::holder::{deadline, StoredValue, ValueHolder};
use crate::stats::TierStats;
use crate::tier::{shard_for, CapacityTracker};

/// How the tier holds values.
///
/// Always an explicit configuration choice, never inferred from the value
/// type.
pub enum StorageDiscipline<V> {
    /// Hold the caller's value directly. Cheapest; mutating a value after
    /// insertion through shared interior mutability is the caller's
    /// problem.
    ByRef,
    /// Hold an encoded copy produced by the codec; every read decodes a
    /// fresh, independent value.
    ByValue(Arc<dyn Codec<V>>),
}

impl<V> fmt::Debug for StorageDiscipline<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageDiscipline::ByRef => f.write_str("ByRef"),
            StorageDiscipline::ByValue(_) => f.write_str("ByValue"),
        }
    }
}

/// Coordination point for one in-flight computation.
struct PendingSlot<V> {
    result: Mutex<Option<Option<Arc<ValueHolder<V>>>>>,
    done: Condvar,
}

impl<V> PendingSlot<V> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn resolve(&self, outcome: Option<Arc<ValueHolder<V>>>) {
        *self.result.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Option<Arc<ValueHolder<V>>> {
        let mut guard = self.result.lock();
        while guard.is_none() {
            self.done.wait(&mut guard);
        }
        guard.clone().flatten()
    }
}

enum Slot<V> {
    Resolved(Arc<ValueHolder<V>>),
    Pending(Arc<PendingSlot<V>>),
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        match self {
            Slot::Resolved(holder) => Slot::Resolved(holder.clone()),
            Slot::Pending(pending) => Slot::Pending(pending.clone()),
        }
    }
}

type Shard<K, V> = Mutex<HashMap<K, Slot<V>>>;

/// The primary caching tier.
pub struct HeapTier<K, V> {
    shards: Vec<Shard<K, V>>,
    usage: CapacityTracker,
    clock: Arc<dyn Clock>,
    expiry: Arc<dyn ExpiryPolicy<K, V>>,
    veto: Option<Arc<dyn EvictionVeto<K, V>>>,
    prioritizer: Arc<dyn EvictionPrioritizer<K, V>>,
    discipline: StorageDiscipline<V>,
    events: RwLock<Option<Arc<dyn TierEventListener<K, V>>>>,
    invalidation: RwLock<Option<Arc<dyn InvalidationListener<K, V>>>>,
    eviction_sink: RwLock<Option<Arc<dyn EvictionSink<K, V>>>>,
    stats: TierStats,
    sample_size: usize,
    eviction_retries: usize,
    race_policy: RacePolicy,
    closed: AtomicBool,
}

/// Configures and builds a [`HeapTier`].
pub struct HeapTierBuilder<K, V> {
    config: HeapTierConfig,
    clock: Arc<dyn Clock>,
    expiry: Arc<dyn ExpiryPolicy<K, V>>,
    veto: Option<Arc<dyn EvictionVeto<K, V>>>,
    prioritizer: Arc<dyn EvictionPrioritizer<K, V>>,
    discipline: StorageDiscipline<V>,
    events: Option<Arc<dyn TierEventListener<K, V>>>,
}

impl<K, V> HeapTierBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Inject the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the expiry policy.
    pub fn expiry(mut self, expiry: Arc<dyn ExpiryPolicy<K, V>>) -> Self {
        self.expiry = expiry;
        self
    }

    /// Set the eviction veto.
    pub fn veto(mut self, veto: Arc<dyn EvictionVeto<K, V>>) -> Self {
        self.veto = Some(veto);
        self
    }

    /// Set the eviction prioritizer.
    pub fn prioritizer(mut self, prioritizer: Arc<dyn EvictionPrioritizer<K, V>>) -> Self {
        self.prioritizer = prioritizer;
        self
    }

    /// Store encoded copies instead of sharing the caller's values.
    pub fn by_value(mut self, codec: Arc<dyn Codec<V>>) -> Self {
        self.discipline = StorageDiscipline::ByValue(codec);
        self
    }

    /// Install the eviction/expiration listener.
    pub fn event_listener(mut self, listener: Arc<dyn TierEventListener<K, V>>) -> Self {
        self.events = Some(listener);
        self
    }

    /// Validate the configuration and build the tier.
    pub fn build(self) -> CacheResult<HeapTier<K, V>> {
        let limit = match self.config.capacity {
            Capacity::Entries(n) if n > 0 => n,
            Capacity::Entries(_) => {
                return Err(CacheError::Configuration(
                    "heap tier capacity must be at least one entry".into(),
                ))
            }
            Capacity::Bytes(_) => {
                return Err(CacheError::Configuration(
                    "heap tier capacity must be expressed in entries".into(),
                ))
            }
        };
        if self.config.shards == 0 {
            return Err(CacheError::Configuration("shard count must be non-zero".into()));
        }
        if self.config.sample_size == 0 {
            return Err(CacheError::Configuration("sample size must be non-zero".into()));
        }
        if self.config.eviction_retries == 0 {
            return Err(CacheError::Configuration(
                "eviction retry budget must be non-zero".into(),
            ));
        }

        let mut shards = Vec::with_capacity(self.config.shards);
        for _ in 0..self.config.shards {
            shards.push(Mutex::new(HashMap::new()));
        }

        Ok(HeapTier {
            shards,
            usage: CapacityTracker::new(limit),
            clock: self.clock,
            expiry: self.expiry,
            veto: self.veto,
            prioritizer: self.prioritizer,
            discipline: self.discipline,
            events: RwLock::new(self.events),
            invalidation: RwLock::new(None),
            eviction_sink: RwLock::new(None),
            stats: TierStats::default(),
            sample_size: self.config.sample_size,
            eviction_retries: self.config.eviction_retries,
            race_policy: self.config.race_policy,
            closed: AtomicBool::new(false),
        })
    }
}

enum LookupAction<V> {
    Hit(Arc<ValueHolder<V>>),
    Wait(Arc<PendingSlot<V>>),
    Compute(Arc<PendingSlot<V>>),
    Discard,
}

impl<K, V> HeapTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Start building a tier with the given configuration.
    pub fn builder(config: HeapTierConfig) -> HeapTierBuilder<K, V> {
        HeapTierBuilder {
            config,
            clock: Arc::new(SystemClock::new()),
            expiry: Arc::new(NoExpiry),
            veto: None,
            prioritizer: Arc::new(LeastRecentlyUsed),
            discipline: StorageDiscipline::ByRef,
            events: None,
        }
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[shard_for(key, self.shards.len())]
    }

    fn fire_expiration(&self, key: &K, holder: &Arc<ValueHolder<V>>) {
        self.stats.record_expiration();
        if let Some(listener) = self.events.read().clone() {
            listener.on_expiration(key, holder);
        }
    }

    /// Apply the access hook and refresh the holder's access metadata.
    fn record_access(&self, key: &K, holder: &Arc<ValueHolder<V>>, now: u64) -> CacheResult<()> {
        let extension = match holder.peek() {
            Some(value) => self.expiry.for_access(key, value),
            None => {
                let value = holder.value()?;
                self.expiry.for_access(key, &value)
            }
        };
        holder.touch(now, extension);
        Ok(())
    }

    /// Access bookkeeping for a holder promoted from a slower tier.
    pub(crate) fn record_promotion_access(
        &self,
        key: &K,
        holder: &Arc<ValueHolder<V>>,
    ) -> CacheResult<()> {
        self.record_access(key, holder, self.clock.now_millis())
    }

    /// Build a holder for a freshly computed value, applying the creation
    /// expiry hook.
    pub(crate) fn new_holder(&self, key: &K, value: V) -> CacheResult<Arc<ValueHolder<V>>> {
        let now = self.clock.now_millis();
        let expiry = self.expiry.for_creation(key, &value);
        Ok(Arc::new(ValueHolder::with_parts(
            StoredValue::Direct(value),
            -1,
            now,
            now,
            deadline(now, expiry),
            0,
        )))
    }

    /// Re-shape a holder to this tier's storage discipline, preserving its
    /// metadata.
    fn adapt(&self, holder: Arc<ValueHolder<V>>) -> CacheResult<Arc<ValueHolder<V>>> {
        match (&self.discipline, holder.peek().is_some()) {
            (StorageDiscipline::ByRef, true) | (StorageDiscipline::ByValue(_), false) => Ok(holder),
            (StorageDiscipline::ByRef, false) => {
                let value = holder.value()?;
                Ok(Arc::new(ValueHolder::with_parts(
                    StoredValue::Direct(value),
                    holder.id(),
                    holder.created_at(),
                    holder.last_access(),
                    holder.expires_at(),
                    holder.hits(),
                )))
            }
            (StorageDiscipline::ByValue(codec), true) => {
                let bytes = match holder.peek() {
                    Some(value) => codec.encode(value)?,
                    None => return Ok(holder),
                };
                Ok(Arc::new(ValueHolder::with_parts(
                    StoredValue::Encoded {
                        bytes,
                        codec: codec.clone(),
                    },
                    holder.id(),
                    holder.created_at(),
                    holder.last_access(),
                    holder.expires_at(),
                    holder.hits(),
                )))
            }
        }
    }

    fn make_stored(&self, value: V, pre_encoded: Option<Vec<u8>>) -> StoredValue<V> {
        match (&self.discipline, pre_encoded) {
            (StorageDiscipline::ByValue(codec), Some(bytes)) => StoredValue::Encoded {
                bytes,
                codec: codec.clone(),
            },
            _ => StoredValue::Direct(value),
        }
    }

    /// Current holder for `key`, if present and live.
    ///
    /// A live hit refreshes the holder's access metadata through the
    /// expiry policy's access hook. An expired entry is removed, reported
    /// as an expiration, and read as a miss. A key with an in-flight
    /// computation reads as a miss.
    pub fn get(&self, key: &K) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        self.ensure_open()?;
        let now = self.clock.now_millis();
        let mut expired: Option<Arc<ValueHolder<V>>> = None;
        let mut hit: Option<Arc<ValueHolder<V>>> = None;
        {
            let mut map = self.shard(key).lock();
            if let Some(Slot::Resolved(holder)) = map.get(key).cloned() {
                if holder.is_expired(now) {
                    map.remove(key);
                    self.usage.release(1);
                    expired = Some(holder);
                } else {
                    self.record_access(key, &holder, now)?;
                    hit = Some(holder);
                }
            }
        }
        if let Some(holder) = expired {
            self.fire_expiration(key, &holder);
        }
        match hit {
            Some(holder) => {
                self.stats.record_hit();
                Ok(Some(holder))
            }
            None => {
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    /// Insert or replace `key`'s value.
    ///
    /// Replacement discards the previous holder silently and computes the
    /// new expiration through the update hook; an answer of "no change"
    /// carries the previous expiration forward. A creation the expiry
    /// policy marks immediately expired stores nothing. Under by-value
    /// storage the value is encoded before any lock is taken, so a codec
    /// failure leaves the tier untouched.
    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        self.ensure_open()?;
        let pre_encoded = match &self.discipline {
            StorageDiscipline::ByValue(codec) => Some(codec.encode(&value)?),
            StorageDiscipline::ByRef => None,
        };
        let now = self.clock.now_millis();

        let mut expired_old: Option<Arc<ValueHolder<V>>> = None;
        {
            let mut map = self.shard(&key).lock();
            let existing = map.get(&key).cloned();
            let expires_at = match &existing {
                Some(Slot::Resolved(old)) if !old.is_expired(now) => {
                    match self.expiry.for_update(&key, old.peek(), &value) {
                        None => old.expires_at(),
                        Some(expiry) => deadline(now, expiry),
                    }
                }
                other => {
                    if let Some(Slot::Resolved(old)) = other {
                        expired_old = Some(old.clone());
                    }
                    deadline(now, self.expiry.for_creation(&key, &value))
                }
            };

            if expires_at <= now {
                // immediately expired: the net effect is a removal
                if let Some(Slot::Resolved(_)) = map.remove(&key) {
                    self.usage.release(1);
                }
            } else {
                let holder = Arc::new(ValueHolder::with_parts(
                    self.make_stored(value, pre_encoded),
                    -1,
                    now,
                    now,
                    expires_at,
                    0,
                ));
                match map.insert(key.clone(), Slot::Resolved(holder)) {
                    Some(Slot::Resolved(_)) => {}
                    Some(Slot::Pending(_)) | None => self.usage.acquire(1),
                }
            }
        }
        if let Some(old) = expired_old {
            self.fire_expiration(&key, &old);
        }
        self.stats.record_put();
        if self.usage.is_over() {
            self.evict();
        }
        Ok(())
    }

    /// Insert `value` unless a live holder is already present, in which
    /// case that holder is returned and the tier is left unchanged.
    pub fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        self.ensure_open()?;
        let pre_encoded = match &self.discipline {
            StorageDiscipline::ByValue(codec) => Some(codec.encode(&value)?),
            StorageDiscipline::ByRef => None,
        };
        let now = self.clock.now_millis();

        let mut expired_old: Option<Arc<ValueHolder<V>>> = None;
        let mut existing_live: Option<Arc<ValueHolder<V>>> = None;
        {
            let mut map = self.shard(&key).lock();
            if let Some(Slot::Resolved(old)) = map.get(&key).cloned() {
                if old.is_expired(now) {
                    expired_old = Some(old);
                } else {
                    existing_live = Some(old);
                }
            }
            if existing_live.is_none() {
                let expires_at = deadline(now, self.expiry.for_creation(&key, &value));
                if expires_at <= now {
                    if let Some(Slot::Resolved(_)) = map.remove(&key) {
                        self.usage.release(1);
                    }
                } else {
                    let holder = Arc::new(ValueHolder::with_parts(
                        self.make_stored(value, pre_encoded),
                        -1,
                        now,
                        now,
                        expires_at,
                        0,
                    ));
                    match map.insert(key.clone(), Slot::Resolved(holder)) {
                        Some(Slot::Resolved(_)) => {}
                        Some(Slot::Pending(_)) | None => self.usage.acquire(1),
                    }
                }
            }
        }
        if let Some(old) = expired_old {
            self.fire_expiration(&key, &old);
        }
        if existing_live.is_none() {
            self.stats.record_put();
            if self.usage.is_over() {
                self.evict();
            }
        }
        Ok(existing_live)
    }

    /// Replace `key`'s value with `new` iff the stored value equals
    /// `expected`. The check and the swap observe no intervening writer.
    pub fn replace(&self, key: &K, expected: &V, new: V) -> CacheResult<bool>
    where
        V: PartialEq,
    {
        self.ensure_open()?;
        let pre_encoded = match &self.discipline {
            StorageDiscipline::ByValue(codec) => Some(codec.encode(&new)?),
            StorageDiscipline::ByRef => None,
        };
        let now = self.clock.now_millis();

        let mut expired_old: Option<Arc<ValueHolder<V>>> = None;
        let mut swapped = false;
        {
            let mut map = self.shard(key).lock();
            if let Some(Slot::Resolved(old)) = map.get(key).cloned() {
                if old.is_expired(now) {
                    map.remove(key);
                    self.usage.release(1);
                    expired_old = Some(old);
                } else {
                    let current = old.value()?;
                    if current == *expected {
                        let expires_at = match self.expiry.for_update(key, Some(&current), &new) {
                            None => old.expires_at(),
                            Some(expiry) => deadline(now, expiry),
                        };
                        let holder = Arc::new(ValueHolder::with_parts(
                            self.make_stored(new, pre_encoded),
                            -1,
                            now,
                            now,
                            expires_at,
                            0,
                        ));
                        map.insert(key.clone(), Slot::Resolved(holder));
                        swapped = true;
                    }
                }
            }
        }
        if let Some(old) = expired_old {
            self.fire_expiration(key, &old);
        }
        if swapped {
            self.stats.record_put();
        }
        Ok(swapped)
    }

    /// Look up `key`, running `source` to materialize the holder when the
    /// tier is missing it. `source` returning `Ok(None)` records a plain
    /// miss.
    ///
    /// At most one computation runs per key: concurrent callers for the
    /// same key either wait on the in-flight one or compute-and-discard,
    /// per the configured [`RacePolicy`]. A failing `source` removes the
    /// in-flight marker and propagates the error to the initiating caller
    /// only.
    pub(crate) fn get_or_maybe_compute<F>(
        &self,
        key: &K,
        source: F,
    ) -> CacheResult<Option<Arc<ValueHolder<V>>>>
    where
        F: FnOnce(&K) -> CacheResult<Option<Arc<ValueHolder<V>>>>,
    {
        let mut source = Some(source);
        loop {
            self.ensure_open()?;
            let now = self.clock.now_millis();
            let mut expired: Option<Arc<ValueHolder<V>>> = None;
            let action = {
                let mut map = self.shard(key).lock();
                match map.get(key).cloned() {
                    Some(Slot::Resolved(holder)) if !holder.is_expired(now) => {
                        self.record_access(key, &holder, now)?;
                        LookupAction::Hit(holder)
                    }
                    Some(Slot::Resolved(holder)) => {
                        map.remove(key);
                        self.usage.release(1);
                        expired = Some(holder);
                        let pending = Arc::new(PendingSlot::new());
                        map.insert(key.clone(), Slot::Pending(pending.clone()));
                        LookupAction::Compute(pending)
                    }
                    Some(Slot::Pending(pending)) => match self.race_policy {
                        RacePolicy::Block => LookupAction::Wait(pending),
                        RacePolicy::ComputeAndDiscard => LookupAction::Discard,
                    },
                    None => {
                        let pending = Arc::new(PendingSlot::new());
                        map.insert(key.clone(), Slot::Pending(pending.clone()));
                        LookupAction::Compute(pending)
                    }
                }
            };
            if let Some(holder) = expired {
                self.fire_expiration(key, &holder);
            }

            match action {
                LookupAction::Hit(holder) => {
                    self.stats.record_hit();
                    return Ok(Some(holder));
                }
                LookupAction::Wait(pending) => match pending.wait() {
                    Some(holder) => return Ok(Some(holder)),
                    // the in-flight computation missed or failed; retry
                    None => continue,
                },
                LookupAction::Discard => {
                    let Some(source) = source.take() else { continue };
                    self.stats.record_miss();
                    return source(key);
                }
                LookupAction::Compute(pending) => {
                    let Some(source) = source.take() else {
                        self.abandon_pending(key, &pending);
                        continue;
                    };
                    self.stats.record_miss();
                    match source(key) {
                        Ok(Some(holder)) => {
                            let holder = match self.adapt(holder) {
                                Ok(holder) => holder,
                                Err(e) => {
                                    self.abandon_pending(key, &pending);
                                    return Err(e);
                                }
                            };
                            let now = self.clock.now_millis();
                            let mut installed = false;
                            if holder.is_expired(now) {
                                self.remove_pending(key, &pending);
                            } else {
                                let mut map = self.shard(key).lock();
                                let still_ours = matches!(
                                    map.get(key),
                                    Some(Slot::Pending(p)) if Arc::ptr_eq(p, &pending)
                                );
                                if still_ours {
                                    map.insert(key.clone(), Slot::Resolved(holder.clone()));
                                    self.usage.acquire(1);
                                    installed = true;
                                }
                                // otherwise a concurrent invalidation or
                                // write fenced this computation; the result
                                // is returned but never installed
                            }
                            pending.resolve(Some(holder.clone()));
                            if installed && self.usage.is_over() {
                                self.evict();
                            }
                            return Ok(Some(holder));
                        }
                        Ok(None) => {
                            self.abandon_pending(key, &pending);
                            return Ok(None);
                        }
                        Err(e) => {
                            self.abandon_pending(key, &pending);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn remove_pending(&self, key: &K, pending: &Arc<PendingSlot<V>>) {
        let mut map = self.shard(key).lock();
        if matches!(map.get(key), Some(Slot::Pending(p)) if Arc::ptr_eq(p, pending)) {
            map.remove(key);
        }
    }

    fn abandon_pending(&self, key: &K, pending: &Arc<PendingSlot<V>>) {
        self.remove_pending(key, pending);
        pending.resolve(None);
    }

    /// Look up `key`, computing and storing its value on a miss.
    ///
    /// For N concurrent callers with no prior value, `compute` runs
    /// exactly once under the default [`RacePolicy::Block`] and every
    /// caller observes the same holder. A failing computation leaves no
    /// marker behind and surfaces as [`CacheError::Compute`].
    pub fn get_or_compute_if_absent<F>(&self, key: &K, compute: F) -> CacheResult<Arc<ValueHolder<V>>>
    where
        F: FnOnce(&K) -> Result<V, Box<dyn std::error::Error + Send + Sync>>,
    {
        let result = self.get_or_maybe_compute(key, |k| {
            let value = compute(k).map_err(CacheError::Compute)?;
            Ok(Some(self.new_holder(k, value)?))
        })?;
        match result {
            Some(holder) => Ok(holder),
            None => Err(CacheError::Compute("computation produced no value".into())),
        }
    }

    /// Unconditionally drop `key`. Silent: no notification fires.
    pub fn remove(&self, key: &K) -> CacheResult<()> {
        self.ensure_open()?;
        let mut map = self.shard(key).lock();
        if let Some(Slot::Resolved(_)) = map.remove(key) {
            self.usage.release(1);
        }
        Ok(())
    }

    /// Drop every entry. Not expiry-aware; no notifications fire.
    pub fn clear(&self) -> CacheResult<()> {
        self.ensure_open()?;
        for shard in &self.shards {
            let mut map = shard.lock();
            let resolved = map
                .values()
                .filter(|slot| matches!(slot, Slot::Resolved(_)))
                .count();
            map.clear();
            self.usage.release(resolved);
        }
        Ok(())
    }

    /// Remove `key` for correctness, running `fence` inside the key's
    /// critical section, and report a removed holder to the invalidation
    /// listener.
    ///
    /// Removing a pending slot fences the in-flight computation: its
    /// eventual result is handed to its caller but never installed, so an
    /// invalidation cannot be undone by a straggling compute.
    pub fn invalidate<R>(
        &self,
        key: &K,
        fence: impl FnOnce() -> R,
    ) -> CacheResult<(Option<Arc<ValueHolder<V>>>, R)> {
        self.ensure_open()?;
        let (removed, fence_result) = {
            let mut map = self.shard(key).lock();
            let removed = match map.remove(key) {
                Some(Slot::Resolved(holder)) => {
                    self.usage.release(1);
                    Some(holder)
                }
                Some(Slot::Pending(_)) | None => None,
            };
            (removed, fence())
        };
        if let Some(holder) = &removed {
            self.stats.record_invalidation();
            if let Some(listener) = self.invalidation.read().clone() {
                listener.on_invalidation(key, holder);
            }
        }
        Ok((removed, fence_result))
    }

    fn evict(&self) {
        let mut attempts = 0;
        while self.usage.is_over() && attempts < self.eviction_retries {
            attempts += 1;
            let candidates = self.sample();
            let victim = candidates.into_iter().min_by(|a, b| {
                self.prioritizer.compare((&a.0, &a.1), (&b.0, &b.1))
            });
            let Some((key, holder)) = victim else { continue };

            let removed = {
                let mut map = self.shard(&key).lock();
                let current = matches!(
                    map.get(&key),
                    Some(Slot::Resolved(h)) if Arc::ptr_eq(h, &holder)
                );
                if current {
                    map.remove(&key);
                    self.usage.release(1);
                    // demote inside the critical section so an
                    // invalidation cannot interleave with the hand-off
                    if let Some(sink) = self.eviction_sink.read().clone() {
                        sink.on_evicted(&key, &holder);
                    }
                }
                current
            };
            if removed {
                self.stats.record_eviction();
                if let Some(listener) = self.events.read().clone() {
                    listener.on_eviction(&key, &holder);
                }
            }
        }
        if self.usage.is_over() {
            self.stats.record_failed_eviction();
            debug!(attempts, "eviction sample budget exhausted; tier left transiently over capacity");
        }
    }

    /// Draw a bounded sample of resident entries from the first non-empty
    /// shard at a random starting point, reaping expired entries and
    /// dropping vetoed ones along the way.
    fn sample(&self) -> Vec<(K, Arc<ValueHolder<V>>)> {
        let now = self.clock.now_millis();
        let mut rng = rand::thread_rng();
        let start = rng.gen_range(0..self.shards.len());

        let mut candidates = Vec::with_capacity(self.sample_size);
        let mut reaped: Vec<(K, Arc<ValueHolder<V>>)> = Vec::new();
        for i in 0..self.shards.len() {
            let shard = &self.shards[(start + i) % self.shards.len()];
            let mut map = shard.lock();
            if map.is_empty() {
                continue;
            }
            let offset = rng.gen_range(0..map.len());
            let picked: Vec<(K, Arc<ValueHolder<V>>)> = map
                .iter()
                .skip(offset)
                .chain(map.iter().take(offset))
                .take(self.sample_size)
                .filter_map(|(k, slot)| match slot {
                    Slot::Resolved(h) => Some((k.clone(), h.clone())),
                    Slot::Pending(_) => None,
                })
                .collect();
            for (key, holder) in picked {
                if holder.is_expired(now) {
                    map.remove(&key);
                    self.usage.release(1);
                    reaped.push((key, holder));
                } else if !self
                    .veto
                    .as_ref()
                    .is_some_and(|veto| veto.test(&key, &holder))
                {
                    candidates.push((key, holder));
                }
            }
            break;
        }
        for (key, holder) in reaped {
            self.fire_expiration(&key, &holder);
        }
        candidates
    }

    /// Snapshot of the resident keys.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            let map = shard.lock();
            keys.extend(map.iter().filter_map(|(k, slot)| match slot {
                Slot::Resolved(_) => Some(k.clone()),
                Slot::Pending(_) => None,
            }));
        }
        keys
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.usage.used()
    }

    /// Whether the tier holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operation counters.
    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    /// Install the eviction/expiration listener, replacing any previous
    /// one.
    pub fn set_event_listener(&self, listener: Arc<dyn TierEventListener<K, V>>) {
        *self.events.write() = Some(listener);
    }

    /// Install the invalidation listener, replacing any previous one.
    pub fn set_invalidation_listener(&self, listener: Arc<dyn InvalidationListener<K, V>>) {
        *self.invalidation.write() = Some(listener);
    }

    pub(crate) fn set_eviction_sink(&self, sink: Arc<dyn EvictionSink<K, V>>) {
        *self.eviction_sink.write() = Some(sink);
    }

    /// Mark the tier closed; every subsequent operation fails fast with
    /// [`CacheError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
