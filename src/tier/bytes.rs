//! Secondary tier: a serialized byte store with a fault/flush protocol
//!
//! Values live here as codec-encoded bytes; lifecycle metadata sits beside
//! the bytes, outside the encoding, so access-time and hit-count updates
//! never force a re-serialization. Each key's slot is either a resolved
//! entry or a fault token marking an exclusive in-flight hold.
//!
//! Materializing or mutating an entry is comparatively expensive, so the
//! tier hands the work out under a fault instead of doing it inside a
//! lock: [`ByteTier::get_and_fault`] grants one caller an exclusive hold
//! on a key, everyone else touching that key blocks on the token's gate,
//! and the hold ends with a [`ByteTier::flush`] write-back or a
//! [`ByteTier::fail_fault`]. A flush whose fault has been superseded or
//! invalidated in the meantime reports `false` and stores nothing.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::codec::Codec;
use crate::config::{ByteTierConfig, Capacity};
use crate::error::{CacheError, CacheResult};
use crate::events::{InvalidationListener, TierEventListener};
use crate::eviction::{EvictionPrioritizer, EvictionVeto, LeastRecentlyUsed};
use crate::expiry::{ExpiryPolicy, NoExpiry};
use crate::holder::{deadline, StoredValue, ValueHolder, NO_EXPIRATION};
use crate::stats::TierStats;
use crate::tier::{shard_for, CapacityTracker, LowerTier};

/// An exclusive hold on one key, granted by [`ByteTier::get_and_fault`].
///
/// The hold ends when the handle is consumed by [`ByteTier::flush`] or
/// [`ByteTier::fail_fault`]. Deliberately neither `Clone` nor reusable:
/// one handle, one holder, one resolution.
#[derive(Debug)]
pub struct Fault {
    id: i64,
}

impl Fault {
    /// Stable identifier correlating this fault with its eventual flush.
    pub fn id(&self) -> i64 {
        self.id
    }
}

/// Gate other callers block on while a key is faulted.
struct FaultGate {
    resolved: Mutex<bool>,
    cond: Condvar,
}

impl FaultGate {
    fn new() -> Self {
        Self {
            resolved: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.resolved.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut resolved = self.resolved.lock();
        while !*resolved {
            self.cond.wait(&mut resolved);
        }
    }
}

/// A resolved entry: encoded value plus metadata kept outside the bytes.
struct StoredEntry {
    bytes: Vec<u8>,
    id: i64,
    created_at: u64,
    last_access: u64,
    expires_at: u64,
    hits: u64,
}

impl StoredEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at != NO_EXPIRATION && self.expires_at <= now
    }
}

/// Token occupying a faulted key's slot.
struct FaultToken {
    id: i64,
    prior: Option<StoredEntry>,
    gate: Arc<FaultGate>,
}

enum ByteSlot {
    Resolved(StoredEntry),
    Faulted(FaultToken),
}

type Shard<K> = Mutex<HashMap<K, ByteSlot>>;

/// The secondary caching tier.
pub struct ByteTier<K, V> {
    shards: Vec<Shard<K>>,
    usage: CapacityTracker,
    capacity: Capacity,
    codec: Arc<dyn Codec<V>>,
    clock: Arc<dyn Clock>,
    expiry: Arc<dyn ExpiryPolicy<K, V>>,
    veto: Option<Arc<dyn EvictionVeto<K, V>>>,
    prioritizer: Arc<dyn EvictionPrioritizer<K, V>>,
    events: RwLock<Option<Arc<dyn TierEventListener<K, V>>>>,
    invalidation: RwLock<Option<Arc<dyn InvalidationListener<K, V>>>>,
    stats: TierStats,
    sample_size: usize,
    eviction_retries: usize,
    next_id: AtomicI64,
    closed: AtomicBool,
}

/// Configures and builds a [`ByteTier`].
pub struct ByteTierBuilder<K, V> {
    config: ByteTierConfig,
    codec: Arc<dyn Codec<V>>,
    clock: Arc<dyn Clock>,
    expiry: Arc<dyn ExpiryPolicy<K, V>>,
    veto: Option<Arc<dyn EvictionVeto<K, V>>>,
    prioritizer: Arc<dyn EvictionPrioritizer<K, V>>,
    events: Option<Arc<dyn TierEventListener<K, V>>>,
}

impl<K, V> ByteTierBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
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

    /// Install the eviction/expiration listener.
    pub fn event_listener(mut self, listener: Arc<dyn TierEventListener<K, V>>) -> Self {
        self.events = Some(listener);
        self
    }

    /// Validate the configuration and build the tier.
    pub fn build(self) -> CacheResult<ByteTier<K, V>> {
        if self.config.capacity.limit() == 0 {
            return Err(CacheError::Configuration(
                "byte tier capacity must be non-zero".into(),
            ));
        }
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

        Ok(ByteTier {
            shards,
            usage: CapacityTracker::new(self.config.capacity.limit()),
            capacity: self.config.capacity,
            codec: self.codec,
            clock: self.clock,
            expiry: self.expiry,
            veto: self.veto,
            prioritizer: self.prioritizer,
            events: RwLock::new(self.events),
            invalidation: RwLock::new(None),
            stats: TierStats::default(),
            sample_size: self.config.sample_size,
            eviction_retries: self.config.eviction_retries,
            next_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

impl<K, V> ByteTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Start building a tier with the given configuration and codec.
    pub fn builder(config: ByteTierConfig, codec: Arc<dyn Codec<V>>) -> ByteTierBuilder<K, V> {
        ByteTierBuilder {
            config,
            codec,
            clock: Arc::new(SystemClock::new()),
            expiry: Arc::new(NoExpiry),
            veto: None,
            prioritizer: Arc::new(LeastRecentlyUsed),
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

    fn shard(&self, key: &K) -> &Shard<K> {
        &self.shards[shard_for(key, self.shards.len())]
    }

    fn mint_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Accounting weight of one entry, in the capacity's unit.
    fn weight_of(&self, entry: &StoredEntry) -> usize {
        match self.capacity {
            Capacity::Entries(_) => 1,
            Capacity::Bytes(_) => entry.bytes.len(),
        }
    }

    /// Holder view over an entry's current bytes and metadata.
    fn holder_view(&self, entry: &StoredEntry) -> Arc<ValueHolder<V>> {
        Arc::new(ValueHolder::with_parts(
            StoredValue::Encoded {
                bytes: entry.bytes.clone(),
                codec: self.codec.clone(),
            },
            entry.id,
            entry.created_at,
            entry.last_access,
            entry.expires_at,
            entry.hits,
        ))
    }

    /// Holder view consuming an entry removed from the store.
    fn into_holder(&self, entry: StoredEntry) -> Arc<ValueHolder<V>> {
        Arc::new(ValueHolder::with_parts(
            StoredValue::Encoded {
                bytes: entry.bytes,
                codec: self.codec.clone(),
            },
            entry.id,
            entry.created_at,
            entry.last_access,
            entry.expires_at,
            entry.hits,
        ))
    }

    fn entry_from_holder(&self, holder: &ValueHolder<V>, id: i64) -> CacheResult<StoredEntry> {
        Ok(StoredEntry {
            bytes: holder.encode_with(self.codec.as_ref())?,
            id,
            created_at: holder.created_at(),
            last_access: holder.last_access(),
            expires_at: holder.expires_at(),
            hits: holder.hits(),
        })
    }

    fn fire_expiration(&self, key: &K, holder: &Arc<ValueHolder<V>>) {
        self.stats.record_expiration();
        if let Some(listener) = self.events.read().clone() {
            listener.on_expiration(key, holder);
        }
    }

    fn fire_invalidation(&self, key: &K, holder: &Arc<ValueHolder<V>>) {
        self.stats.record_invalidation();
        if let Some(listener) = self.invalidation.read().clone() {
            listener.on_invalidation(key, holder);
        }
    }

    /// Current holder for `key`, if present and live.
    ///
    /// A live hit refreshes the entry's access metadata through the expiry
    /// policy's access hook; the returned holder is a view over the stored
    /// bytes and decodes a fresh value on every read. An expired entry is
    /// removed, reported as an expiration, and read as a miss. A faulted
    /// key blocks until the fault resolves.
    pub fn get(&self, key: &K) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        loop {
            self.ensure_open()?;
            let now = self.clock.now_millis();
            let gate;
            {
                let mut map = self.shard(key).lock();
                match map.get_mut(key) {
                    None => {
                        self.stats.record_miss();
                        return Ok(None);
                    }
                    Some(ByteSlot::Faulted(token)) => {
                        gate = token.gate.clone();
                    }
                    Some(ByteSlot::Resolved(entry)) => {
                        if entry.is_expired(now) {
                            let expired = match map.remove(key) {
                                Some(ByteSlot::Resolved(entry)) => entry,
                                _ => continue,
                            };
                            self.usage.release(self.weight_of(&expired));
                            let holder = self.into_holder(expired);
                            drop(map);
                            self.fire_expiration(key, &holder);
                            self.stats.record_miss();
                            return Ok(None);
                        }
                        let value = self.codec.decode(&entry.bytes)?;
                        if let Some(extension) = self.expiry.for_access(key, &value) {
                            entry.expires_at = deadline(now, extension);
                        }
                        entry.last_access = now;
                        entry.hits += 1;
                        let holder = self.holder_view(entry);
                        drop(map);
                        self.stats.record_hit();
                        return Ok(Some(holder));
                    }
                }
            }
            gate.wait();
        }
    }

    /// Claim an exclusive hold on `key` and return the resident holder, if
    /// any, for the caller to mutate and later [`flush`](Self::flush).
    ///
    /// A resident entry's fault reuses the entry's id; an absent key gets a
    /// fresh one. Concurrent `get_and_fault` calls on the same key block
    /// until the first hold resolves; two callers never simultaneously own
    /// the same key's fault. A resident-but-expired entry is reaped as an
    /// expiration and the fault is granted over an absent key.
    pub fn get_and_fault(&self, key: &K) -> CacheResult<(Fault, Option<Arc<ValueHolder<V>>>)> {
        loop {
            self.ensure_open()?;
            let now = self.clock.now_millis();
            let gate;
            {
                let mut map = self.shard(key).lock();
                if let Some(ByteSlot::Faulted(token)) = map.get(key) {
                    gate = token.gate.clone();
                } else {
                    let (id, prior, view, expired) = match map.remove(key) {
                        None => (self.mint_id(), None, None, None),
                        Some(ByteSlot::Resolved(entry)) => {
                            self.usage.release(self.weight_of(&entry));
                            if entry.is_expired(now) {
                                (self.mint_id(), None, None, Some(self.into_holder(entry)))
                            } else {
                                let id = entry.id;
                                let view = self.holder_view(&entry);
                                (id, Some(entry), Some(view), None)
                            }
                        }
                        Some(ByteSlot::Faulted(token)) => {
                            map.insert(key.clone(), ByteSlot::Faulted(token));
                            continue;
                        }
                    };
                    map.insert(
                        key.clone(),
                        ByteSlot::Faulted(FaultToken {
                            id,
                            prior,
                            gate: Arc::new(FaultGate::new()),
                        }),
                    );
                    drop(map);
                    if let Some(holder) = expired {
                        self.fire_expiration(key, &holder);
                    }
                    return Ok((Fault { id }, view));
                }
            }
            gate.wait();
        }
    }

    /// Write `holder`'s state back for the hold granted as `fault`,
    /// consuming and releasing the fault.
    ///
    /// Returns `Ok(true)` when the write-back changed stored state. A fault
    /// that has since been superseded by a put or destroyed by an
    /// invalidation is stale: the flush returns `Ok(false)` and stores
    /// nothing; the caller must not assume the value is resident. Access
    /// and hit deltas accumulated on the holder while faulted are applied
    /// alongside the re-encoded bytes. A holder that cannot be encoded
    /// fails the fault, reinstating the prior entry, and surfaces the
    /// serialization error. Deliberately usable after
    /// [`close`](Self::close): a fault granted before shutdown must still
    /// resolve.
    pub fn flush(&self, key: &K, fault: Fault, holder: &ValueHolder<V>) -> CacheResult<bool> {
        let entry = match self.entry_from_holder(holder, fault.id) {
            Ok(entry) => entry,
            Err(error) => {
                self.fail_fault(key, fault);
                return Err(error);
            }
        };
        let installed = {
            let mut map = self.shard(key).lock();
            match map.get(key) {
                Some(ByteSlot::Faulted(token)) if token.id == fault.id => {
                    let gate = token.gate.clone();
                    self.usage.acquire(self.weight_of(&entry));
                    map.insert(key.clone(), ByteSlot::Resolved(entry));
                    gate.open();
                    true
                }
                _ => false,
            }
        };
        if installed {
            self.stats.record_put();
            if self.usage.is_over() {
                self.evict();
            }
        }
        Ok(installed)
    }

    /// Abandon the hold granted as `fault`, consuming it and reinstating
    /// whatever was resident before the fault (or leaving the key absent).
    ///
    /// Usable after [`close`](Self::close), like [`flush`](Self::flush).
    pub fn fail_fault(&self, key: &K, fault: Fault) {
        let mut map = self.shard(key).lock();
        let ours = matches!(map.get(key), Some(ByteSlot::Faulted(token)) if token.id == fault.id);
        if !ours {
            return;
        }
        if let Some(ByteSlot::Faulted(token)) = map.remove(key) {
            if let Some(prior) = token.prior {
                self.usage.acquire(self.weight_of(&prior));
                map.insert(key.clone(), ByteSlot::Resolved(prior));
            }
            token.gate.open();
        }
    }

    /// Remove and return `key`'s holder if present and live.
    ///
    /// A present-but-expired entry is removed and reported to the
    /// invalidation listener, not reported as a plain miss, and `None` is
    /// returned.
    /// A faulted key blocks until the fault resolves.
    pub fn get_and_remove(&self, key: &K) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        loop {
            self.ensure_open()?;
            let now = self.clock.now_millis();
            let gate;
            {
                let mut map = self.shard(key).lock();
                match map.get(key) {
                    None => return Ok(None),
                    Some(ByteSlot::Faulted(token)) => {
                        gate = token.gate.clone();
                    }
                    Some(ByteSlot::Resolved(_)) => {
                        let entry = match map.remove(key) {
                            Some(ByteSlot::Resolved(entry)) => entry,
                            _ => continue,
                        };
                        self.usage.release(self.weight_of(&entry));
                        let expired = entry.is_expired(now);
                        let holder = self.into_holder(entry);
                        drop(map);
                        if expired {
                            self.fire_invalidation(key, &holder);
                            return Ok(None);
                        }
                        return Ok(Some(holder));
                    }
                }
            }
            gate.wait();
        }
    }

    /// Insert or replace `key`'s value.
    ///
    /// A put to a faulted key supersedes the fault: waiters wake against
    /// the new value and the outstanding flush becomes stale. Replacement
    /// computes expiry through the update hook; an answer of "no change"
    /// carries the previous expiration forward. A creation the expiry
    /// policy marks immediately expired stores nothing. Encoding happens
    /// before any lock is taken, so a codec failure leaves the tier
    /// untouched.
    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        self.ensure_open()?;
        let bytes = self.codec.encode(&value)?;
        let now = self.clock.now_millis();
        {
            let mut map = self.shard(&key).lock();
            let expires_at = match map.get(&key) {
                Some(ByteSlot::Resolved(entry)) if !entry.is_expired(now) => {
                    match self.expiry.for_update(&key, None, &value) {
                        None => entry.expires_at,
                        Some(expiry) => deadline(now, expiry),
                    }
                }
                _ => deadline(now, self.expiry.for_creation(&key, &value)),
            };
            match map.remove(&key) {
                Some(ByteSlot::Resolved(old)) => self.usage.release(self.weight_of(&old)),
                Some(ByteSlot::Faulted(token)) => token.gate.open(),
                None => {}
            }
            if expires_at > now {
                let entry = StoredEntry {
                    bytes,
                    id: self.mint_id(),
                    created_at: now,
                    last_access: now,
                    expires_at,
                    hits: 0,
                };
                self.usage.acquire(self.weight_of(&entry));
                map.insert(key, ByteSlot::Resolved(entry));
            }
        }
        self.stats.record_put();
        if self.usage.is_over() {
            self.evict();
        }
        Ok(())
    }

    /// Install a holder evicted from a faster tier, preserving its
    /// metadata. The hand-off is a move: the holder's creation time,
    /// access history and id travel with it.
    ///
    /// An already-expired holder is dropped without being stored. A demotion
    /// landing on a faulted key supersedes the fault, like a put.
    pub fn accept_demoted(&self, key: &K, holder: &ValueHolder<V>) -> CacheResult<()> {
        self.ensure_open()?;
        let now = self.clock.now_millis();
        if holder.is_expired(now) {
            return Ok(());
        }
        let id = if holder.id() >= 0 { holder.id() } else { self.mint_id() };
        let entry = self.entry_from_holder(holder, id)?;
        {
            let mut map = self.shard(key).lock();
            match map.remove(key) {
                Some(ByteSlot::Resolved(old)) => self.usage.release(self.weight_of(&old)),
                Some(ByteSlot::Faulted(token)) => token.gate.open(),
                None => {}
            }
            self.usage.acquire(self.weight_of(&entry));
            map.insert(key.clone(), ByteSlot::Resolved(entry));
        }
        self.stats.record_put();
        if self.usage.is_over() {
            self.evict();
        }
        Ok(())
    }

    /// Unconditionally remove `key`, returning the holder without firing
    /// any notification. A faulted key's prior holder is taken and the
    /// token destroyed: waiters observe absence and the straggling flush
    /// returns `false`.
    pub fn take(&self, key: &K) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        self.ensure_open()?;
        let mut map = self.shard(key).lock();
        match map.remove(key) {
            None => Ok(None),
            Some(ByteSlot::Resolved(entry)) => {
                self.usage.release(self.weight_of(&entry));
                Ok(Some(self.into_holder(entry)))
            }
            Some(ByteSlot::Faulted(token)) => {
                token.gate.open();
                Ok(token.prior.map(|prior| self.into_holder(prior)))
            }
        }
    }

    /// Remove `key` for correctness and report the removed holder to the
    /// invalidation listener.
    ///
    /// Invalidating a faulted key destroys the token: waiters observe
    /// absence, and the outstanding flush returns `false`.
    pub fn invalidate(&self, key: &K) -> CacheResult<()> {
        self.ensure_open()?;
        let removed = {
            let mut map = self.shard(key).lock();
            match map.remove(key) {
                None => None,
                Some(ByteSlot::Resolved(entry)) => {
                    self.usage.release(self.weight_of(&entry));
                    Some(self.into_holder(entry))
                }
                Some(ByteSlot::Faulted(token)) => {
                    token.gate.open();
                    token.prior.map(|prior| self.into_holder(prior))
                }
            }
        };
        if let Some(holder) = removed {
            self.fire_invalidation(key, &holder);
        }
        Ok(())
    }

    /// Invalidate every key, reporting each removed holder.
    pub fn invalidate_all(&self) -> CacheResult<()> {
        self.invalidate_all_matching(|_| true)
    }

    /// Invalidate every key matching `pred`, reporting each removed
    /// holder.
    pub fn invalidate_all_matching(&self, pred: impl Fn(&K) -> bool) -> CacheResult<()> {
        self.ensure_open()?;
        for shard in &self.shards {
            let mut removed = Vec::new();
            {
                let mut map = shard.lock();
                let matching: Vec<K> = map.keys().filter(|k| pred(k)).cloned().collect();
                for key in matching {
                    match map.remove(&key) {
                        None => {}
                        Some(ByteSlot::Resolved(entry)) => {
                            self.usage.release(self.weight_of(&entry));
                            removed.push((key, self.into_holder(entry)));
                        }
                        Some(ByteSlot::Faulted(token)) => {
                            token.gate.open();
                            if let Some(prior) = token.prior {
                                removed.push((key, self.into_holder(prior)));
                            }
                        }
                    }
                }
            }
            for (key, holder) in removed {
                self.fire_invalidation(&key, &holder);
            }
        }
        Ok(())
    }

    /// Remove every entry without per-key notifications. Outstanding
    /// fault tokens are destroyed; their flushes will return `false`.
    pub fn clear(&self) -> CacheResult<()> {
        self.ensure_open()?;
        for shard in &self.shards {
            let mut map = shard.lock();
            for (_, slot) in map.drain() {
                match slot {
                    ByteSlot::Resolved(entry) => self.usage.release(self.weight_of(&entry)),
                    ByteSlot::Faulted(token) => token.gate.open(),
                }
            }
        }
        Ok(())
    }

    fn evict(&self) {
        let mut attempts = 0;
        while self.usage.is_over() && attempts < self.eviction_retries {
            attempts += 1;
            let candidates = self.sample();
            let victim = candidates
                .into_iter()
                .min_by(|a, b| self.prioritizer.compare((&a.0, &a.2), (&b.0, &b.2)));
            let Some((key, id, holder)) = victim else { continue };

            let removed = {
                let mut map = self.shard(&key).lock();
                let current = matches!(
                    map.get(&key),
                    Some(ByteSlot::Resolved(entry)) if entry.id == id
                );
                if current {
                    if let Some(ByteSlot::Resolved(entry)) = map.remove(&key) {
                        // dropping the entry releases its encoded bytes;
                        // accounting follows inside the same critical
                        // section
                        self.usage.release(self.weight_of(&entry));
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

    /// Draw a bounded sample of resolved entries from the first non-empty
    /// shard at a random starting point, reaping expired entries and
    /// dropping vetoed ones. Faulted slots are never candidates.
    fn sample(&self) -> Vec<(K, i64, Arc<ValueHolder<V>>)> {
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
            let picked: Vec<K> = map
                .iter()
                .skip(offset)
                .chain(map.iter().take(offset))
                .filter(|(_, slot)| matches!(slot, ByteSlot::Resolved(_)))
                .take(self.sample_size)
                .map(|(k, _)| k.clone())
                .collect();
            if picked.is_empty() {
                continue;
            }
            for key in picked {
                let Some(ByteSlot::Resolved(entry)) = map.get(&key) else { continue };
                if entry.is_expired(now) {
                    if let Some(ByteSlot::Resolved(entry)) = map.remove(&key) {
                        self.usage.release(self.weight_of(&entry));
                        reaped.push((key, self.into_holder(entry)));
                    }
                    continue;
                }
                let holder = self.holder_view(entry);
                if !self
                    .veto
                    .as_ref()
                    .is_some_and(|veto| veto.test(&key, &holder))
                {
                    candidates.push((key, entry.id, holder));
                }
            }
            break;
        }
        for (key, holder) in reaped {
            self.fire_expiration(&key, &holder);
        }
        candidates
    }

    /// Current usage in the capacity's own unit: resident entries, or
    /// total encoded bytes.
    pub fn used(&self) -> usize {
        self.usage.used()
    }

    /// Number of resident (non-faulted) entries.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|slot| matches!(slot, ByteSlot::Resolved(_)))
                    .count()
            })
            .sum()
    }

    /// Whether the tier holds no resolved entries.
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

    /// Mark the tier closed. New operations fail fast with
    /// [`CacheError::Closed`]; already-granted faults remain flushable and
    /// failable so no hold is silently dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl<K, V> LowerTier<K, V> for ByteTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn get_and_remove(&self, key: &K) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        ByteTier::get_and_remove(self, key)
    }

    fn take(&self, key: &K) -> CacheResult<Option<Arc<ValueHolder<V>>>> {
        ByteTier::take(self, key)
    }

    fn accept_demoted(&self, key: &K, holder: &ValueHolder<V>) -> CacheResult<()> {
        ByteTier::accept_demoted(self, key, holder)
    }

    fn set_invalidation_listener(&self, listener: Arc<dyn InvalidationListener<K, V>>) {
        ByteTier::set_invalidation_listener(self, listener)
    }

    fn clear(&self) -> CacheResult<()> {
        ByteTier::clear(self)
    }
}
