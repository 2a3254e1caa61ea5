//! Expiry policies
//!
//! A tier consults its [`ExpiryPolicy`] at three points in an entry's life:
//! when a value is first stored, when it is replaced, and when it is read.
//! The policy answers with an [`Expiry`] describing how much longer the
//! entry may live; update and access hooks may also answer "no change".

/// How long an entry may live, measured from the moment the hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Live for the given number of milliseconds.
    After(u64),
    /// Never expire.
    Never,
    /// Already expired; a creation answering this stores nothing.
    Immediate,
}

/// Pluggable time-to-live computation.
///
/// Implementations must be cheap and thread-safe; hooks run inside tier
/// critical sections.
pub trait ExpiryPolicy<K, V>: Send + Sync {
    /// Expiry for a freshly stored value.
    fn for_creation(&self, key: &K, value: &V) -> Expiry;

    /// Expiry for a replaced value. `old` is supplied when the previous
    /// value is available without decoding; `None` otherwise. Returning
    /// `None` keeps the previous expiration time.
    fn for_update(&self, key: &K, old: Option<&V>, new: &V) -> Option<Expiry>;

    /// Expiry extension applied on read. Returning `None` leaves the
    /// expiration time unchanged.
    fn for_access(&self, key: &K, value: &V) -> Option<Expiry>;
}

/// Entries never expire.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpiry;

impl<K, V> ExpiryPolicy<K, V> for NoExpiry {
    fn for_creation(&self, _key: &K, _value: &V) -> Expiry {
        Expiry::Never
    }

    fn for_update(&self, _key: &K, _old: Option<&V>, _new: &V) -> Option<Expiry> {
        None
    }

    fn for_access(&self, _key: &K, _value: &V) -> Option<Expiry> {
        None
    }
}

/// Fixed lifetime from creation or update; reads do not extend it.
#[derive(Debug, Clone, Copy)]
pub struct TimeToLive {
    ttl_millis: u64,
}

impl TimeToLive {
    /// Expire entries `ttl_millis` after they are written.
    pub fn new(ttl_millis: u64) -> Self {
        Self { ttl_millis }
    }
}

impl<K, V> ExpiryPolicy<K, V> for TimeToLive {
    fn for_creation(&self, _key: &K, _value: &V) -> Expiry {
        Expiry::After(self.ttl_millis)
    }

    fn for_update(&self, _key: &K, _old: Option<&V>, _new: &V) -> Option<Expiry> {
        Some(Expiry::After(self.ttl_millis))
    }

    fn for_access(&self, _key: &K, _value: &V) -> Option<Expiry> {
        None
    }
}

/// Idle timeout: every read pushes the expiration out again.
#[derive(Debug, Clone, Copy)]
pub struct TimeToIdle {
    tti_millis: u64,
}

impl TimeToIdle {
    /// Expire entries `tti_millis` after their last access.
    pub fn new(tti_millis: u64) -> Self {
        Self { tti_millis }
    }
}

impl<K, V> ExpiryPolicy<K, V> for TimeToIdle {
    fn for_creation(&self, _key: &K, _value: &V) -> Expiry {
        Expiry::After(self.tti_millis)
    }

    fn for_update(&self, _key: &K, _old: Option<&V>, _new: &V) -> Option<Expiry> {
        Some(Expiry::After(self.tti_millis))
    }

    fn for_access(&self, _key: &K, _value: &V) -> Option<Expiry> {
        Some(Expiry::After(self.tti_millis))
    }
}
