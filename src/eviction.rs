//! Eviction vetoes and prioritizers
//!
//! Eviction draws a bounded random sample of resident entries, discards the
//! vetoed ones, and evicts the sample's least element under the configured
//! prioritizer. The defaults are no veto and least-recently-used ordering.

use std::cmp::Ordering;

use crate::holder::ValueHolder;

/// Exempts entries from eviction regardless of their ranking.
pub trait EvictionVeto<K, V>: Send + Sync {
    /// `true` means the entry must not be evicted.
    fn test(&self, key: &K, holder: &ValueHolder<V>) -> bool;
}

/// Vetoes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVeto;

impl<K, V> EvictionVeto<K, V> for NoVeto {
    fn test(&self, _key: &K, _holder: &ValueHolder<V>) -> bool {
        false
    }
}

impl<K, V, F> EvictionVeto<K, V> for F
where
    F: Fn(&K, &ValueHolder<V>) -> bool + Send + Sync,
{
    fn test(&self, key: &K, holder: &ValueHolder<V>) -> bool {
        self(key, holder)
    }
}

/// Total order over eviction candidates; the least element is evicted
/// first.
pub trait EvictionPrioritizer<K, V>: Send + Sync {
    /// Compare two candidates.
    fn compare(&self, a: (&K, &ValueHolder<V>), b: (&K, &ValueHolder<V>)) -> Ordering;
}

/// Default prioritizer: the entry with the oldest access time loses.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyUsed;

impl<K, V> EvictionPrioritizer<K, V> for LeastRecentlyUsed {
    fn compare(&self, a: (&K, &ValueHolder<V>), b: (&K, &ValueHolder<V>)) -> Ordering {
        a.1.last_access().cmp(&b.1.last_access())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::Expiry;

    #[test]
    fn lru_orders_by_last_access() {
        let older = ValueHolder::new(1, 10, Expiry::Never);
        let newer = ValueHolder::new(2, 10, Expiry::Never);
        newer.touch(50, None);

        let prioritizer = LeastRecentlyUsed;
        assert_eq!(
            prioritizer.compare((&"a", &older), (&"b", &newer)),
            Ordering::Less
        );
        assert_eq!(
            prioritizer.compare((&"b", &newer), (&"a", &older)),
            Ordering::Greater
        );
    }

    #[test]
    fn closures_act_as_vetoes() {
        let veto = |key: &&str, _holder: &ValueHolder<i32>| *key == "pinned";
        let holder = ValueHolder::new(0, 0, Expiry::Never);
        assert!(EvictionVeto::test(&veto, &"pinned", &holder));
        assert!(!EvictionVeto::test(&veto, &"other", &holder));
    }
}
