//! Concurrency Tests
//!
//! Exercises the tiers under real threads:
//!
//! 1. **At-most-once computation** - N concurrent callers, one compute run
//! 2. **Per-key blocking only** - Traffic on unrelated keys proceeds while
//!    a key's computation is in flight
//! 3. **Capacity under contention** - Concurrent writers never leave the
//!    tier more than one entry over its bound
//! 4. **Fault serialization** - Exclusive holds on the same key never
//!    overlap, and no access-count update is lost
//! 5. **Invalidation fencing** - An invalidation racing an in-flight
//!    computation is never undone by the straggling result

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use strata_cache::{
    BincodeCodec, ByteTier, ByteTierConfig, Capacity, CompoundTier, HeapTier, HeapTierConfig,
};

// =============================================================================
// At-most-once computation
// =============================================================================

#[test]
fn n_concurrent_callers_share_one_computation() {
    const CALLERS: usize = 8;

    let tier: Arc<HeapTier<String, String>> = Arc::new(
        HeapTier::builder(HeapTierConfig::new(64)).build().unwrap(),
    );
    let runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let tier = tier.clone();
            let runs = runs.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let holder = tier
                    .get_or_compute_if_absent(&"k".to_string(), |_| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok("computed".to_string())
                    })
                    .unwrap();
                holder.value().unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), "computed");
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(tier.len(), 1);
}

// =============================================================================
// Per-key blocking only
// =============================================================================

#[test]
fn unrelated_keys_proceed_while_a_computation_is_in_flight() {
    let tier: Arc<HeapTier<String, String>> = Arc::new(
        HeapTier::builder(HeapTierConfig::new(64)).build().unwrap(),
    );

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let blocked = {
        let tier = tier.clone();
        thread::spawn(move || {
            tier.get_or_compute_if_absent(&"slow".to_string(), move |_| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok("slow-value".to_string())
            })
        })
    };
    started_rx.recv().unwrap();

    // with "slow" still computing, other keys complete immediately
    let holder = tier
        .get_or_compute_if_absent(&"fast".to_string(), |_| Ok("fast-value".to_string()))
        .unwrap();
    assert_eq!(holder.value().unwrap(), "fast-value");

    release_tx.send(()).unwrap();
    assert_eq!(blocked.join().unwrap().unwrap().value().unwrap(), "slow-value");
}

#[test]
fn a_reader_of_a_faulted_key_blocks_until_the_flush() {
    let tier: Arc<ByteTier<String, String>> = Arc::new(
        ByteTier::builder(
            ByteTierConfig::new(Capacity::Entries(64)),
            Arc::new(BincodeCodec),
        )
        .build()
        .unwrap(),
    );
    tier.put("k".to_string(), "v".to_string()).unwrap();

    let (fault, holder) = tier.get_and_fault(&"k".to_string()).unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    let reader = {
        let tier = tier.clone();
        thread::spawn(move || {
            let value = tier
                .get(&"k".to_string())
                .unwrap()
                .unwrap()
                .value()
                .unwrap();
            done_tx.send(()).unwrap();
            value
        })
    };

    // the reader cannot complete while the hold is outstanding
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

    assert!(tier.flush(&"k".to_string(), fault, &holder.unwrap()).unwrap());
    assert_eq!(reader.join().unwrap(), "v");
}

// =============================================================================
// Capacity under contention
// =============================================================================

#[test]
fn concurrent_writers_respect_the_capacity_bound() {
    const WRITERS: usize = 4;
    const PUTS_PER_WRITER: usize = 250;
    const CAPACITY: usize = 64;

    let tier: Arc<HeapTier<String, String>> = Arc::new(
        HeapTier::builder(HeapTierConfig::new(CAPACITY)).build().unwrap(),
    );
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let tier = tier.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PUTS_PER_WRITER {
                    tier.put(format!("w{w}-k{i}"), "v".to_string()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // a transient one-entry excess is the only tolerated overshoot
    assert!(
        tier.len() <= CAPACITY + 1,
        "tier settled at {} entries",
        tier.len()
    );
}

// =============================================================================
// Fault serialization
// =============================================================================

#[test]
fn exclusive_holds_never_lose_an_access_update() {
    const HOLDERS: usize = 4;
    const CYCLES: usize = 25;

    let tier: Arc<ByteTier<String, u64>> = Arc::new(
        ByteTier::builder(
            ByteTierConfig::new(Capacity::Entries(64)),
            Arc::new(BincodeCodec),
        )
        .build()
        .unwrap(),
    );
    tier.put("k".to_string(), 0u64).unwrap();

    let barrier = Arc::new(Barrier::new(HOLDERS));
    let handles: Vec<_> = (0..HOLDERS)
        .map(|_| {
            let tier = tier.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..CYCLES {
                    let (fault, holder) = tier.get_and_fault(&"k".to_string()).unwrap();
                    let holder = holder.expect("entry must stay resident");
                    holder.touch(holder.last_access() + 1, None);
                    assert!(tier.flush(&"k".to_string(), fault, &holder).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // every hold's hit-count delta was applied exactly once
    let holder = tier.get(&"k".to_string()).unwrap().unwrap();
    assert_eq!(holder.hits(), (HOLDERS * CYCLES) as u64 + 1);
}

// =============================================================================
// Invalidation fencing
// =============================================================================

#[test]
fn invalidation_racing_a_computation_is_never_undone() {
    let primary: Arc<HeapTier<String, String>> = Arc::new(
        HeapTier::builder(HeapTierConfig::new(64)).build().unwrap(),
    );
    let byte: Arc<ByteTier<String, String>> = Arc::new(
        ByteTier::builder(
            ByteTierConfig::new(Capacity::Entries(64)),
            Arc::new(BincodeCodec),
        )
        .build()
        .unwrap(),
    );
    let compound = CompoundTier::new(primary, byte.clone());

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let worker = {
        let compound = compound.clone();
        thread::spawn(move || {
            compound.get_or_compute_if_absent(&"k".to_string(), move |_| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok("late".to_string())
            })
        })
    };

    started_rx.recv().unwrap();
    compound.invalidate(&"k".to_string()).unwrap();
    release_tx.send(()).unwrap();

    // the computing caller observes its own result
    let holder = worker.join().unwrap().unwrap();
    assert_eq!(holder.value().unwrap(), "late");

    // but the invalidated key does not reappear in either tier
    assert!(compound.get(&"k".to_string()).unwrap().is_none());
    assert!(byte.get(&"k".to_string()).unwrap().is_none());
}
