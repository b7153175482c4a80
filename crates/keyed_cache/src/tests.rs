// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Eviction, tiering and accounting scenarios for the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing_test::traced_test;

use crate::{Cache, Cached, INITIAL_WEIGHT, Loader};

fn counting_cache(capacity: usize, loads: &Arc<AtomicUsize>) -> Cache<u32, u32, impl Loader<u32, u32, Error = ()> + use<>> {
    let loads = Arc::clone(loads);
    Cache::new(capacity, move |key: &u32| {
        loads.fetch_add(1, Ordering::SeqCst);
        Ok::<_, ()>(key * 10)
    })
}

/// Loads keys `1..=10` and gives key `k` a weight of `100 + 2k`, holding every value.
fn fill_with_distinct_weights(cache: &Cache<u32, u32, impl Loader<u32, u32, Error = ()>>) -> Vec<Cached<u32>> {
    let mut held = Vec::new();
    for key in 1..=10 {
        held.push(cache.get(&key).expect("load succeeds"));
        for _ in 0..2 * key {
            let _ = cache.get(&key).expect("hit");
        }
    }
    held
}

#[test]
fn sweep_demotes_lightest_entries() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let mut held = fill_with_distinct_weights(&cache);
    assert_eq!(cache.strong_len(), 10);
    assert_eq!(held[4].weight(), INITIAL_WEIGHT + 10);

    // 10 strong entries + 1 reaches the high watermark of 11: demote 11 - 7 = 4.
    held.push(cache.get(&11).expect("load succeeds"));
    assert_eq!(cache.strong_len(), 7);
    assert_eq!(cache.weak_len(), 4);
    for key in 1..=4 {
        assert!(!cache.contains_strong(&key), "key {key} should have been demoted");
        assert!(cache.contains_weak(&key), "key {key} is still held and should be in the weak tier");
    }
    for key in 5..=11 {
        assert!(cache.contains_strong(&key), "key {key} should still be strong");
    }

    // Survivors were decayed by the sweep; the new entry was not scanned.
    assert_eq!(held[4].weight(), (INITIAL_WEIGHT + 10) / 2);
    assert_eq!(held[10].weight(), INITIAL_WEIGHT);

    held.push(cache.get(&12).expect("load succeeds"));
    assert_eq!(cache.strong_len(), 8);
    assert!(cache.strong_len() <= cache.watermarks().expect("bounded").high());
    assert_eq!(cache.stats().demotions, 4);
    assert_eq!(loads.load(Ordering::SeqCst), 12);
}

#[test]
fn weak_hit_does_not_promote() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let held = fill_with_distinct_weights(&cache);
    let _eleven = cache.get(&11).expect("load succeeds");
    assert!(cache.contains_weak(&1));

    let weight = held[0].weight();
    let again = cache.get(&1).expect("weak hit");
    assert!(Cached::ptr_eq(&again, &held[0]));
    assert_eq!(again.weight(), weight + 1);
    assert!(cache.contains_weak(&1));
    assert!(!cache.contains_strong(&1));
    assert_eq!(loads.load(Ordering::SeqCst), 11);
}

#[test]
fn dead_weak_entry_is_reloaded_fresh() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let mut held = fill_with_distinct_weights(&cache);
    let _eleven = cache.get(&11).expect("load succeeds");

    // Dropping the only reference kills the weak entry for key 1.
    let old = held.remove(0);
    let old_weight = old.weight();
    drop(old);
    assert!(!cache.contains_weak(&1));

    let fresh = cache.get(&1).expect("reload succeeds");
    assert_eq!(*fresh, 10);
    assert_eq!(fresh.weight(), INITIAL_WEIGHT);
    assert_ne!(fresh.weight(), old_weight + 1);
    assert!(cache.contains_strong(&1));
    assert_eq!(loads.load(Ordering::SeqCst), 12);
}

#[test]
fn unreferenced_demoted_entries_are_reaped() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    drop(fill_with_distinct_weights(&cache));

    let _eleven = cache.get(&11).expect("load succeeds");
    assert_eq!(cache.weak_len(), 4);
    assert!(!cache.contains_weak(&1));

    assert_eq!(cache.reap(), 4);
    assert_eq!(cache.weak_len(), 0);
    assert_eq!(cache.len(), 7);
    assert_eq!(cache.reap(), 0);
    assert_eq!(cache.stats().reaped, 4);
}

#[test]
fn weak_tier_is_trimmed_oldest_first() {
    let loads = Arc::new(AtomicUsize::new(0));
    let loader_loads = Arc::clone(&loads);
    let cache = Cache::builder(move |key: &u32| {
        loader_loads.fetch_add(1, Ordering::SeqCst);
        Ok::<_, ()>(*key)
    })
    .capacity(10)
    .weak_capacity(2)
    .build();

    let held = fill_with_distinct_weights(&cache);
    let _eleven = cache.get(&11).expect("load succeeds");

    assert_eq!(cache.weak_len(), 2);
    let retired = held[..4].iter().filter(|cached| cached.is_retired()).count();
    assert_eq!(retired, 2);
    let weak = (1..=4).filter(|key| cache.contains_weak(key)).count();
    assert_eq!(weak, 2);
}

#[test]
fn weight_grows_by_one_per_access() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let first = cache.get(&5).expect("load succeeds");

    for _ in 0..17 {
        let _ = cache.get(&5).expect("hit");
    }
    assert_eq!(first.weight(), INITIAL_WEIGHT + 17);

    let _ = cache.peek(&5).expect("resident");
    assert_eq!(first.weight(), INITIAL_WEIGHT + 18);
    assert_eq!(cache.hits(), 18);
    assert_eq!(cache.misses(), 1);
}

#[test]
fn peek_never_loads() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);

    assert!(cache.peek(&1).is_none());
    assert_eq!(loads.load(Ordering::SeqCst), 0);
    assert_eq!(cache.misses(), 0);
}

#[test]
fn unbounded_cache_never_sweeps() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(0, &loads);
    assert_eq!(cache.capacity(), None);
    assert_eq!(cache.watermarks(), None);

    for key in 0..500 {
        let _ = cache.get(&key).expect("load succeeds");
    }
    assert_eq!(cache.strong_len(), 500);
    assert_eq!(cache.weak_len(), 0);
    assert_eq!(cache.stats().demotions, 0);
}

#[test]
fn small_capacity_is_coerced() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(3, &loads);
    assert_eq!(cache.capacity(), Some(crate::MIN_CAPACITY));

    for key in 0..10 {
        let _ = cache.get(&key).expect("load succeeds");
    }
    assert_eq!(cache.strong_len(), 10);
}

#[test]
fn strong_tier_stays_below_high_watermark() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(50, &loads);
    let high = cache.watermarks().expect("bounded").high();

    for key in 0..1_000 {
        let _ = cache.get(&(key % 300)).expect("load succeeds");
        assert!(cache.strong_len() < high, "strong tier grew to {}", cache.strong_len());
    }
}

#[test]
fn reclaim_keeps_referenced_entries() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(0, &loads);

    let kept = cache.get(&1).expect("load succeeds");
    let _ = cache.get(&2).expect("load succeeds");
    let _ = cache.get(&3).expect("load succeeds");

    assert_eq!(cache.reclaim(), 2);
    assert!(cache.contains_strong(&1));
    assert!(!kept.is_retired());
    assert_eq!(cache.len(), 1);

    let _ = cache.get(&2).expect("reload succeeds");
    assert_eq!(loads.load(Ordering::SeqCst), 4);
    assert_eq!(cache.stats().reclaimed, 2);
}

#[test]
fn invalidate_removes_and_retires() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);

    let before = cache.get(&1).expect("load succeeds");
    assert!(cache.invalidate(&1));
    assert!(!cache.invalidate(&1));
    assert!(before.is_retired());
    assert!(cache.is_empty());

    let after = cache.get(&1).expect("reload succeeds");
    assert!(!Cached::ptr_eq(&before, &after));
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[test]
fn clones_share_state() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let clone = cache.clone();

    let _ = cache.get(&1).expect("load succeeds");
    let _ = clone.get(&1).expect("hit");
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(clone.hits(), 1);
    assert!(format!("{clone:?}").contains("strong_len: 1"));
}

#[test]
#[traced_test]
fn sweep_is_logged() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let _held = fill_with_distinct_weights(&cache);
    let _eleven = cache.get(&11).expect("load succeeds");

    assert!(logs_contain("cache.sweep"));
    assert!(logs_contain("cache.demoted=4"));
}

#[test]
fn reap_leaves_reloaded_key_alone() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let mut held = fill_with_distinct_weights(&cache);
    let _eleven = cache.get(&11).expect("load succeeds");
    assert!(cache.contains_weak(&1));

    drop(held.remove(0));
    let fresh = cache.get(&1).expect("reload succeeds");
    assert!(cache.contains_strong(&1));

    assert_eq!(cache.reap(), 0);
    assert!(cache.contains_strong(&1));
    assert!(!fresh.is_retired());
    assert!(Cached::ptr_eq(&fresh, &cache.peek(&1).expect("resident")));
}

#[test]
fn invalidated_weak_entries_do_not_linger() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let held = fill_with_distinct_weights(&cache);
    let _eleven = cache.get(&11).expect("load succeeds");

    for key in 1..=4 {
        assert!(cache.invalidate(&key));
    }
    assert_eq!(cache.weak_len(), 0);
    assert_eq!(cache.reap(), 0);
    assert!(held[..4].iter().all(Cached::is_retired));

    // Reloading an invalidated key puts a fresh entry in the strong tier.
    let fresh = cache.get(&1).expect("reload succeeds");
    assert!(!Cached::ptr_eq(&fresh, &held[0]));
    assert!(cache.contains_strong(&1));
}

#[test]
fn one_reporter_per_cache() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);

    let reporter = cache.report_stats(Duration::from_secs(60)).expect("first reporter starts");
    assert!(cache.report_stats(Duration::from_secs(60)).is_none());

    reporter.stop();
    let again = cache.report_stats(Duration::from_secs(60));
    assert!(again.is_some());
}

#[test]
#[traced_test]
fn reporter_logs_cache_hit_ratio() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    for _ in 0..4 {
        let _ = cache.get(&1).expect("load succeeds");
    }

    let reporter = cache.report_stats(Duration::from_millis(5)).expect("reporter starts");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !logs_contain("cache.hit_ratio=0.75") && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    drop(reporter);

    assert!(logs_contain("cache.name=\"keyed_cache\""));
    assert!(logs_contain("cache.hit_ratio=0.75"));
}

#[test]
fn reporter_stops_when_cache_is_dropped() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = counting_cache(10, &loads);
    let reporter = cache.report_stats(Duration::from_millis(1)).expect("reporter starts");

    drop(cache);
    // Joins the reporter thread, which exits on its own once the cache is gone.
    reporter.stop();
}

#[test]
fn cache_is_send_and_sync() {
    static_assertions::assert_impl_all!(Cache<String, Vec<u8>, fn(&String) -> Result<Vec<u8>, std::io::Error>>: Send, Sync, Clone);
    static_assertions::assert_impl_all!(crate::KeyedHandle<String, Vec<u8>, fn(&String) -> Result<Vec<u8>, std::io::Error>>: Send, Sync);
    static_assertions::assert_impl_all!(Cached<String>: Send, Sync, Clone);
}
