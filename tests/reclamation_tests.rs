mod common;

use common::{Counter, FlakyStore, GatedStore, config, init_tracing, open_memory, stored_value};
use oicache::cache::NotApplicable;
use oicache::{
    CacheError, IdentityCache, PageOutOutcome, PersistentStore, ReclamationStrategy, RetryPolicy,
    StoreError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    }
}

#[test]
fn test_sync_persists_mutation_under_both_strategies() {
    for strategy in [ReclamationStrategy::Manual, ReclamationStrategy::Automatic] {
        let (store, cache) = open_memory(config(strategy));
        let value = cache.get_or_create("k1", || Counter::new("k1")).unwrap();
        value.set(7);
        cache.request_page_out("k1").unwrap();

        cache.sync().unwrap();
        assert_eq!(stored_value(store.as_ref(), "k1"), Some(7), "{:?}", strategy);
        assert!(store.durable_get("k1").is_some());
        assert_eq!(cache.stats().dirty_entries, 0);
    }
}

#[test]
fn test_manual_dirty_values_written_through_on_overflow() {
    init_tracing();
    let (store, cache) = open_memory(config(ReclamationStrategy::Manual).max_dirty_entries(4));

    let values: Vec<_> = (0..10)
        .map(|i| {
            let key = format!("k{}", i);
            cache.get_or_create(&key, || Counter::new(&key)).unwrap()
        })
        .collect();
    for (i, value) in values.iter().enumerate() {
        value.set(100 + i as u64);
    }

    // the six oldest marks were pushed out of the tracker and written through
    for i in 0..6 {
        assert_eq!(stored_value(store.as_ref(), &format!("k{}", i)), Some(100 + i));
    }
    for i in 6..10 {
        assert_eq!(stored_value(store.as_ref(), &format!("k{}", i)), Some(0));
    }
    assert_eq!(cache.stats().write_throughs, 6);
}

#[test]
fn test_manual_dirty_values_written_through_on_age() {
    let (store, cache) = open_memory(
        config(ReclamationStrategy::Manual).max_dirty_age(Duration::from_millis(20)),
    );
    let value = cache.get_or_create("k", || Counter::new("k")).unwrap();
    value.set(3);
    assert_eq!(stored_value(store.as_ref(), "k"), Some(0));

    thread::sleep(Duration::from_millis(40));
    let report = cache.drain().unwrap();
    assert_eq!(report.write_throughs, 1);
    assert_eq!(stored_value(store.as_ref(), "k"), Some(3));
}

#[test]
fn test_automatic_idle_values_persisted_by_drains() {
    let (store, cache) = open_memory(config(ReclamationStrategy::Automatic).max_idle_entries(4));

    for i in 0..20u64 {
        let key = format!("k{:02}", i);
        let value = cache.get_or_create(&key, || Counter::new(&key)).unwrap();
        value.set(i * 10);
    }
    while cache.stats().pending_page_outs > 0 {
        cache.drain().unwrap();
    }

    assert_eq!(cache.hot_len(), 4);
    for i in 0..16u64 {
        assert_eq!(stored_value(store.as_ref(), &format!("k{:02}", i)), Some(i * 10));
    }
    for i in 0..20u64 {
        let key = format!("k{:02}", i);
        assert_eq!(cache.get(&key).unwrap().unwrap().get(), i * 10);
    }
}

#[test]
fn test_concurrent_reclaimers_single_write() {
    for _ in 0..20 {
        let store = Arc::new(GatedStore::new("counters"));
        let cache: IdentityCache<Counter> =
            IdentityCache::open(store.clone(), config(ReclamationStrategy::Automatic)).unwrap();
        drop(cache.get_or_create("k", || Counter::with_value("k", 9)).unwrap());

        let barrier = Barrier::new(2);
        let outcomes: Vec<PageOutOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.page_out("k").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, PageOutOutcome::PagedOut { persisted: true }))
            .count();
        assert_eq!(winners, 1, "{:?}", outcomes);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            PageOutOutcome::NotHot
                | PageOutOutcome::NotApplicable(NotApplicable::InFlight)
                | PageOutOutcome::NotApplicable(NotApplicable::Completed)
        )));
        assert_eq!(store.puts(), 1);
        assert_eq!(cache.hot_len(), 0);
        assert_eq!(cache.stats().page_outs, 1);
    }
}

#[test]
fn test_get_or_create_waits_for_in_flight_page_out() {
    let store = Arc::new(GatedStore::new("counters"));
    let cache: IdentityCache<Counter> =
        IdentityCache::open(store.clone(), config(ReclamationStrategy::Manual)).unwrap();
    let value = cache.get_or_create("k", || Counter::new("k")).unwrap();
    value.set(11);
    drop(value);

    store.close_gate();
    thread::scope(|scope| {
        let reclaimer = scope.spawn(|| cache.page_out("k").unwrap());
        store.wait_for_blocked_put();

        let reader = scope.spawn(|| {
            cache
                .get_or_create("k", || panic!("stored key must not be recreated"))
                .unwrap()
                .get()
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());

        store.open_gate();
        assert_eq!(reclaimer.join().unwrap(), PageOutOutcome::PagedOut { persisted: true });
        assert_eq!(reader.join().unwrap(), 11);
    });
    assert_eq!(cache.stats().disk_hits, 1);
    assert_eq!(cache.hot_len(), 1);
}

#[test]
fn test_wait_on_stuck_page_out_times_out() {
    let store = Arc::new(GatedStore::new("counters"));
    let cache: IdentityCache<Counter> = IdentityCache::open(
        store.clone(),
        config(ReclamationStrategy::Automatic).expunge_wait(Duration::from_millis(50)),
    )
    .unwrap();
    drop(cache.get_or_create("k", || Counter::with_value("k", 4)).unwrap());

    store.close_gate();
    thread::scope(|scope| {
        let reclaimer = scope.spawn(|| cache.page_out("k").unwrap());
        store.wait_for_blocked_put();

        let result = cache.get("k");
        assert!(matches!(result, Err(CacheError::AwaitTimeout { .. })), "{:?}", result.map(|r| r.is_some()));

        store.open_gate();
        assert_eq!(reclaimer.join().unwrap(), PageOutOutcome::PagedOut { persisted: true });
    });
    assert_eq!(cache.stats().await_timeouts, 1);
    assert_eq!(cache.get("k").unwrap().unwrap().get(), 4);
}

#[test]
fn test_contention_retried_then_succeeds() {
    let store = Arc::new(FlakyStore::new("counters", 3));
    let cache: IdentityCache<Counter> = IdentityCache::open(
        store.clone(),
        config(ReclamationStrategy::Manual).retry(fast_retry(24)),
    )
    .unwrap();

    let value = cache.get_or_create("k", || Counter::new("k")).unwrap();
    assert_eq!(value.get(), 0);
    assert_eq!(store.calls(), 4);
    assert_eq!(cache.stats().contention_retries, 3);
    assert!(store.inner().get("k").unwrap().is_some());
}

#[test]
fn test_contention_exhaustion_fails_only_that_call() {
    let store = Arc::new(FlakyStore::new("counters", 5));
    let cache: IdentityCache<Counter> = IdentityCache::open(
        store.clone(),
        config(ReclamationStrategy::Manual).retry(fast_retry(3)),
    )
    .unwrap();

    let result = cache.get_or_create("k", || Counter::new("k"));
    assert!(matches!(
        result,
        Err(CacheError::ContentionExhausted { attempts: 3, .. })
    ));
    assert!(cache.is_open());
    assert_eq!(cache.hot_len(), 0);

    // two contention answers remain; the next call absorbs them and succeeds
    let value = cache.get_or_create("k", || Counter::new("k")).unwrap();
    assert_eq!(value.get(), 0);
    assert_eq!(cache.size().unwrap(), 1);
}

#[test]
fn test_failed_page_out_keeps_entry_live() {
    let store = Arc::new(FlakyStore::new("counters", 0));
    let cache: IdentityCache<Counter> = IdentityCache::open(
        store.clone(),
        config(ReclamationStrategy::Manual).retry(fast_retry(2)),
    )
    .unwrap();
    let value = cache.get_or_create("k", || Counter::new("k")).unwrap();
    value.set(8);
    drop(value);

    store.fail_next(2);
    assert!(matches!(
        cache.page_out("k"),
        Err(CacheError::ContentionExhausted { .. })
    ));
    assert_eq!(cache.hot_len(), 1);
    assert_eq!(cache.stats().page_out_failures, 1);
    assert_eq!(cache.stats().dirty_entries, 1);
    assert_eq!(stored_value(store.inner(), "k"), Some(0));

    assert_eq!(
        cache.page_out("k").unwrap(),
        PageOutOutcome::PagedOut { persisted: true }
    );
    assert_eq!(stored_value(store.inner(), "k"), Some(8));
    assert_eq!(cache.get("k").unwrap().unwrap().get(), 8);
}

#[test]
fn test_displaced_write_failure_counted_when_page_out_fails() {
    let store = Arc::new(FlakyStore::new("counters", 0));
    let cache: IdentityCache<Counter> = IdentityCache::open(
        store.clone(),
        config(ReclamationStrategy::Manual)
            .max_dirty_entries(1)
            .retry(fast_retry(2)),
    )
    .unwrap();
    let k = cache.get_or_create("k", || Counter::new("k")).unwrap();
    let other = cache.get_or_create("o", || Counter::with_value("o", 3)).unwrap();
    k.set(8);
    drop(k);

    // k loses its tracker slot to o, and its write-through fails
    store.fail_next(2);
    assert!(matches!(
        cache.dirty_key("o"),
        Err(CacheError::ContentionExhausted { .. })
    ));
    assert_eq!(cache.stats().write_through_failures, 1);

    // k still persists on page-out; re-marking it displaces o, whose write fails too
    store.fail_next(4);
    assert!(matches!(
        cache.page_out("k"),
        Err(CacheError::ContentionExhausted { .. })
    ));
    let stats = cache.stats();
    assert_eq!(stats.page_out_failures, 1);
    assert_eq!(stats.write_through_failures, 2);
    assert_eq!(stored_value(store.inner(), "k"), Some(0));

    assert_eq!(
        cache.page_out("k").unwrap(),
        PageOutOutcome::PagedOut { persisted: true }
    );
    assert_eq!(stored_value(store.inner(), "k"), Some(8));
    drop(other);
}

#[test]
fn test_io_failure_closes_cache() {
    init_tracing();
    let store = Arc::new(FlakyStore::new("counters", 0));
    let cache: IdentityCache<Counter> =
        IdentityCache::open(store.clone(), config(ReclamationStrategy::Automatic)).unwrap();
    cache.get_or_create("k", || Counter::new("k")).unwrap().set(4);

    store.break_writes();
    assert!(matches!(
        cache.page_out("k"),
        Err(CacheError::Store(StoreError::Io(_)))
    ));
    assert!(!cache.is_open());
    assert!(matches!(cache.get("k"), Err(CacheError::Closed(_))));
    assert!(matches!(
        cache.get_or_create("fresh", || Counter::new("fresh")),
        Err(CacheError::Closed(_))
    ));
    assert!(matches!(cache.sync(), Err(CacheError::Closed(_))));
    assert_eq!(stored_value(store.inner(), "k"), Some(0));

    cache.close().unwrap();
    assert!(store.inner().is_closed());
}

#[test]
fn test_concurrent_manual_mutations_all_persisted() {
    const THREADS: usize = 4;
    const KEYS_PER_THREAD: usize = 8;
    const ROUNDS: u64 = 50;

    init_tracing();
    let (store, cache) = open_memory(
        config(ReclamationStrategy::Manual)
            .max_dirty_entries(1)
            .max_idle_entries(2),
    );
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let drainer = scope.spawn(|| {
            let mut turn = 0usize;
            while !done.load(Ordering::SeqCst) {
                cache.drain().unwrap();
                let key = format!("t{}k{}", turn % THREADS, turn % KEYS_PER_THREAD);
                cache.page_out(&key).unwrap();
                turn += 1;
            }
        });

        let mutators: Vec<_> = (0..THREADS)
            .map(|t| {
                let cache = &cache;
                scope.spawn(move || {
                    for _ in 0..ROUNDS {
                        for k in 0..KEYS_PER_THREAD {
                            let key = format!("t{}k{}", t, k);
                            let value = cache.get_or_create(&key, || Counter::new(&key)).unwrap();
                            value.increment();
                        }
                    }
                })
            })
            .collect();
        for mutator in mutators {
            mutator.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        drainer.join().unwrap();
    });

    cache.sync().unwrap();
    for t in 0..THREADS {
        for k in 0..KEYS_PER_THREAD {
            let key = format!("t{}k{}", t, k);
            assert_eq!(stored_value(store.as_ref(), &key), Some(ROUNDS), "{}", key);
        }
    }
    assert_eq!(cache.stats().page_out_failures, 0);
}
