mod common;

use common::{Counter, config, init_tracing, open_memory, stored_value};
use oicache::cache::NotApplicable;
use oicache::{CacheRef, IdentityCacheable, PageOutOutcome, PersistentStore, ReclamationStrategy};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

#[test]
fn test_concurrent_get_or_create_single_instance() {
    init_tracing();
    let (_, cache) = open_memory(config(ReclamationStrategy::Manual));
    let constructed = AtomicUsize::new(0);
    let barrier = Barrier::new(50);

    let refs: Vec<CacheRef<Counter>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..50)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    cache
                        .get_or_create("host:example.com", || {
                            constructed.fetch_add(1, Ordering::SeqCst);
                            Counter::new("host:example.com")
                        })
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(constructed.load(Ordering::SeqCst), 1);
    assert!(refs.iter().all(|r| CacheRef::ptr_eq(r, &refs[0])));
    assert_eq!(cache.size().unwrap(), 1);
    assert_eq!(cache.stats().supplier_uses, 1);
}

#[test]
fn test_concurrent_creation_across_many_keys() {
    let (_, cache) = open_memory(config(ReclamationStrategy::Automatic).max_idle_entries(8));
    let constructed = AtomicUsize::new(0);

    thread::scope(|scope| {
        for worker in 0..8 {
            let cache = &cache;
            let constructed = &constructed;
            scope.spawn(move || {
                for round in 0..200 {
                    let key = format!("key-{}", (round * 7 + worker) % 64);
                    let value = cache
                        .get_or_create(&key, || {
                            constructed.fetch_add(1, Ordering::SeqCst);
                            Counter::new(&key)
                        })
                        .unwrap();
                    value.increment();
                }
            });
        }
    });

    assert_eq!(constructed.load(Ordering::SeqCst), 64);
    assert_eq!(cache.size().unwrap(), 64);
    cache.sync().unwrap();

    let total: u64 = cache
        .key_set()
        .unwrap()
        .iter()
        .map(|key| cache.get(key).unwrap().unwrap().get())
        .sum();
    assert_eq!(total, 8 * 200);
}

#[test]
fn test_readmission_promotes_persisted_value() {
    let (store, cache) = open_memory(config(ReclamationStrategy::Manual));
    let first = cache.get_or_create("k", || Counter::new("k")).unwrap();
    first.set(42);
    let first_generation = first.generation();
    drop(first);

    assert_eq!(
        cache.page_out("k").unwrap(),
        PageOutOutcome::PagedOut { persisted: true }
    );
    assert_eq!(cache.hot_len(), 0);
    assert_eq!(stored_value(store.as_ref(), "k"), Some(42));

    let promoted = cache
        .get_or_create("k", || panic!("stored key must be promoted, not created"))
        .unwrap();
    assert_eq!(promoted.get(), 42);
    assert!(promoted.generation() > first_generation);
    assert!(promoted.cache_link().is_attached());
    assert_eq!(cache.stats().disk_hits, 1);
}

#[test]
fn test_every_access_path_pins_the_instance() {
    let (store, cache) = open_memory(config(ReclamationStrategy::Manual));
    let original = cache.get_or_create("k", || Counter::new("k")).unwrap();
    let copy = original.clone();
    drop(original);

    assert_eq!(
        cache.page_out("k").unwrap(),
        PageOutOutcome::NotApplicable(NotApplicable::Held)
    );
    copy.set(3);
    let again = cache.get("k").unwrap().unwrap();
    assert!(CacheRef::ptr_eq(&copy, &again));
    assert_eq!(again.get(), 3);

    let generation = copy.generation();
    drop(copy);
    drop(again);
    assert_eq!(
        cache.page_out("k").unwrap(),
        PageOutOutcome::PagedOut { persisted: true }
    );
    assert_eq!(stored_value(store.as_ref(), "k"), Some(3));
    assert!(cache.get("k").unwrap().unwrap().generation() > generation);
}

#[test]
fn test_get_promotes_but_never_creates() {
    let (store, cache) = open_memory(config(ReclamationStrategy::Manual));
    assert!(cache.get("absent").unwrap().is_none());
    assert_eq!(store.len().unwrap(), 0);

    let raw = rmp_serde::to_vec_named(&Counter::with_value("seeded", 5)).unwrap();
    store.put("seeded", raw).unwrap();
    let seeded = cache.get("seeded").unwrap().unwrap();
    assert_eq!(seeded.get(), 5);
    assert!(CacheRef::ptr_eq(&seeded, &cache.get("seeded").unwrap().unwrap()));
}

#[test]
fn test_key_set_matches_created_keys() {
    let (_, cache) = open_memory(config(ReclamationStrategy::Automatic).max_idle_entries(10));
    let mut created = BTreeSet::new();
    for i in 0..100 {
        let key = format!("host-{:03}", i);
        drop(cache.get_or_create(&key, || Counter::new(&key)).unwrap());
        created.insert(key);
        if i % 10 == 0 {
            cache.drain().unwrap();
        }
    }
    // absent keys looked up with get do not appear
    assert!(cache.get("never-created").unwrap().is_none());

    let keys: BTreeSet<String> = cache.key_set().unwrap().into_iter().collect();
    assert_eq!(keys, created);
}

#[test]
fn test_ten_thousand_keys_half_paged_out() {
    let (store, cache) = open_memory(config(ReclamationStrategy::Manual).max_idle_entries(20_000));

    let mut held = Vec::new();
    for i in 0..10_000u64 {
        let key = format!("k{:05}", i);
        let value = cache.get_or_create(&key, || Counter::new(&key)).unwrap();
        value.set(i);
        if i % 2 == 0 {
            held.push(value);
        }
    }
    cache.sync().unwrap();

    for i in (1..10_000u64).step_by(2) {
        let key = format!("k{:05}", i);
        assert!(matches!(
            cache.page_out(&key).unwrap(),
            PageOutOutcome::PagedOut { .. }
        ));
    }
    assert_eq!(cache.hot_len(), 5_000);

    assert_eq!(cache.size().unwrap(), 10_000);
    let keys = cache.key_set().unwrap();
    assert_eq!(keys.len(), 10_000);
    assert_eq!(keys.iter().collect::<BTreeSet<_>>().len(), 10_000);
    assert_eq!(store.durable_len(), 10_000);

    for (i, key) in keys.iter().enumerate() {
        assert_eq!(cache.get(key).unwrap().unwrap().get(), i as u64);
    }
    drop(held);
}
