//  Copyright 2026 Magpie Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use magpie::{
    Cache, CacheBuilder, ComposeError, Error, IdentitySet, ManualClock, Policy, RefreshDriver,
};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

#[test]
fn test_basic_operations() {
    let cache = CacheBuilder::<i32, String>::new().build().unwrap();

    cache.emplace(1, "one".to_string()).unwrap();
    cache.emplace(2, "two".to_string()).unwrap();

    assert_eq!(cache.get(&1).unwrap(), Some("one".to_string()));
    assert_eq!(cache.get(&3).unwrap(), None);
    assert_eq!(cache.len(), 2);

    cache.erase(&1);
    assert_eq!(cache.get(&1).unwrap(), None);
    assert_eq!(cache.get(&2).unwrap(), Some("two".to_string()));

    cache.clear();
    assert_eq!(cache.get(&2).unwrap(), None);
    assert!(cache.is_empty());
}

#[test]
fn test_emplace_replaces() {
    let cache = CacheBuilder::<i32, String>::new().build().unwrap();

    cache.emplace(1, "one".to_string()).unwrap();
    cache.emplace(1, "uno".to_string()).unwrap();

    assert_eq!(cache.get(&1).unwrap(), Some("uno".to_string()));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_get_or_emplace_keeps_existing() {
    let cache = CacheBuilder::<i32, String>::new().build().unwrap();

    let made = Arc::new(AtomicUsize::new(0));
    let make = {
        let made = made.clone();
        move || {
            made.fetch_add(1, Ordering::SeqCst);
            "fresh".to_string()
        }
    };

    assert_eq!(cache.get_or_emplace(1, make.clone()).unwrap(), "fresh");
    assert_eq!(made.load(Ordering::SeqCst), 1);

    // The live value wins; the constructor is not consulted again.
    assert_eq!(cache.get_or_emplace(1, make).unwrap(), "fresh");
    assert_eq!(made.load(Ordering::SeqCst), 1);
}

#[test]
fn test_get_if_exists_fires_no_events() {
    let cache = CacheBuilder::<i32, String>::new().build().unwrap();
    cache.emplace(1, "one".to_string()).unwrap();

    assert_eq!(cache.get_if_exists(&1).unwrap(), Some("one".to_string()));
    assert_eq!(cache.get_if_exists(&2).unwrap(), None);
    assert_eq!(cache.metrics().hit(), 0);
    assert_eq!(cache.metrics().miss(), 0);
}

#[test]
fn test_sync_resolver() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = calls.clone();
        CacheBuilder::<usize, String>::new()
            .with_error_type::<String>()
            .with_resolver(move |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("x".repeat(*n))
            })
            .build()
            .unwrap()
    };

    assert_eq!(cache.get(&3).unwrap(), Some("xxx".to_string()));
    assert_eq!(cache.get(&4).unwrap(), Some("xxxx".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Resolved values are cached.
    assert_eq!(cache.get(&3).unwrap(), Some("xxx".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_resolver_errors_are_not_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = calls.clone();
        CacheBuilder::<usize, String>::new()
            .with_error_type::<String>()
            .with_resolver(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .build()
            .unwrap()
    };

    assert!(matches!(cache.get(&7), Err(Error::Resolver(e)) if e == "boom"));
    assert!(matches!(cache.get(&7), Err(Error::Resolver(_))));
    // Both lookups re-invoked the resolver.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 0);
}

#[test]
fn test_negative_cache_retains_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = calls.clone();
        CacheBuilder::<usize, String>::new()
            .with_error_type::<String>()
            .with_negative_cache()
            .with_resolver(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .build()
            .unwrap()
    };

    assert!(matches!(cache.get(&7), Err(Error::Resolver(_))));
    assert!(matches!(cache.get(&7), Err(Error::Resolver(_))));
    // The second lookup was served from the cached negative.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_single_flight() {
    const WAITERS: usize = 16;

    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = calls.clone();
        CacheBuilder::<usize, String>::new()
            .with_error_type::<String>()
            .with_resolver(move |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                Ok("x".repeat(*n))
            })
            .build()
            .unwrap()
    };

    let barrier = Arc::new(std::sync::Barrier::new(WAITERS));
    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                cache.get(&3).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some("xxx".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_max_size_bounds_entry_count() {
    let cache = CacheBuilder::<u32, String>::new()
        .with_max_size(5)
        .build()
        .unwrap();

    for key in 0..5 {
        cache.emplace(key, "bla".to_string()).unwrap();
    }
    assert_eq!(cache.len(), 5);

    for key in 5..10 {
        cache.emplace(key, "bla".to_string()).unwrap();
        assert_eq!(cache.len(), 5);
    }
    assert!(cache.metrics().evict() >= 5);
}

#[test]
fn test_weaken_keeps_live_pointers_reachable() {
    let cache = CacheBuilder::<u32, Arc<u32>>::new()
        .weaken_evicted()
        .with_max_size(2)
        .build()
        .unwrap();

    let held = Arc::new(1u32);
    cache.emplace(1, held.clone()).unwrap();

    let churn = |base: u32| {
        for key in base..base + 4 {
            cache.emplace(key, Arc::new(key)).unwrap();
            cache.get(&key).unwrap();
            cache.get(&key).unwrap();
        }
    };

    // Push entry 1 out through the cold end of the queue.
    churn(10);
    assert!(cache.metrics().weaken() >= 1);

    // Evicted to the weak state, but the pointee is externally alive.
    let got = cache.get(&1).unwrap().expect("held pointer stays reachable");
    assert!(Arc::ptr_eq(&got, &held));
    drop(got);

    // Once the last owner is gone the entry cannot be revived.
    drop(held);
    churn(20);
    assert_eq!(cache.get(&1).unwrap(), None);
}

#[test]
fn test_max_age_with_manual_clock() {
    let clock = Arc::new(ManualClock::new());
    let cache = CacheBuilder::<i32, String>::new()
        .with_clock(clock.clone())
        .with_max_age(Duration::from_secs(10))
        .build()
        .unwrap();

    clock.set(Duration::from_secs(0));
    cache.emplace(3, "three".to_string()).unwrap();

    clock.set(Duration::from_secs(1));
    assert_eq!(cache.get(&3).unwrap(), Some("three".to_string()));

    clock.set(Duration::from_millis(9_999));
    assert_eq!(cache.get(&3).unwrap(), Some("three".to_string()));

    clock.set(Duration::from_secs(10));
    assert_eq!(cache.get(&3).unwrap(), None);

    clock.set(Duration::from_secs(11));
    assert_eq!(cache.get(&3).unwrap(), None);
    assert!(cache.is_empty());
}

#[test]
fn test_max_error_age_expires_negatives() {
    let clock = Arc::new(ManualClock::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = calls.clone();
        CacheBuilder::<usize, String>::new()
            .with_error_type::<String>()
            .with_clock(clock.clone())
            .with_max_error_age(Duration::from_secs(5))
            .with_resolver(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .build()
            .unwrap()
    };

    assert!(matches!(cache.get(&1), Err(Error::Resolver(_))));
    clock.set(Duration::from_secs(1));
    assert!(matches!(cache.get(&1), Err(Error::Resolver(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The negative aged out; the next lookup resolves again.
    clock.set(Duration::from_secs(5));
    assert!(matches!(cache.get(&1), Err(Error::Resolver(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn sequence_resolver(
    values: &[&str],
) -> (
    Arc<AtomicUsize>,
    impl Fn(&i32) -> Result<String, String> + Send + Sync + 'static,
) {
    let calls = Arc::new(AtomicUsize::new(0));
    let queue = Mutex::new(
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<VecDeque<_>>(),
    );
    let counter = calls.clone();
    let resolve = move |_key: &i32| {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut queue = queue.lock().unwrap();
        let value = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        };
        Ok(value)
    };
    (calls, resolve)
}

#[test_log::test]
fn test_refresh_produces_new_values() {
    let (calls, resolve) = sequence_resolver(&["first", "refresh_1", "refresh_2"]);
    let cache = CacheBuilder::<i32, String>::new()
        .with_error_type::<String>()
        .with_resolver(resolve)
        .with_refresh(Duration::from_millis(150))
        .build()
        .unwrap();

    assert_eq!(cache.get(&3).unwrap(), Some("first".to_string()));

    // Well before the deadline the original value is served.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(cache.get(&3).unwrap(), Some("first".to_string()));

    // Past the deadline a value from a later resolver invocation is served.
    std::thread::sleep(Duration::from_millis(400));
    let refreshed = cache.get(&3).unwrap().unwrap();
    assert!(refreshed.starts_with("refresh_"), "got {refreshed}");
    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[test_log::test]
fn test_refresh_idle_timer_drops_unread_entries() {
    let (_calls, resolve) = sequence_resolver(&["value"]);
    let cache = CacheBuilder::<i32, String>::new()
        .with_error_type::<String>()
        .with_resolver(resolve)
        .with_refresh_idle(Duration::from_millis(80), Duration::from_millis(200))
        .build()
        .unwrap();

    assert_eq!(cache.get(&3).unwrap(), Some("value".to_string()));

    // Unread past the idle deadline: the next refresh tick cancels it.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(cache.get_if_exists(&3).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timer_refresh_driver() {
    let (calls, resolve) = sequence_resolver(&["first", "refresh_1"]);
    let cache = CacheBuilder::<i32, String>::new()
        .with_error_type::<String>()
        .with_resolver(resolve)
        .with_refresh(Duration::from_millis(100))
        .with_refresh_driver(RefreshDriver::Timer(tokio::runtime::Handle::current()))
        .build()
        .unwrap();

    assert_eq!(cache.get(&3).unwrap(), Some("first".to_string()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cache.get(&3).unwrap(), Some("refresh_1".to_string()));
    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_get_hit_and_absent() {
    let cache = CacheBuilder::<i32, String>::new().build().unwrap();
    cache.emplace(1, "one".to_string()).unwrap();

    assert_eq!(cache.async_get(&1).await.unwrap(), Some("one".to_string()));
    assert_eq!(cache.async_get(&2).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_resolver_single_flight() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = calls.clone();
        CacheBuilder::<i32, String>::new()
            .with_error_type::<String>()
            .with_async_resolver(move |mut handle, key| {
                calls.fetch_add(1, Ordering::SeqCst);
                let key = *key;
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    handle.assign(format!("value_{key}")).unwrap();
                });
            })
            .build()
            .unwrap()
    };

    let a = cache.async_get(&3);
    let b = cache.async_get(&3);

    let (a, b) = tokio::join!(a, b);
    assert_eq!(a.unwrap(), Some("value_3".to_string()));
    assert_eq!(b.unwrap(), Some("value_3".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Now cached; no further resolver invocation.
    assert_eq!(cache.async_get(&3).await.unwrap(), Some("value_3".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_resolver_error_reaches_all_waiters() {
    let cache = CacheBuilder::<i32, String>::new()
        .with_error_type::<String>()
        .with_async_resolver(move |mut handle, _key| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                handle.assign_error("nope".to_string()).unwrap();
            });
        })
        .build()
        .unwrap();

    let a = cache.async_get(&3);
    let b = cache.async_get(&3);

    let (a, b) = tokio::join!(a, b);
    assert!(matches!(a, Err(Error::Resolver(e)) if e == "nope"));
    assert!(matches!(b, Err(Error::Resolver(e)) if e == "nope"));

    // Errors are not cached; the entry is gone.
    assert_eq!(cache.get_if_exists(&3).unwrap(), None);
    assert_eq!(cache.len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropping_cache_cancels_pending_resolves() {
    let cache = CacheBuilder::<i32, String>::new()
        .with_error_type::<String>()
        .with_async_resolver(|handle, _key| {
            // Never completes; the handle outlives the cache.
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                drop(handle);
            });
        })
        .build()
        .unwrap();

    let waiter = cache.async_get(&1);
    drop(cache);

    assert!(matches!(waiter.await, Err(Error::Cancelled)));
}

#[test]
fn test_erase_during_resolve_delivers_but_does_not_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = calls.clone();
        CacheBuilder::<i32, String>::new()
            .with_error_type::<String>()
            .with_resolver(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                Ok("slow".to_string())
            })
            .build()
            .unwrap()
    };

    let resolving = {
        let cache = cache.clone();
        std::thread::spawn(move || cache.get(&1).unwrap())
    };

    // Wait for the resolver to start, then erase the key out from under it.
    while calls.load(Ordering::SeqCst) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    cache.erase(&1);

    // The waiter that joined before the erase still gets the outcome.
    assert_eq!(resolving.join().unwrap(), Some("slow".to_string()));

    // The outcome was not cached; a later lookup resolves again.
    assert_eq!(cache.get(&1).unwrap(), Some("slow".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_thread_unsafe_cache() {
    let cache = CacheBuilder::<i32, String>::new()
        .thread_unsafe()
        .with_max_size(2)
        .build()
        .unwrap();

    cache.emplace(1, "one".to_string()).unwrap();
    cache.emplace(2, "two".to_string()).unwrap();
    cache.emplace(3, "three".to_string()).unwrap();
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_conflicting_policies_fail_composition() {
    let result = CacheBuilder::<i32, String>::new()
        .with_policy(Policy::MaxSize(3))
        .with_policy(Policy::MaxSize(4))
        .build();
    assert!(matches!(result, Err(ComposeError::ConflictingOptions)));

    let result = CacheBuilder::<i32, String>::new()
        .with_policy(Policy::Refresh(magpie::RefreshConfig::new(
            Duration::from_secs(1),
        )))
        .build();
    assert!(matches!(result, Err(ComposeError::RefreshWithoutResolver)));
}

#[test]
fn test_identity_set() {
    let set = IdentitySet::<String>::new();

    let a = set.insert("shared".to_string()).unwrap();
    let b = set.insert("shared".to_string()).unwrap();
    assert_eq!(a, b);
    assert_eq!(set.len(), 1);

    assert_eq!(set.get(&"shared".to_string()), Some("shared".to_string()));
    assert_eq!(set.get(&"absent".to_string()), None);

    set.erase(&"shared".to_string());
    assert_eq!(set.get(&"shared".to_string()), None);
    assert!(set.is_empty());

    set.insert("again".to_string()).unwrap();
    set.clear();
    assert!(set.is_empty());
}

#[test]
fn test_fuzzy_bounded_cache() {
    const CAPACITY: usize = 256;

    let builder: CacheBuilder<u64, u64> = CacheBuilder::new().with_max_size(CAPACITY);
    let cache: Cache<u64, u64> = builder.build().unwrap();

    let mut rng = SmallRng::seed_from_u64(114514);
    for _ in 0..100_000 {
        let key = rng.next_u64() % 1024;
        if let Some(value) = cache.get(&key).unwrap() {
            assert_eq!(value, key);
            continue;
        }
        cache.emplace(key, key).unwrap();
        assert!(cache.len() <= CAPACITY);
    }
}

#[test]
fn test_fuzzy_unbounded_with_erase() {
    let builder: CacheBuilder<u64, u64> = CacheBuilder::new();
    let cache: Cache<u64, u64> = builder.build().unwrap();

    let mut rng = SmallRng::seed_from_u64(42);
    for round in 0..50_000u64 {
        let key = rng.next_u64() % 512;
        match round % 3 {
            0 => cache.emplace(key, key).unwrap(),
            1 => {
                if let Some(value) = cache.get(&key).unwrap() {
                    assert_eq!(value, key);
                }
            }
            _ => cache.erase(&key),
        }
    }
}
