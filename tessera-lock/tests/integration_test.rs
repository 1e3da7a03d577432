//! Integration tests for tessera-lock

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tessera_lock::*;

fn local(timeout: Duration) -> Arc<LocalLockManager> {
    Arc::new(LocalLockManager::new(
        LockConfig::default().with_timeout(timeout),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_acquisitions_serialize() {
    let locks = local(Duration::from_secs(2));
    let key = SectionKey::new("ses", "cart");

    let first = locks.acquire(&key, LockMode::Exclusive).await.unwrap();

    let waiter = {
        let locks = locks.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let handle = locks.acquire(&key, LockMode::Exclusive).await.unwrap();
            (started.elapsed(), handle.waited())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    locks.release(first).await.unwrap();

    let (elapsed, waited) = waiter.await.unwrap();
    assert!(elapsed >= Duration::from_millis(90));
    assert!(waited >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn test_exclusive_wait_bounded_by_timeout() {
    let locks = local(Duration::from_millis(100));
    let key = SectionKey::new("ses", "cart");

    let _held = locks.acquire(&key, LockMode::Exclusive).await.unwrap();

    let started = Instant::now();
    let err = locks.acquire(&key, LockMode::Exclusive).await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        LockError::Timeout { key, waited } => {
            assert_eq!(key, "ses/cart");
            assert!(waited >= Duration::from_millis(100));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(1));
}

#[tokio::test]
async fn test_explicit_timeout_overrides_default() {
    let locks = local(Duration::from_secs(30));
    let key = SectionKey::new("ses", "cart");

    let _held = locks.acquire(&key, LockMode::Shared).await.unwrap();
    let result = locks
        .acquire_timeout(&key, LockMode::Exclusive, Duration::from_millis(20))
        .await;
    assert!(result.unwrap_err().is_timeout());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    let locks = local(Duration::from_secs(5));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tokio::spawn(async move {
                let key = SectionKey::new("ses", "counter");
                let handle = locks.acquire(&key, LockMode::Exclusive).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                drop(handle);
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(locks.active_keys(), 0);
}

#[tokio::test]
async fn test_handle_released_on_error_path() {
    let locks = local(Duration::from_millis(50));
    let key = SectionKey::new("ses", "cart");

    async fn failing_request(locks: &LocalLockManager, key: &SectionKey) -> Result<(), String> {
        let _handle = locks
            .acquire(key, LockMode::Exclusive)
            .await
            .map_err(|e| e.to_string())?;
        Err("request aborted".to_string())
    }

    assert!(failing_request(&locks, &key).await.is_err());
    assert!(locks.acquire(&key, LockMode::Exclusive).await.is_ok());
}

#[tokio::test]
async fn test_lock_manager_as_trait_object() {
    let locks: Arc<dyn LockManager> = local(Duration::from_millis(50));
    assert_eq!(locks.backend(), "local");
    assert_eq!(locks.default_timeout(), Duration::from_millis(50));

    let key = SectionKey::new("ses", "prefs");
    let handle = locks.acquire(&key, LockMode::ReadOnly).await.unwrap();
    assert_eq!(handle.mode(), LockMode::ReadOnly);
    locks.release(handle).await.unwrap();
}

#[tokio::test]
async fn test_local_holds_never_lapse() {
    let locks = local(Duration::from_millis(50));
    let key = SectionKey::new("ses", "cart");

    for mode in [LockMode::Exclusive, LockMode::FirstComeFirstServed] {
        let handle = locks.acquire(&key, mode).await.unwrap();
        assert!(locks.renew(&handle).await.unwrap());
        locks.release(handle).await.unwrap();
    }
}

// Note: These tests require a running Redis server
// Run with: cargo test --features redis -- --ignored

#[cfg(feature = "redis")]
#[tokio::test]
#[ignore]
async fn test_redis_exclusive_lease() {
    let config = LockConfig::default()
        .with_namespace("tessera-test")
        .with_timeout(Duration::from_millis(200));
    let locks = RedisLockManager::connect("redis://localhost:6379", config)
        .await
        .unwrap();
    let key = SectionKey::new("ses", "cart");

    let held = locks.acquire(&key, LockMode::Exclusive).await.unwrap();
    assert!(locks.try_acquire(&key, LockMode::Shared).await.unwrap().is_none());
    locks.release(held).await.unwrap();

    let a = locks.acquire(&key, LockMode::Shared).await.unwrap();
    let b = locks.acquire(&key, LockMode::Shared).await.unwrap();
    assert!(locks.try_acquire(&key, LockMode::Exclusive).await.unwrap().is_none());
    locks.release(a).await.unwrap();
    locks.release(b).await.unwrap();
    assert!(locks.try_acquire(&key, LockMode::Exclusive).await.unwrap().is_some());
}

#[cfg(feature = "redis")]
#[tokio::test]
#[ignore]
async fn test_redis_lapsed_lease_is_not_renewed() {
    let config = LockConfig::default()
        .with_namespace("tessera-test")
        .with_timeout(Duration::from_millis(200))
        .with_lease_ttl(Duration::from_millis(100));
    let locks = RedisLockManager::connect("redis://localhost:6379", config)
        .await
        .unwrap();
    let key = SectionKey::new("ses", "lapse");

    let live = locks.acquire(&key, LockMode::Exclusive).await.unwrap();
    assert!(locks.renew(&live).await.unwrap());
    locks.release(live).await.unwrap();

    let stale = locks.acquire(&key, LockMode::Exclusive).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let thief = locks.acquire(&key, LockMode::Exclusive).await.unwrap();
    assert!(!locks.renew(&stale).await.unwrap());
    assert!(locks.renew(&thief).await.unwrap());
    locks.release(thief).await.unwrap();

    let reader = locks.acquire(&key, LockMode::Shared).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!locks.renew(&reader).await.unwrap());
}
