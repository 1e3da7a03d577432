//! End-to-end session workflows.
//!
//! Each test simulates a series of requests sharing one session, with one
//! `Session` per request and requests running as concurrent tasks.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tessera::prelude::*;

// =============================================================================
// Helpers
// =============================================================================

fn manager(lock_timeout: Duration) -> SessionManager {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tessera_session=info")
        .with_test_writer()
        .try_init();
    SessionManager::in_memory(SessionConfig::default().with_lock_timeout(lock_timeout)).unwrap()
}

/// First request of a visitor: start a session and hand out its id.
async fn first_request(manager: &SessionManager) -> String {
    let mut session = manager.session();
    let id = session.start(None).await.unwrap().to_string();
    assert!(session.is_new());
    session.save().await.unwrap();
    id
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    hits: u64,
}

// =============================================================================
// Locking Workflows
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_requests_lose_no_updates() {
    let manager = manager(Duration::from_secs(10));
    let id = first_request(&manager).await;

    let requests: Vec<_> = (0..20)
        .map(|_| {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut session = manager.session();
                session.start(Some(&id)).await.unwrap();
                let mut counter: Counter = session
                    .named_section("counter", LockMode::Exclusive)
                    .await
                    .unwrap();
                counter.hits += 1;
                tokio::task::yield_now().await;
                session.store_named_section("counter", &counter).await.unwrap();
                assert!(session.save().await.unwrap().is_success());
            })
        })
        .collect();

    for result in futures::future::join_all(requests).await {
        result.unwrap();
    }

    let mut session = manager.session();
    session.start(Some(&id)).await.unwrap();
    let counter: Counter = session
        .named_section("counter", LockMode::ReadOnly)
        .await
        .unwrap();
    assert_eq!(counter.hits, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_come_first_served_retry_converges() {
    let manager = manager(Duration::from_secs(1));
    let id = first_request(&manager).await;

    let requests: Vec<_> = (0..10)
        .map(|_| {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut session = manager.session();
                session.start(Some(&id)).await.unwrap();
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    let counter: Counter = session
                        .named_section("counter", LockMode::FirstComeFirstServed)
                        .await
                        .unwrap();
                    let next = Counter {
                        hits: counter.hits + 1,
                    };
                    if session.save_named_section("counter", &next).await.unwrap() {
                        break;
                    }
                }
                session.save().await.unwrap();
                attempts
            })
        })
        .collect();

    let mut attempts = 0;
    for result in futures::future::join_all(requests).await {
        attempts += result.unwrap();
    }
    assert!(attempts >= 10);

    let mut session = manager.session();
    session.start(Some(&id)).await.unwrap();
    let counter: Counter = session
        .named_section("counter", LockMode::ReadOnly)
        .await
        .unwrap();
    assert_eq!(counter.hits, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_holders_run_concurrently() {
    let manager = manager(Duration::from_millis(200));
    let id = first_request(&manager).await;

    // Ten readers hold the same section at once without waiting on each other
    let mut sessions = Vec::new();
    for _ in 0..10 {
        let mut session = manager.session();
        session.start(Some(&id)).await.unwrap();
        session
            .get_named_section("catalog", LockMode::Shared)
            .await
            .unwrap();
        sessions.push(session);
    }

    // An exclusive writer has to wait for all of them
    let mut writer = manager.session();
    writer.start(Some(&id)).await.unwrap();
    let err = writer
        .get_named_section("catalog", LockMode::Exclusive)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::LockTimeout { .. }));

    for mut session in sessions {
        session.save().await.unwrap();
    }
    assert!(
        writer
            .get_named_section("catalog", LockMode::Exclusive)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_aborted_request_releases_locks() {
    let manager = manager(Duration::from_millis(100));
    let id = first_request(&manager).await;

    {
        let mut session = manager.session();
        session.start(Some(&id)).await.unwrap();
        session
            .get_named_section("cart", LockMode::Exclusive)
            .await
            .unwrap()
            .insert("draft".into(), json!(true));
        // Request handler bails out without saving
    }

    let mut session = manager.session();
    session.start(Some(&id)).await.unwrap();
    let cart = session
        .get_named_section("cart", LockMode::Exclusive)
        .await
        .unwrap();
    assert!(cart.is_empty());
}

// =============================================================================
// Authentication Workflows
// =============================================================================

#[tokio::test]
async fn test_login_logout_across_requests() {
    let manager = manager(Duration::from_secs(1));
    let id = first_request(&manager).await;

    let mut login = manager.session();
    login.start(Some(&id)).await.unwrap();
    let anonymous_token = login.session_token().unwrap().to_string();
    login.login(12).unwrap();
    login.save().await.unwrap();

    let mut browse = manager.session();
    browse.start(Some(&id)).await.unwrap();
    assert_eq!(browse.usr_id(), Some(12));
    assert_ne!(browse.session_token().unwrap(), anonymous_token);
    let csrf = browse.csrf_token().unwrap().to_string();
    browse.save().await.unwrap();

    let mut logout = manager.session();
    logout.start(Some(&id)).await.unwrap();
    assert!(logout.verify_csrf_token(&csrf));
    logout.logout().unwrap();
    logout.save().await.unwrap();

    let mut after = manager.session();
    assert_eq!(after.start(Some(&id)).await.unwrap(), id);
    assert!(after.is_anonymous());
    assert!(!after.verify_csrf_token(&csrf));
}

#[tokio::test]
async fn test_logout_everywhere() {
    let manager = manager(Duration::from_secs(1));

    let mut devices = Vec::new();
    for _ in 0..3 {
        let mut session = manager.session();
        devices.push(session.start(None).await.unwrap().to_string());
        session.login(77).unwrap();
        session.save().await.unwrap();
    }

    let mut phone = manager.session();
    phone.start(Some(&devices[0])).await.unwrap();
    assert_eq!(phone.destroy_all_sessions().await.unwrap(), 3);
    assert_eq!(phone.state(), SessionState::Destroyed);

    for old in &devices {
        let mut session = manager.session();
        session.start(Some(old)).await.unwrap();
        assert!(session.is_new());
        assert!(session.is_anonymous());
    }
}

#[tokio::test]
async fn test_concurrent_request_sees_destroyed_session() {
    let manager = manager(Duration::from_secs(1));
    let id = first_request(&manager).await;

    let mut slow = manager.session();
    slow.start(Some(&id)).await.unwrap();
    slow.set_has_flash_message(true).unwrap();

    let mut admin = manager.session();
    admin.start(Some(&id)).await.unwrap();
    admin.destroy_all_sessions().await.unwrap();

    // The slow request cannot bring the session back
    assert!(matches!(slow.save().await, Err(SessionError::NotFound(_))));
    let mut next = manager.session();
    assert_ne!(next.start(Some(&id)).await.unwrap(), id);
}
