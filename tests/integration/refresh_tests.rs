//! Token refresh integration tests.
//!
//! Single-flight coordination across concurrent 401s, failure handling and
//! the retry-once rule.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use reqwest::StatusCode;
use testhub::{ApiError, ApiRequest, ClientEvent, MemoryStorage, Session};
use tokio::task::JoinSet;

use crate::common::{RefreshMode, manager, spawn_backend};

const CONCURRENT_CALLS: usize = 8;

#[tokio::test]
async fn test_expired_token_is_refreshed_and_call_retried() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager
        .store()
        .set_session(&Session::new("t1", 5).with_refresh_token("r1"))
        .unwrap();

    let response = manager.api().get("/x").await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let requests = backend.state.requests_to("/x");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer t1"));
    assert_eq!(requests[1].authorization.as_deref(), Some("Bearer t2"));

    let session = manager.store().get_session().unwrap();
    assert_eq!(session.token, "t2");
    assert_eq!(session.refresh_token.as_deref(), Some("r2"));
    assert_eq!(session.user_id, 5);
    assert_eq!(*backend.state.refresh_tokens_seen.lock().unwrap(), vec!["r1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unauthorized_calls_share_one_refresh() {
    let backend = spawn_backend().await;
    backend
        .state
        .hold_refresh_until
        .store(CONCURRENT_CALLS, Ordering::SeqCst);
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager
        .store()
        .set_session(&Session::new("t1", 5).with_refresh_token("r1"))
        .unwrap();

    let mut calls = JoinSet::new();
    for _ in 0..CONCURRENT_CALLS {
        let api = manager.api().clone();
        calls.spawn(async move { api.get("/x").await });
    }

    while let Some(result) = calls.join_next().await {
        let response = result.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(backend.state.refresh_calls(), 1);

    let requests = backend.state.requests_to("/x");
    assert_eq!(requests.len(), CONCURRENT_CALLS * 2);
    let with_old = requests
        .iter()
        .filter(|r| r.authorization.as_deref() == Some("Bearer t1"))
        .count();
    let with_new = requests
        .iter()
        .filter(|r| r.authorization.as_deref() == Some("Bearer t2"))
        .count();
    assert_eq!(with_old, CONCURRENT_CALLS);
    assert_eq!(with_new, CONCURRENT_CALLS);

    assert_eq!(manager.store().token().as_deref(), Some("t2"));
    assert!(!manager.api().refresher().is_refreshing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_refresh_invalidates_every_waiting_call() {
    let backend = spawn_backend().await;
    backend.state.set_refresh_mode(RefreshMode::Reject);
    backend
        .state
        .hold_refresh_until
        .store(CONCURRENT_CALLS, Ordering::SeqCst);
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager
        .store()
        .set_session(&Session::new("t1", 5).with_refresh_token("r1"))
        .unwrap();
    let mut events = manager.events().subscribe();

    let mut calls = JoinSet::new();
    for _ in 0..CONCURRENT_CALLS {
        let api = manager.api().clone();
        calls.spawn(async move { api.get("/x").await });
    }

    while let Some(result) = calls.join_next().await {
        assert!(matches!(result.unwrap(), Err(ApiError::SessionInvalidated)));
    }

    assert_eq!(backend.state.refresh_calls(), 1);
    assert_eq!(
        backend.state.requests_to("/x").len(),
        CONCURRENT_CALLS,
        "no call is retried after a failed refresh"
    );
    assert!(manager.store().get_session().is_none());

    assert_eq!(events.try_recv().unwrap(), ClientEvent::SessionInvalidated);
    assert!(events.try_recv().is_err(), "invalidation is announced once");
}

#[tokio::test]
async fn test_missing_refresh_token_invalidates_without_refresh_call() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager.store().set_session(&Session::new("t1", 5)).unwrap();
    let mut events = manager.events().subscribe();

    let result = manager.api().get("/x").await;

    assert!(matches!(result, Err(ApiError::SessionInvalidated)));
    assert_eq!(backend.state.refresh_calls(), 0);
    assert!(manager.store().get_session().is_none());
    assert_eq!(events.try_recv().unwrap(), ClientEvent::SessionInvalidated);
}

#[tokio::test]
async fn test_unauthorized_retry_is_final() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager
        .store()
        .set_session(&Session::new("t1", 5).with_refresh_token("r1"))
        .unwrap();

    let response = manager.api().get("/always-401").await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend.state.refresh_calls(), 1);

    let requests = backend.state.requests_to("/always-401");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].authorization.as_deref(), Some("Bearer t2"));

    // The refresh itself succeeded, so the session survives.
    assert_eq!(manager.store().token().as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_every_method_follows_the_same_recovery() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    let body = serde_json::json!({ "status": "passed" });

    let requests = vec![
        ApiRequest::get("/test-execution"),
        ApiRequest::post("/test-execution").json(&body).unwrap(),
        ApiRequest::put("/test-execution").json(&body).unwrap(),
        ApiRequest::patch("/test-execution").json(&body).unwrap(),
        ApiRequest::delete("/test-execution"),
    ];

    for request in requests {
        let method = request.method.clone();
        manager
            .store()
            .set_session(&Session::new("t1", 5).with_refresh_token("r1"))
            .unwrap();

        let response = manager.api().send(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK, "{} was not recovered", method);
        let echoed: serde_json::Value = response.json().unwrap();
        assert_eq!(echoed["method"], method.as_str());
    }

    assert_eq!(backend.state.refresh_calls(), 5);
    assert_eq!(backend.state.requests_to("/test-execution").len(), 10);
}

#[tokio::test]
async fn test_refresh_slot_is_reusable_after_settling() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager
        .store()
        .set_session(&Session::new("t1", 5).with_refresh_token("r1"))
        .unwrap();

    manager.api().get("/x").await.unwrap();
    assert_eq!(backend.state.refresh_calls(), 1);

    // The rotated token expires as well: a second, separate refresh happens.
    backend.state.valid_tokens.lock().unwrap().clear();
    backend.state.set_refresh_mode(RefreshMode::Rotate {
        token: "t3".to_string(),
        refresh_token: "r3".to_string(),
    });

    let response = manager.api().get("/x").await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.state.refresh_calls(), 2);
    assert_eq!(
        *backend.state.refresh_tokens_seen.lock().unwrap(),
        vec!["r1", "r2"]
    );
    assert_eq!(manager.store().token().as_deref(), Some("t3"));
}
