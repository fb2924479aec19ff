//! Request wrapper integration tests.
//!
//! Bearer attachment, header precedence, 402 signalling, pass-through of
//! other statuses, transport failures and timeouts.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use testhub::{
    ApiError, ApiRequest, BillingLimit, ClientConfig, ClientEvent, MemoryStorage, Session,
    SessionManager,
};

use crate::common::{config_for, manager, spawn_backend};

#[tokio::test]
async fn test_attaches_bearer_token() {
    let backend = spawn_backend().await;
    backend.state.allow_token("t1");
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager.store().set_session(&Session::new("t1", 5)).unwrap();

    let response = manager.api().get("/x").await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["ok"], true);

    let requests = backend.state.requests_to("/x");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer t1"));
    assert_eq!(backend.state.refresh_calls(), 0);
}

#[tokio::test]
async fn test_caller_headers_never_replace_authorization() {
    let backend = spawn_backend().await;
    backend.state.allow_token("t1");
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager.store().set_session(&Session::new("t1", 5)).unwrap();

    let request = ApiRequest::get("/x")
        .header(AUTHORIZATION, HeaderValue::from_static("Bearer forged"))
        .header(HeaderName::from_static("x-client"), HeaderValue::from_static("cli"));
    let response = manager.api().send(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let recorded = &backend.state.requests_to("/x")[0];
    assert_eq!(recorded.authorization.as_deref(), Some("Bearer t1"));
    assert_eq!(recorded.client_header.as_deref(), Some("cli"));
}

#[tokio::test]
async fn test_payment_required_signals_billing_limit_once() {
    let backend = spawn_backend().await;
    backend.state.allow_token("t1");
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager.store().set_session(&Session::new("t1", 5)).unwrap();
    let mut events = manager.events().subscribe();

    let response = manager
        .api()
        .post("/quota", &serde_json::json!({ "name": "Checkout flow" }))
        .await
        .unwrap();

    // The response reaches the caller unchanged.
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(
        body,
        serde_json::json!({ "metric": "testCases", "limit": 100, "current": 100 })
    );

    assert_eq!(
        events.try_recv().unwrap(),
        ClientEvent::BillingLimitReached(BillingLimit {
            metric: Some("testCases".to_string()),
            limit: Some(100.0),
            current: Some(100.0),
        })
    );
    assert!(events.try_recv().is_err(), "exactly one billing event");

    // Not retried.
    assert_eq!(backend.state.requests_to("/quota").len(), 1);
    assert_eq!(backend.state.refresh_calls(), 0);
}

#[tokio::test]
async fn test_other_errors_pass_through() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager.store().set_session(&Session::new("t1", 5)).unwrap();
    let mut events = manager.events().subscribe();

    let response = manager.api().get("/broken").await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text(), "boom");
    assert!(matches!(
        response.error_for_status(),
        Err(ApiError::Status { status, .. }) if status == StatusCode::INTERNAL_SERVER_ERROR
    ));
    assert_eq!(backend.state.requests_to("/broken").len(), 1);
    assert!(events.try_recv().is_err());
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn test_not_found_route_passes_through() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager.store().set_session(&Session::new("t1", 5)).unwrap();

    let response = manager.api().delete("/template/42").await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(backend.state.refresh_calls(), 0);
}

#[tokio::test]
async fn test_transport_failure_is_an_error_without_retry() {
    let storage = Arc::new(MemoryStorage::new());
    // Nothing listens on the discard port.
    let config = ClientConfig::default()
        .with_base_url("http://127.0.0.1:9")
        .with_connect_timeout(Duration::from_secs(2));
    let manager = SessionManager::new(config, storage).unwrap();
    manager.store().set_session(&Session::new("t1", 5)).unwrap();

    let result = manager.api().get("/x").await;

    let error = result.unwrap_err();
    assert!(error.is_transport(), "unexpected error: {}", error);
    assert!(manager.is_authenticated(), "transport failures keep the session");
}

#[tokio::test]
async fn test_requests_time_out() {
    let backend = spawn_backend().await;
    let config = config_for(&backend).with_request_timeout(Duration::from_millis(200));
    let manager = SessionManager::new(config, Arc::new(MemoryStorage::new())).unwrap();
    manager.store().set_session(&Session::new("t1", 5)).unwrap();

    let result = manager.api().get("/slow").await;

    assert!(matches!(result, Err(ApiError::Transport(ref e)) if e.is_timeout()));
}

#[tokio::test]
async fn test_get_json_requires_success() {
    let backend = spawn_backend().await;
    let manager = manager(&backend, Arc::new(MemoryStorage::new()));
    manager.store().set_session(&Session::new("t1", 5)).unwrap();

    let result: Result<serde_json::Value, _> = manager.api().get_json("/broken").await;

    assert!(matches!(result, Err(ApiError::Status { .. })));
}
