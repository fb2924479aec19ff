//! Token-aware request wrapper.
//!
//! HTTP-level failures are never errors here: every call that produced a
//! response returns it, whatever the status. `Err` is reserved for
//! transport failures and for a session that could not be recovered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::Instrument;

use crate::error::{ApiError, ApiResult};
use crate::events::{BillingLimit, ClientEvent, EventBus};
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::session::SessionStore;
use crate::transport::{ApiRequest, ApiResponse, HttpClient, format_latency};

/// Lifecycle of one call. `Retried` always leads to `Final`, so a call is
/// re-issued at most once.
enum CallState {
    Attempted,
    Refreshing,
    Retried,
    Final(ApiResponse),
}

fn next_request_id() -> String {
    static REQUEST_ID: AtomicU64 = AtomicU64::new(1);
    let request_id_num = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let generator = block_id::BlockId::new(block_id::Alphabet::alphanumeric(), 1234, 5);
    generator
        .encode_string(request_id_num)
        .unwrap_or_else(|| request_id_num.to_string())
}

struct ClientInner {
    http: HttpClient,
    store: SessionStore,
    events: EventBus,
    refresher: RefreshCoordinator,
}

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(http: HttpClient, store: SessionStore, events: EventBus) -> Self {
        let refresher = RefreshCoordinator::new(http.clone(), store.clone(), events.clone());
        Self {
            inner: Arc::new(ClientInner {
                http,
                store,
                events,
                refresher,
            }),
        }
    }

    pub fn http(&self) -> &HttpClient {
        &self.inner.http
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.inner.refresher
    }

    pub async fn get(&self, path: &str) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::put(path).json(body)?).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::patch(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::delete(path)).await
    }

    /// GET that expects a 2xx JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.get(path).await?.error_for_status()?.json()
    }

    pub async fn send(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        let span = tracing::info_span!(
            "api_request",
            id = %next_request_id(),
            method = %request.method,
            path = %request.path,
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        let mut token = self.inner.store.token();
        let mut state = CallState::Attempted;

        loop {
            state = match state {
                CallState::Attempted => {
                    let response = self.dispatch(&request, token.as_deref()).await?;
                    // Without a session there is nothing to recover.
                    if response.status() == StatusCode::UNAUTHORIZED && token.is_some() {
                        CallState::Refreshing
                    } else {
                        CallState::Final(response)
                    }
                }
                CallState::Refreshing => {
                    token = Some(self.recover(token.as_deref()).await?);
                    CallState::Retried
                }
                CallState::Retried => {
                    let response = self.dispatch(&request, token.as_deref()).await?;
                    if response.status() == StatusCode::UNAUTHORIZED {
                        tracing::warn!("still unauthorized after token refresh, giving up");
                    }
                    CallState::Final(response)
                }
                CallState::Final(response) => {
                    if response.status() == StatusCode::PAYMENT_REQUIRED {
                        self.signal_billing_limit(&response);
                    }
                    return Ok(response);
                }
            };
        }
    }

    /// Produces the token to retry with after a 401 on `sent_token`.
    async fn recover(&self, sent_token: Option<&str>) -> ApiResult<String> {
        // The session ended while this call was in flight.
        if self.inner.store.token().is_none() {
            return Err(ApiError::SessionInvalidated);
        }

        match self.inner.refresher.refresh(sent_token).await {
            RefreshOutcome::Refreshed { token } => {
                Ok(self.inner.store.token().unwrap_or(token))
            }
            RefreshOutcome::Failed => Err(ApiError::SessionInvalidated),
        }
    }

    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> ApiResult<ApiResponse> {
        tracing::debug!("-> {} {}", request.method, request.path);
        let started = Instant::now();

        match self.inner.http.execute(request, token).await {
            Ok(response) => {
                tracing::info!(
                    "<- {} latency={}",
                    response.status().as_u16(),
                    format_latency(started.elapsed())
                );
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    "request failed after {}: {}",
                    format_latency(started.elapsed()),
                    e
                );
                Err(e)
            }
        }
    }

    fn signal_billing_limit(&self, response: &ApiResponse) {
        let limit = BillingLimit::from_body(response.body());
        tracing::warn!(
            "billing limit reached: metric={:?} limit={:?} current={:?}",
            limit.metric,
            limit.limit,
            limit.current
        );
        self.inner
            .events
            .emit(ClientEvent::BillingLimitReached(limit));
    }
}
