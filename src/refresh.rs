//! Single-flight refresh-token exchange.
//!
//! Refresh tokens are rotated by the backend, so two concurrent exchanges
//! would invalidate each other. Every caller hitting a 401 joins the flight
//! in the slot; only the first one to arrive performs the HTTP call.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::endpoints;
use crate::events::{ClientEvent, EventBus};
use crate::session::SessionStore;
use crate::transport::{ApiRequest, HttpClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { token: String },
    /// The session was cleared and `SessionInvalidated` broadcast.
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

type Flight = Arc<OnceCell<RefreshOutcome>>;

pub struct RefreshCoordinator {
    http: HttpClient,
    store: SessionStore,
    events: EventBus,
    in_flight: Mutex<Option<Flight>>,
}

impl RefreshCoordinator {
    pub fn new(http: HttpClient, store: SessionStore, events: EventBus) -> Self {
        Self {
            http,
            store,
            events,
            in_flight: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Flight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_refreshing(&self) -> bool {
        self.slot().is_some()
    }

    /// Joins the current flight or starts one, and waits for its outcome.
    ///
    /// `stale_token` is the token the server rejected. When no flight is
    /// pending and the stored token already differs from it, a flight that
    /// settled in the meantime rotated it and no new exchange is started.
    pub async fn refresh(&self, stale_token: Option<&str>) -> RefreshOutcome {
        // Check-and-set happens before the first await.
        let flight = {
            let mut slot = self.slot();
            if slot.is_none()
                && let Some(current) = self.store.token()
                && Some(current.as_str()) != stale_token
            {
                return RefreshOutcome::Refreshed { token: current };
            }
            slot.get_or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let outcome = flight.get_or_init(|| self.exchange()).await.clone();

        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &flight)) {
            *slot = None;
        }

        outcome
    }

    /// Drops the current flight so the next 401 starts a fresh one.
    pub fn reset(&self) {
        self.slot().take();
    }

    async fn exchange(&self) -> RefreshOutcome {
        // Already logged out (or invalidated by an earlier flight).
        let Some(session) = self.store.get_session() else {
            tracing::debug!("401 received without a stored session");
            return RefreshOutcome::Failed;
        };

        let Some(refresh_token) = session.refresh_token else {
            tracing::warn!("401 received but no refresh token is stored");
            return self.invalidate();
        };

        tracing::info!("refreshing session token");
        let request = match ApiRequest::post(endpoints::AUTH_REFRESH)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
        {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("Failed to build refresh request: {}", e);
                return self.invalidate();
            }
        };

        let response = match self.http.execute(&request, None).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                return self.invalidate();
            }
        };

        if !response.is_success() {
            tracing::warn!("Token refresh rejected with {}", response.status());
            return self.invalidate();
        }

        let refreshed: RefreshResponse = match response.json() {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!("Unreadable refresh response: {}", e);
                return self.invalidate();
            }
        };

        if let Err(e) = self
            .store
            .update_session_token(&refreshed.token, refreshed.refresh_token.as_deref())
        {
            tracing::error!("Failed to persist refreshed token: {}", e);
            return self.invalidate();
        }

        tracing::info!("session token refreshed");
        RefreshOutcome::Refreshed {
            token: refreshed.token,
        }
    }

    fn invalidate(&self) -> RefreshOutcome {
        if let Err(e) = self.store.remove_session() {
            tracing::error!("Failed to clear session: {}", e);
        }
        self.events.emit(ClientEvent::SessionInvalidated);
        RefreshOutcome::Failed
    }
}
