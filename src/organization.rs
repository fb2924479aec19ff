//! Live view of the current organization, kept in step with the stored
//! session, plus the organization-switch flow.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::client::ApiClient;
use crate::endpoints;
use crate::error::ApiResult;
use crate::session::{Organization, Role, Session, decode_session};
use crate::storage::{SESSION_KEY, StorageEvent};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrganizationState {
    pub organizations: Vec<Organization>,
    pub current: Option<Organization>,
}

impl OrganizationState {
    /// The organization the session points at, otherwise the first listed.
    pub fn from_session(session: Option<&Session>) -> Self {
        let Some(session) = session else {
            return Self::default();
        };
        let current = session
            .current_organization()
            .or_else(|| session.organizations.first())
            .cloned();
        Self {
            organizations: session.organizations.clone(),
            current,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchResponse {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    organization: Organization,
}

pub struct OrganizationContext {
    api: ApiClient,
    state: RwLock<OrganizationState>,
}

impl OrganizationContext {
    pub fn new(api: ApiClient) -> Self {
        let context = Self {
            api,
            state: RwLock::new(OrganizationState::default()),
        };
        context.reload();
        context
    }

    fn read(&self) -> RwLockReadGuard<'_, OrganizationState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, OrganizationState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reload(&self) {
        let session = self.api.store().get_session();
        *self.write() = OrganizationState::from_session(session.as_ref());
    }

    pub fn clear(&self) {
        *self.write() = OrganizationState::default();
    }

    /// Applies a session change made by another tab.
    pub fn handle_storage_event(&self, event: &StorageEvent) {
        if event.key != SESSION_KEY {
            return;
        }
        match &event.new_value {
            Some(raw) => {
                let session = decode_session(raw);
                tracing::debug!("session changed elsewhere, reloading organizations");
                *self.write() = OrganizationState::from_session(session.as_ref());
            }
            None => {
                tracing::debug!("session removed elsewhere, clearing organizations");
                self.clear();
            }
        }
    }

    /// Follows storage changes from other handles until the context is
    /// dropped or the storage goes away.
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.api.store().storage().subscribe();
        let context = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(context) = context.upgrade() else {
                    break;
                };
                context.handle_storage_event(&event);
            }
        })
    }

    pub fn snapshot(&self) -> OrganizationState {
        self.read().clone()
    }

    pub fn organizations(&self) -> Vec<Organization> {
        self.read().organizations.clone()
    }

    pub fn current_organization(&self) -> Option<Organization> {
        self.read().current.clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.read().current.as_ref().map(|o| o.role)
    }

    pub fn is_owner(&self) -> bool {
        self.role().is_some_and(|r| r.is_owner())
    }

    pub fn is_admin(&self) -> bool {
        self.role().is_some_and(|r| r.is_admin())
    }

    pub fn can_manage(&self) -> bool {
        self.role().is_some_and(|r| r.can_manage())
    }

    /// Exchanges the session token for one scoped to `organization_id`.
    /// Returns `false` and leaves everything untouched on any failure.
    pub async fn switch_organization(&self, organization_id: i64) -> bool {
        let body = serde_json::json!({ "organizationId": organization_id });
        let response = match self.api.post(endpoints::AUTH_SWITCH_ORG, &body).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                tracing::warn!(
                    "Switch to organization {} rejected with {}",
                    organization_id,
                    response.status()
                );
                return false;
            }
            Err(e) => {
                tracing::warn!("Switch to organization {} failed: {}", organization_id, e);
                return false;
            }
        };

        let switched: SwitchResponse = match response.json() {
            Ok(switched) => switched,
            Err(e) => {
                tracing::warn!("Unreadable switch-org response: {}", e);
                return false;
            }
        };

        // Readers wait on the lock until storage and memory agree again.
        let mut state = self.write();
        let organization = switched.organization;

        // One write: other handles never see the new organization id
        // without the matching list entry and token.
        let updated = self.api.store().update_session(|session| {
            session.token = switched.token;
            if let Some(refresh_token) = switched.refresh_token {
                session.refresh_token = Some(refresh_token);
            }
            session.select_organization(&organization);
        });

        let session = match updated {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!("Session ended while switching organization");
                return false;
            }
            Err(e) => {
                tracing::error!("Failed to persist organization switch: {}", e);
                return false;
            }
        };

        state.organizations = session.organizations;
        state.current = Some(organization);
        tracing::info!("switched to organization {}", organization_id);
        true
    }

    /// Re-fetches the organization list. The current selection survives if
    /// it is still listed, otherwise the first organization is selected.
    pub async fn refresh_organizations(&self) -> ApiResult<Vec<Organization>> {
        let organizations: Vec<Organization> =
            self.api.get_json(endpoints::ORGANIZATIONS).await?;

        let mut state = self.write();
        self.api.store().update_organizations(&organizations)?;

        let current = state
            .current
            .as_ref()
            .and_then(|current| organizations.iter().find(|o| o.id == current.id))
            .or_else(|| organizations.first())
            .cloned();

        state.organizations = organizations.clone();
        state.current = current;
        Ok(organizations)
    }
}
