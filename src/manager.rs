use std::sync::Arc;

use serde::Deserialize;

use crate::client::ApiClient;
use crate::config::ClientConfig;
use crate::confirm::ConfirmChannel;
use crate::endpoints;
use crate::error::{ApiError, ApiResult};
use crate::events::{ClientEvent, EventBus};
use crate::organization::OrganizationContext;
use crate::session::{Organization, Session, SessionStore};
use crate::storage::{FileStorage, Storage};
use crate::transport::ApiRequest;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user_id: i64,
    #[serde(default)]
    organizations: Vec<Organization>,
    #[serde(default)]
    organization: Option<Organization>,
}

/// Owns the session state of one running client. Created once at start-up
/// and handed to every consumer; there is no ambient global state.
pub struct SessionManager {
    config: ClientConfig,
    api: ApiClient,
    confirm: ConfirmChannel,
}

impl SessionManager {
    pub fn new(config: ClientConfig, storage: Arc<dyn Storage>) -> ApiResult<Self> {
        let http = crate::transport::HttpClient::new(&config)?;
        let api = ApiClient::new(http, SessionStore::new(storage), EventBus::new());
        Ok(Self {
            config,
            api,
            confirm: ConfirmChannel::new(),
        })
    }

    /// Manager persisting the session in `config.state_dir`.
    pub fn with_file_storage(config: ClientConfig) -> ApiResult<Self> {
        let storage = FileStorage::open(&config.state_dir)?;
        Self::new(config, Arc::new(storage))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &SessionStore {
        self.api.store()
    }

    pub fn events(&self) -> &EventBus {
        self.api.events()
    }

    pub fn confirm(&self) -> &ConfirmChannel {
        &self.confirm
    }

    pub fn organization_context(&self) -> Arc<OrganizationContext> {
        Arc::new(OrganizationContext::new(self.api.clone()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.store().get_session().is_some()
    }

    /// Exchanges credentials for a session. The organization named by the
    /// backend is selected, otherwise the first one listed.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<Session> {
        let request = ApiRequest::post(endpoints::AUTH)
            .json(&serde_json::json!({ "email": email, "password": password }))?;
        let response = self.api.http().execute(&request, None).await?;

        if !response.is_success() {
            tracing::warn!("Login for {} rejected with {}", email, response.status());
            return Err(ApiError::Status {
                status: response.status(),
                body: response.text(),
            });
        }

        let login: LoginResponse = response.json()?;
        let mut session = Session::new(login.token, login.user_id);
        if let Some(refresh_token) = login.refresh_token {
            session = session.with_refresh_token(refresh_token);
        }
        let selected = login
            .organization
            .or_else(|| login.organizations.first().cloned());
        session = session.with_organizations(login.organizations);
        if let Some(organization) = &selected {
            session.select_organization(organization);
        }

        self.api.refresher().reset();
        self.store().set_session(&session)?;
        tracing::info!("logged in as user {}", session.user_id);
        Ok(session)
    }

    pub fn logout(&self) -> ApiResult<()> {
        self.api.refresher().reset();
        self.store().remove_session()?;
        self.events().emit(ClientEvent::LoggedOut);
        tracing::info!("logged out");
        Ok(())
    }
}
