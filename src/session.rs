use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::storage::{Result, SESSION_KEY, Storage};

/// Record layout written by this crate. Blobs without a version are the
/// original unversioned layout and read as version 1.
pub const SESSION_RECORD_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    pub fn is_owner(&self) -> bool {
        *self == Role::Owner
    }

    pub fn is_admin(&self) -> bool {
        *self == Role::Admin
    }

    pub fn can_manage(&self) -> bool {
        self.is_owner() || self.is_admin()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub plan: String,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_role: Option<Role>,
    #[serde(default)]
    pub organizations: Vec<Organization>,
}

impl Session {
    pub fn new(token: impl Into<String>, user_id: i64) -> Self {
        Self {
            token: token.into(),
            refresh_token: None,
            user_id,
            organization_id: None,
            organization_slug: None,
            organization_role: None,
            organizations: Vec::new(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_organizations(mut self, organizations: Vec<Organization>) -> Self {
        self.organizations = organizations;
        self
    }

    /// Selects `organization` as the current one (id, slug and role).
    pub fn with_organization(mut self, organization: &Organization) -> Self {
        self.organization_id = Some(organization.id);
        self.organization_slug = Some(organization.slug.clone());
        self.organization_role = Some(organization.role);
        self
    }

    /// Makes `organization` current and adds it to the embedded list (or
    /// refreshes its entry), so `organization_id` always points into it.
    pub fn select_organization(&mut self, organization: &Organization) {
        match self.organizations.iter_mut().find(|o| o.id == organization.id) {
            Some(entry) => *entry = organization.clone(),
            None => self.organizations.push(organization.clone()),
        }
        self.organization_id = Some(organization.id);
        self.organization_slug = Some(organization.slug.clone());
        self.organization_role = Some(organization.role);
    }

    /// The embedded organization `organization_id` points at, if any.
    pub fn current_organization(&self) -> Option<&Organization> {
        let id = self.organization_id?;
        self.organizations.iter().find(|o| o.id == id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    #[serde(default = "unversioned")]
    version: u32,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    saved_at: Option<OffsetDateTime>,
    #[serde(flatten)]
    session: Session,
}

fn unversioned() -> u32 {
    1
}

/// Parses a persisted record, upgrading older layouts. Anything unreadable
/// yields `None` and is treated as logged out.
pub fn decode_session(raw: &str) -> Option<Session> {
    let stored: StoredSession = match serde_json::from_str(raw) {
        Ok(stored) => stored,
        Err(e) => {
            tracing::warn!("Ignoring malformed stored session: {}", e);
            return None;
        }
    };

    if stored.version > SESSION_RECORD_VERSION {
        tracing::warn!(
            "Ignoring stored session written by a newer client (version {})",
            stored.version
        );
        return None;
    }

    // Version 1 records only differ by missing fields, which serde defaults.
    Some(stored.session)
}

pub fn encode_session(session: &Session) -> String {
    let stored = StoredSession {
        version: SESSION_RECORD_VERSION,
        saved_at: Some(OffsetDateTime::now_utc()),
        session: session.clone(),
    };
    // Serializing plain strings, integers and enums cannot fail.
    serde_json::to_string(&stored).unwrap_or_default()
}

/// Typed access to the persisted session.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn Storage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn get_session(&self) -> Option<Session> {
        let raw = self.storage.get(SESSION_KEY)?;
        decode_session(&raw)
    }

    pub fn set_session(&self, session: &Session) -> Result<()> {
        self.storage.set(SESSION_KEY, &encode_session(session))
    }

    /// Applies `change` to the stored session as one storage write, with no
    /// other write in between. Returns the updated session, or `None` (and
    /// writes nothing) when logged out.
    pub fn update_session<F>(&self, change: F) -> Result<Option<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let mut change = Some(change);
        let mut updated = None;
        self.storage.update(SESSION_KEY, &mut |raw| {
            let mut session = decode_session(raw.as_deref()?)?;
            (change.take()?)(&mut session);
            let encoded = encode_session(&session);
            updated = Some(session);
            Some(encoded)
        })?;
        Ok(updated)
    }

    /// Stores a refreshed token. Keeps the previous refresh token when the
    /// server did not rotate it. Does nothing when logged out.
    pub fn update_session_token(&self, token: &str, refresh_token: Option<&str>) -> Result<()> {
        self.update_session(|session| {
            session.token = token.to_string();
            if let Some(refresh_token) = refresh_token {
                session.refresh_token = Some(refresh_token.to_string());
            }
        })?;
        Ok(())
    }

    pub fn update_organization(
        &self,
        token: &str,
        organization_id: i64,
        organization_slug: &str,
        organization_role: Role,
    ) -> Result<()> {
        self.update_session(|session| {
            session.token = token.to_string();
            session.organization_id = Some(organization_id);
            session.organization_slug = Some(organization_slug.to_string());
            session.organization_role = Some(organization_role);
        })?;
        Ok(())
    }

    pub fn update_organizations(&self, organizations: &[Organization]) -> Result<()> {
        self.update_session(|session| session.organizations = organizations.to_vec())?;
        Ok(())
    }

    pub fn remove_session(&self) -> Result<()> {
        self.storage.remove(SESSION_KEY)
    }

    pub fn token(&self) -> Option<String> {
        self.get_session().map(|s| s.token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.get_session().and_then(|s| s.refresh_token)
    }

    pub fn user_id(&self) -> Option<i64> {
        self.get_session().map(|s| s.user_id)
    }

    pub fn organization_id(&self) -> Option<i64> {
        self.get_session().and_then(|s| s.organization_id)
    }

    pub fn organization_slug(&self) -> Option<String> {
        self.get_session().and_then(|s| s.organization_slug)
    }

    pub fn organization_role(&self) -> Option<Role> {
        self.get_session().and_then(|s| s.organization_role)
    }
}
