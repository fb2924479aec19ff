pub mod client;
pub mod config;
pub mod confirm;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod manager;
pub mod organization;
pub mod refresh;
pub mod session;
pub mod storage;
pub mod transport;

pub use client::ApiClient;
pub use config::ClientConfig;
pub use confirm::{ConfirmChannel, ConfirmRequest, Responder};
pub use error::{ApiError, ApiResult};
pub use events::{BillingLimit, ClientEvent, EventBus};
pub use manager::SessionManager;
pub use organization::{OrganizationContext, OrganizationState};
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use session::{Organization, Role, Session, SessionStore};
pub use storage::{FileStorage, MemoryStorage, SESSION_KEY, Storage, StorageError, StorageEvent};
pub use transport::{ApiRequest, ApiResponse, HttpClient};
