use reqwest::StatusCode;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session is no longer valid, please log in again")]
    SessionInvalidated,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ApiError {
    /// True for failures where the server never produced a response.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
