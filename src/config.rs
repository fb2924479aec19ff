use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STATE_DIR: &str = ".testhub";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Where file-backed storage keeps the session.
    pub state_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: format!("testhub/{}", env!("CARGO_PKG_VERSION")),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl ClientConfig {
    /// Reads `TESTHUB_API_URL`, `TESTHUB_TIMEOUT_SECS` and `TESTHUB_STATE_DIR`,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("TESTHUB_API_URL")
            && !url.trim().is_empty()
        {
            config.base_url = url;
        }

        if let Ok(secs) = std::env::var("TESTHUB_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout = Duration::from_secs(secs),
                _ => tracing::warn!("Ignoring invalid TESTHUB_TIMEOUT_SECS: {}", secs),
            }
        }

        if let Ok(dir) = std::env::var("TESTHUB_STATE_DIR")
            && !dir.trim().is_empty()
        {
            config.state_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }
}
