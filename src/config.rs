use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{config_invalid, SessionError, SessionResult};
use crate::events::SESSION_EVENT_CAPACITY;

// Default configuration values
const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
const DEFAULT_LOGIN_PATH: &str = "/auth/login";
const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
const DEFAULT_LOGOUT_PATH: &str = "/auth/logout";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Settings for the session core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base URL every endpoint path is joined to
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_logout_path")]
    pub logout_path: String,
    /// Timeout applied to every HTTP request, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// How long the login operation stays registered, in milliseconds
    #[serde(default = "default_login_timeout")]
    pub login_timeout_ms: u64,
    /// Prefix for every persisted session key
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    /// File the session is persisted to; memory only when absent
    #[serde(default = "default_storage_path")]
    pub storage_path: Option<PathBuf>,
    /// Buffered notifications per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Token type used when the server does not declare one
    #[serde(default = "default_token_type")]
    pub default_token_type: String,
}

// Default functions
fn default_base_url() -> String {
    std::env::var("SESSION_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn default_login_path() -> String {
    std::env::var("SESSION_LOGIN_PATH").unwrap_or_else(|_| DEFAULT_LOGIN_PATH.to_string())
}

fn default_refresh_path() -> String {
    std::env::var("SESSION_REFRESH_PATH").unwrap_or_else(|_| DEFAULT_REFRESH_PATH.to_string())
}

fn default_logout_path() -> String {
    std::env::var("SESSION_LOGOUT_PATH").unwrap_or_else(|_| DEFAULT_LOGOUT_PATH.to_string())
}

fn default_request_timeout() -> u64 {
    std::env::var("SESSION_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

fn default_login_timeout() -> u64 {
    std::env::var("SESSION_LOGIN_TIMEOUT_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

fn default_storage_prefix() -> String {
    std::env::var("SESSION_STORAGE_PREFIX").unwrap_or_default()
}

fn default_storage_path() -> Option<PathBuf> {
    std::env::var("SESSION_STORAGE_PATH")
        .ok()
        .filter(|val| !val.is_empty())
        .map(PathBuf::from)
}

fn default_event_capacity() -> usize {
    std::env::var("SESSION_EVENT_CAPACITY")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(SESSION_EVENT_CAPACITY)
}

fn default_token_type() -> String {
    std::env::var("SESSION_TOKEN_TYPE").unwrap_or_else(|_| DEFAULT_TOKEN_TYPE.to_string())
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            login_path: default_login_path(),
            refresh_path: default_refresh_path(),
            logout_path: default_logout_path(),
            request_timeout_ms: default_request_timeout(),
            login_timeout_ms: default_login_timeout(),
            storage_prefix: default_storage_prefix(),
            storage_path: default_storage_path(),
            event_capacity: default_event_capacity(),
            default_token_type: default_token_type(),
        }
    }
}

impl SessionConfig {
    /// Configuration from the environment, honouring a `.env` file
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::default()
    }

    /// Load a JSON configuration file; missing fields fall back to their defaults
    pub async fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .map_err(|e| config_invalid("path", format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| config_invalid("path", format!("{}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Load from `SESSION_CONFIG_PATH` when it is set, otherwise from the environment
    pub async fn load_default() -> SessionResult<Self> {
        let config = Self::from_env();
        match std::env::var("SESSION_CONFIG_PATH") {
            Ok(path) if !path.is_empty() => {
                info!("Using configuration file {}", path);
                Self::load(path).await
            }
            _ => {
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Reject settings the session core cannot work with
    pub fn validate(&self) -> SessionResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(config_invalid("base_url", "must not be empty"));
        }
        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| config_invalid("base_url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(config_invalid("base_url", "scheme must be http or https"));
        }

        for (key, path) in [
            ("login_path", &self.login_path),
            ("refresh_path", &self.refresh_path),
            ("logout_path", &self.logout_path),
        ] {
            if path.trim().is_empty() {
                return Err(config_invalid(key, "must not be empty"));
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(config_invalid("request_timeout_ms", "must be greater than zero"));
        }
        if self.login_timeout_ms == 0 {
            return Err(config_invalid("login_timeout_ms", "must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(config_invalid("event_capacity", "must be greater than zero"));
        }
        if self.default_token_type.trim().is_empty() {
            return Err(config_invalid("default_token_type", "must not be empty"));
        }
        Ok(())
    }

    /// Absolute URL of an endpoint path
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }
}

impl TryFrom<&str> for SessionConfig {
    type Error = SessionError;

    /// Parse a JSON document into a validated configuration
    fn try_from(json: &str) -> SessionResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| config_invalid("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
