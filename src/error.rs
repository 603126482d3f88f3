use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes for programmatic handling of session failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Transport errors
    NetworkFailure,
    UnexpectedResponse,

    // Authentication errors
    AuthenticationFailure,
    AuthenticationRequired,
    AuthorizationExpired,
    RefreshFailure,
    TokenDecodeFailure,

    // Local errors
    StorageFailure,
    ConfigInvalid,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NetworkFailure => "network_failure",
            Self::UnexpectedResponse => "unexpected_response",
            Self::AuthenticationFailure => "authentication_failure",
            Self::AuthenticationRequired => "authentication_required",
            Self::AuthorizationExpired => "authorization_expired",
            Self::RefreshFailure => "refresh_failure",
            Self::TokenDecodeFailure => "token_decode_failure",
            Self::StorageFailure => "storage_failure",
            Self::ConfigInvalid => "config_invalid",
            Self::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// Error categories for deciding how a failure should be surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport unreachable, timeouts - retryable by the caller
    Network,
    /// Credentials rejected or session gone - needs a new login
    Authentication,
    /// Persistent storage could not be read or written
    Storage,
    /// Configuration errors - not retryable without reconfiguration
    Configuration,
    /// Internal errors in our code or a malformed server reply
    Internal,
}

impl ErrorCategory {
    /// Returns true if errors in this category are generally retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network => true,
            Self::Authentication | Self::Storage | Self::Configuration | Self::Internal => false,
        }
    }
}

/// Errors produced by the session core
///
/// The type is `Clone` because a single refresh outcome is shared among every
/// request that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Network failure: {reason}")]
    Network { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailure { message: String },

    #[error("Authentication required: {reason}")]
    AuthenticationRequired { reason: String },

    #[error("Authorization expired for {url}")]
    AuthorizationExpired { url: String },

    #[error("Failed to refresh session: {reason}")]
    RefreshFailure { reason: String },

    #[error("Access token could not be decoded: {reason}")]
    TokenDecode { reason: String },

    #[error("Unexpected response ({status}): {reason}")]
    UnexpectedResponse { status: u16, reason: String },

    #[error("Session storage failed: {reason}")]
    Storage { reason: String },

    #[error("Invalid configuration value for '{key}': {reason}")]
    Config { key: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Get the error code for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::NetworkFailure,
            Self::AuthenticationFailure { .. } => ErrorCode::AuthenticationFailure,
            Self::AuthenticationRequired { .. } => ErrorCode::AuthenticationRequired,
            Self::AuthorizationExpired { .. } => ErrorCode::AuthorizationExpired,
            Self::RefreshFailure { .. } => ErrorCode::RefreshFailure,
            Self::TokenDecode { .. } => ErrorCode::TokenDecodeFailure,
            Self::UnexpectedResponse { .. } => ErrorCode::UnexpectedResponse,
            Self::Storage { .. } => ErrorCode::StorageFailure,
            Self::Config { .. } => ErrorCode::ConfigInvalid,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Get the category used to decide how the failure is surfaced
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } => ErrorCategory::Network,
            Self::AuthenticationFailure { .. }
            | Self::AuthenticationRequired { .. }
            | Self::AuthorizationExpired { .. }
            | Self::RefreshFailure { .. }
            | Self::TokenDecode { .. } => ErrorCategory::Authentication,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::UnexpectedResponse { .. } | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::Internal(err.to_string())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

// Helper constructors for common error patterns

/// Create a network failure from any transport error
pub fn network_failure(err: impl fmt::Display) -> SessionError {
    SessionError::Network {
        reason: err.to_string(),
    }
}

/// Create the error reported to callers once the session is gone
pub fn authentication_required(reason: impl Into<String>) -> SessionError {
    SessionError::AuthenticationRequired {
        reason: reason.into(),
    }
}

/// Create a refresh failure
pub fn refresh_failed(reason: impl fmt::Display) -> SessionError {
    SessionError::RefreshFailure {
        reason: reason.to_string(),
    }
}

/// Create a token decode failure
pub fn token_decode_failed(reason: impl fmt::Display) -> SessionError {
    SessionError::TokenDecode {
        reason: reason.to_string(),
    }
}

/// Create a storage failure
pub fn storage_failed(err: impl fmt::Display) -> SessionError {
    SessionError::Storage {
        reason: err.to_string(),
    }
}

/// Create a configuration error
pub fn config_invalid(key: &str, reason: impl Into<String>) -> SessionError {
    SessionError::Config {
        key: key.to_string(),
        reason: reason.into(),
    }
}
