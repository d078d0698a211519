//! Error types for the Chronos client

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a 401 could not be recovered by refreshing the tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No refresh token was stored
    NoRefreshToken,
    /// The refresh endpoint rejected the refresh token or could not be reached
    RefreshFailed,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRefreshToken => write!(f, "no refresh token available"),
            Self::RefreshFailed => write!(f, "token refresh failed"),
        }
    }
}

/// Client error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// A 401 that refreshing could not fix.
    ///
    /// `message` is the message of the original 401 response, `cause` is
    /// what went wrong with the refresh itself.
    #[error("{message}")]
    Auth {
        reason: AuthFailure,
        message: String,
        cause: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ApiError {
    /// HTTP status carried by the error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Auth { .. } => Some(401),
            _ => None,
        }
    }

    pub fn auth_failure(&self) -> Option<AuthFailure> {
        match self {
            Self::Auth { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Token storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("token file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("token file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("no storage directory available on this platform")]
    NoDataDir,
}

pub type Result<T> = std::result::Result<T, ApiError>;
