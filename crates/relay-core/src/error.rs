use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    UpstreamRejectedRequest(String),

    #[error("{0}")]
    MalformedUpstreamResponse(String),

    #[error("{message}")]
    UpstreamError { status: u16, message: String },

    #[error("{0}")]
    TransportError(String),

    #[error("A request is already in flight")]
    AlreadyInFlight,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Stable, serializable category of a [`RelayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    Unauthorized,
    RateLimited,
    UpstreamRejectedRequest,
    MalformedUpstreamResponse,
    UpstreamError,
    TransportError,
    AlreadyInFlight,
    UnknownConversation,
    Internal,
}

impl ErrorKind {
    /// Maps an upstream HTTP failure status onto the relay taxonomy.
    pub fn from_upstream_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            401 => Self::Unauthorized,
            400 => Self::UpstreamRejectedRequest,
            _ => Self::UpstreamError,
        }
    }

    /// Recovers a category from a failure body that did not name one.
    ///
    /// `upstream_status` is only present when the proxy relayed an upstream
    /// failure; otherwise the proxy's own HTTP status decides.
    pub fn infer(http_status: u16, upstream_status: Option<u16>) -> Self {
        match upstream_status {
            Some(status) => Self::from_upstream_status(status),
            None if http_status == 400 || http_status == 405 => Self::InvalidRequest,
            None => Self::Internal,
        }
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RelayError::Unauthorized(_) => ErrorKind::Unauthorized,
            RelayError::RateLimited(_) => ErrorKind::RateLimited,
            RelayError::UpstreamRejectedRequest(_) => ErrorKind::UpstreamRejectedRequest,
            RelayError::MalformedUpstreamResponse(_) => ErrorKind::MalformedUpstreamResponse,
            RelayError::UpstreamError { .. } => ErrorKind::UpstreamError,
            RelayError::TransportError(_) => ErrorKind::TransportError,
            RelayError::AlreadyInFlight => ErrorKind::AlreadyInFlight,
            RelayError::UnknownConversation(_) => ErrorKind::UnknownConversation,
            RelayError::ConfigError(_)
            | RelayError::IoError(_)
            | RelayError::SerializationError(_)
            | RelayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Upstream HTTP status carried by relayed upstream failures.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            RelayError::Unauthorized(_) => Some(401),
            RelayError::RateLimited(_) => Some(429),
            RelayError::UpstreamRejectedRequest(_) => Some(400),
            RelayError::UpstreamError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Rebuilds an error from a category, message and optional status.
    pub fn from_parts(kind: ErrorKind, message: String, status: Option<u16>) -> Self {
        match kind {
            ErrorKind::InvalidRequest => RelayError::InvalidRequest(message),
            ErrorKind::Unauthorized => RelayError::Unauthorized(message),
            ErrorKind::RateLimited => RelayError::RateLimited(message),
            ErrorKind::UpstreamRejectedRequest => RelayError::UpstreamRejectedRequest(message),
            ErrorKind::MalformedUpstreamResponse => RelayError::MalformedUpstreamResponse(message),
            ErrorKind::UpstreamError => RelayError::UpstreamError {
                status: status.unwrap_or(500),
                message,
            },
            ErrorKind::TransportError => RelayError::TransportError(message),
            ErrorKind::AlreadyInFlight => RelayError::AlreadyInFlight,
            ErrorKind::UnknownConversation => RelayError::UnknownConversation(message),
            ErrorKind::Internal => RelayError::Internal(message),
        }
    }
}
