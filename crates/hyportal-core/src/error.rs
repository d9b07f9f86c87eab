//! Error types for the portal.
//!
//! Remote application errors, local misuse and transport failures all surface
//! through [`PortalError`]. Transport failures are normally absorbed by the
//! connection supervisor and only reach callers as `NotConnected`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the portal library.
#[derive(Debug, Error)]
pub enum PortalError {
    // Remote procedure errors
    #[error("Remote error: {message}")]
    Remote { message: String },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection lost before the call was settled")]
    ConnectionLost,

    // Connection errors
    #[error("Not connected to {url}")]
    NotConnected { url: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // URL resolution errors
    #[error("Cannot resolve portal URL: {reason}")]
    UnresolvableUrl { reason: String },

    #[error("Invalid portal URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    // Serialization errors
    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Dispatch errors
    #[error("'{name}' is a local portal member and cannot be invoked with plain arguments")]
    LocalMember { name: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for portal operations.
pub type Result<T> = std::result::Result<T, PortalError>;

impl From<std::io::Error> for PortalError {
    fn from(err: std::io::Error) -> Self {
        PortalError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(err: serde_json::Error) -> Self {
        PortalError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rmp_serde::encode::Error> for PortalError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        PortalError::Codec {
            message: format!("MessagePack encode failed: {}", err),
        }
    }
}

impl From<rmp_serde::decode::Error> for PortalError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        PortalError::Codec {
            message: format!("MessagePack decode failed: {}", err),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PortalError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PortalError::Transport {
            message: err.to_string(),
        }
    }
}

impl PortalError {
    /// Build a remote application error from the message carried in a response.
    pub fn remote(message: impl Into<String>) -> Self {
        PortalError::Remote {
            message: message.into(),
        }
    }

    /// Check if the failed operation may succeed once the connection recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PortalError::NotConnected { .. }
                | PortalError::Transport { .. }
                | PortalError::Io { .. }
                | PortalError::Timeout(_)
                | PortalError::ConnectionLost
        )
    }
}
