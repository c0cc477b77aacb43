//! Errors at the collaborator boundary.
//!
//! Collaborators report their own error types; the runtime flattens them into
//! `SessionError` before they reach the session core.

use std::time::Duration;

use parlor_core::SessionError;
use thiserror::Error;

/// Transport failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The connection did not come up within the connect timeout.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A request could not be written.
    #[error("send failed: {0}")]
    Send(String),

    /// The connection is not open.
    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        SessionError::Transport(error.to_string())
    }
}

/// File upload failure reported by an [`Uploader`](crate::Uploader).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct UploadError(pub String);
