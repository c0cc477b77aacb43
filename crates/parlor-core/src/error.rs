//! Error types for the session core.
//!
//! A single [`SessionError`] reaches callers through completions and
//! synchronous returns. Misuse of the API is always `InvalidState`, never a
//! transport failure, so callers can tell a bug from a network problem.

use std::time::Duration;

use parlor_proto::ProtocolError;
use thiserror::Error;

use crate::{session::SessionState, signaling::CallState};

/// Errors surfaced to session callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current lifecycle state.
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        /// State when the call was made.
        state: SessionState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// Operation not valid in the current call state.
    #[error("cannot {operation} while call is {state:?}")]
    InvalidCallState {
        /// Call state when the call was made.
        state: CallState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// Connect or send failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed reply from the server.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server answered the request with an error event.
    #[error("request rejected by server: {error_type}")]
    Rejected {
        /// Server error type, e.g. `queue_not_found`.
        error_type: String,
        /// Optional human-readable reason.
        reason: Option<String>,
    },

    /// File upload failed before the message could be sent.
    #[error("upload failed: {0}")]
    Upload(String),

    /// No reply within the request timeout.
    #[error("request timed out after {after:?}")]
    Timeout {
        /// Configured timeout.
        after: Duration,
    },

    /// The session closed while the request was in flight.
    #[error("session closed")]
    Closed,

    /// A later call made the request moot (queue left before acceptance).
    #[error("request cancelled")]
    Cancelled,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    /// Returns true if retrying the same operation may succeed.
    ///
    /// Timeouts and transport failures are transient. Rejections, protocol
    /// errors and state errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }

    /// Returns true if the error means the session is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
