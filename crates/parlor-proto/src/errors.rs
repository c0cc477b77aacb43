//! Protocol-level errors.
//!
//! These describe malformed input from the backend. They never carry
//! transport state; the session layer decides whether a protocol error fails
//! a waiting request or is merely logged.

use thiserror::Error;

/// Result alias for protocol decoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Malformed or unexpected wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A required property is absent.
    #[error("missing property '{0}'")]
    MissingProperty(String),

    /// A property is present but has the wrong JSON type.
    #[error("property '{key}' is not a {expected}")]
    WrongType {
        /// Property name.
        key: String,
        /// Expected JSON type.
        expected: &'static str,
    },

    /// A payload part could not be decoded.
    #[error("payload part {index} is invalid: {reason}")]
    InvalidPayload {
        /// Index of the offending part.
        index: usize,
        /// Decoder message.
        reason: String,
    },

    /// A request body could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(String),
}
