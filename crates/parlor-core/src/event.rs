//! Inputs fed into the session.

use parlor_proto::{ActionId, InboundEvent};

/// Result of a file upload performed by the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Backend file id.
    pub file_id: String,
    /// File name as stored.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
}

/// Events the caller feeds into [`Session::handle`](crate::Session::handle).
///
/// The caller is responsible for:
/// - Forwarding every event the transport delivers
/// - Reporting transport and upload outcomes for actions it executed
/// - Reporting media engine readiness.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Event pushed by the backend.
    Inbound(InboundEvent),

    /// The connection attempt failed.
    ConnectFailed {
        /// Transport message.
        reason: String,
    },

    /// The connection dropped.
    TransportClosed {
        /// Transport message.
        reason: String,
    },

    /// Another connection took over this session.
    Superseded,

    /// A request could not be handed to the transport.
    SendFailed {
        /// Request that failed.
        action_id: ActionId,
        /// Transport message.
        reason: String,
    },

    /// An upload requested through `SessionAction::Upload` finished.
    UploadFinished {
        /// Request the upload belongs to.
        request: ActionId,
        /// Stored file, or the uploader's error message.
        result: Result<UploadedFile, String>,
    },

    /// The media engine's peer connection can accept remote candidates.
    PeerConnectionReady,

    /// The media engine gave up on the call.
    PeerConnectionFailed {
        /// Engine message.
        reason: String,
    },
}
