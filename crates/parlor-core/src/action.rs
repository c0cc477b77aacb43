//! Outputs produced by the session.

use bytes::Bytes;
use parlor_proto::{
    ActionId, MessageId, MessageType, Props, Request,
    payloads::{IceServers, RtcSignal},
};

use crate::{
    chat::ChannelUser,
    error::SessionError,
    file::FileDescription,
    queue::Queue,
    signaling::{CallState, RtcCommand},
};

/// Actions the caller must execute.
///
/// The session is Sans-IO: it never touches the network, the media engine or
/// the UI itself. Actions must be executed in the order produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Open the transport and create the session.
    Connect {
        /// Backend address.
        address: String,
        /// User agent header.
        user_agent: String,
        /// `create_session` parameters.
        params: Props,
    },

    /// Send a request.
    Send {
        /// Correlation id to attach.
        action_id: ActionId,
        /// Request body.
        request: Request,
    },

    /// Upload a file, then report `SessionEvent::UploadFinished`.
    Upload {
        /// Request the upload belongs to.
        request: ActionId,
        /// File name.
        file_name: String,
        /// File content.
        data: Bytes,
    },

    /// Resolve a caller's pending request; produced exactly once per request.
    Complete {
        /// Request being resolved.
        request: ActionId,
        /// Outcome.
        outcome: Result<Reply, SessionError>,
    },

    /// Deliver a notification to the application.
    Notify(SessionNotification),

    /// Drive the media engine.
    Rtc(RtcCommand),

    /// Close the transport.
    Disconnect,
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Request acknowledged, nothing to report.
    Done,
    /// Session established.
    SessionCreated {
        /// Own user id.
        user_id: String,
        /// Session id, if the server reported one.
        session_id: Option<String>,
    },
    /// Realm queue listing.
    Queues(Vec<Queue>),
    /// Message accepted by the server.
    Sent {
        /// Server message id of the echo.
        message_id: MessageId,
    },
    /// File description.
    File(FileDescription),
    /// ICE servers.
    IceServers(IceServers),
}

/// Notifications for the application layer.
///
/// Delivered in production order on the task that owns the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    /// Entry inserted into the history at `index` (0 is newest).
    MessageAdded {
        /// Insertion index.
        index: usize,
    },
    /// Entry removed from the history at `index`.
    MessageRemoved {
        /// Removal index.
        index: usize,
    },
    /// History replaced wholesale (new channel).
    HistoryReset,
    /// Entered a queue.
    QueueJoined {
        /// Queue id.
        queue_id: String,
        /// Position in line, 1 is next.
        position: u32,
    },
    /// Queue position changed.
    QueueProgress {
        /// Queue id.
        queue_id: String,
        /// Position in line, 1 is next.
        position: u32,
    },
    /// Accepted into a channel.
    ChannelJoined {
        /// Channel id.
        channel_id: String,
        /// Queue the guest was waiting in.
        queue_id: Option<String>,
    },
    /// The agent closed or suspended the channel.
    ChannelClosed {
        /// Channel id.
        channel_id: String,
    },
    /// Call signal from the peer.
    RtcSignal {
        /// Signal message type.
        kind: MessageType,
        /// Sending channel member.
        sender: ChannelUser,
        /// Opaque signal body.
        signal: RtcSignal,
    },
    /// Call state changed.
    CallStateChanged {
        /// New state.
        state: CallState,
    },
    /// The session is over; no further notifications follow.
    SessionEnded {
        /// Why it ended.
        reason: String,
    },
}
