//! Inbound events.
//!
//! The backend pushes events as property maps whose `event` property names
//! the kind. Replies to a request echo the request's `action_id`; unsolicited
//! events carry none.

use std::fmt;

use crate::{message::MessageId, payload::Payload, props::Props};

/// Locally generated request correlation identifier
///
/// Zero is reserved for "no action"; allocated identifiers start at one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(u64);

impl ActionId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event kinds the session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Session established.
    SessionCreated,
    /// Request or session failure.
    Error,
    /// Channel description.
    ChannelFound,
    /// Joined a channel.
    ChannelJoined,
    /// Channel attributes changed.
    ChannelUpdated,
    /// Left a channel.
    ChannelParted,
    /// Channel member attributes changed.
    ChannelMemberUpdated,
    /// ICE servers granted.
    IceBegun,
    /// User attributes changed.
    UserUpdated,
    /// User deleted.
    UserDeleted,
    /// Chat message.
    MessageReceived,
    /// History batch entry.
    HistoryResults,
    /// File description.
    FileFound,
    /// Realm queue listing.
    RealmQueuesFound,
    /// Entered a queue.
    AudienceEnqueued,
    /// Queue position changed.
    QueueUpdated,
    /// Another connection took over the session.
    ConnectionSuperseded,
}

impl EventKind {
    const ALL: [EventKind; 17] = [
        Self::SessionCreated,
        Self::Error,
        Self::ChannelFound,
        Self::ChannelJoined,
        Self::ChannelUpdated,
        Self::ChannelParted,
        Self::ChannelMemberUpdated,
        Self::IceBegun,
        Self::UserUpdated,
        Self::UserDeleted,
        Self::MessageReceived,
        Self::HistoryResults,
        Self::FileFound,
        Self::RealmQueuesFound,
        Self::AudienceEnqueued,
        Self::QueueUpdated,
        Self::ConnectionSuperseded,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::Error => "error",
            Self::ChannelFound => "channel_found",
            Self::ChannelJoined => "channel_joined",
            Self::ChannelUpdated => "channel_updated",
            Self::ChannelParted => "channel_parted",
            Self::ChannelMemberUpdated => "channel_member_updated",
            Self::IceBegun => "ice_begun",
            Self::UserUpdated => "user_updated",
            Self::UserDeleted => "user_deleted",
            Self::MessageReceived => "message_received",
            Self::HistoryResults => "history_results",
            Self::FileFound => "file_found",
            Self::RealmQueuesFound => "realm_queues_found",
            Self::AudienceEnqueued => "audience_enqueued",
            Self::QueueUpdated => "queue_updated",
            Self::ConnectionSuperseded => "connection_superseded",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event as delivered by the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundEvent {
    /// Header properties.
    pub props: Props,
    /// Payload frames.
    pub payload: Payload,
}

impl InboundEvent {
    /// Event with the given header and payload.
    pub fn new(props: Props, payload: Payload) -> Self {
        Self { props, payload }
    }

    /// Raw `event` property.
    pub fn name(&self) -> Option<&str> {
        self.props.str("event")
    }

    /// Parsed kind, `None` for unknown or missing names.
    pub fn kind(&self) -> Option<EventKind> {
        self.name().and_then(EventKind::from_name)
    }

    /// Correlation id of the request this event answers
    ///
    /// Absent, zero, or negative values mean the event is unsolicited.
    pub fn action_id(&self) -> Option<ActionId> {
        self.props.int("action_id").filter(|id| *id > 0).map(|id| ActionId::new(id as u64))
    }

    /// Server message id, empty for events that are not messages.
    pub fn message_id(&self) -> MessageId {
        MessageId::new(self.props.str("message_id").unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_action_id() {
        let event = InboundEvent::new(
            Props::new().with("event", "realm_queues_found").with("action_id", 7),
            Payload::empty(),
        );
        assert_eq!(event.kind(), Some(EventKind::RealmQueuesFound));
        assert_eq!(event.action_id(), Some(ActionId::new(7)));
        assert!(event.message_id().is_empty());
    }

    #[test]
    fn zero_action_id_is_unsolicited() {
        let event = InboundEvent::new(Props::new().with("event", "queue_updated").with("action_id", 0), Payload::empty());
        assert_eq!(event.action_id(), None);
    }

    #[test]
    fn unknown_kind() {
        let event = InboundEvent::new(Props::new().with("event", "dialogue_updated"), Payload::empty());
        assert_eq!(event.name(), Some("dialogue_updated"));
        assert_eq!(event.kind(), None);
    }
}
