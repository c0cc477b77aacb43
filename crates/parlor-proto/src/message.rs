//! Message types and message identifiers.

use std::{cmp::Ordering, fmt};

/// Prefix shared by every WebRTC signaling message type.
pub const RTC_PREFIX: &str = "ninchat.com/rtc/";

/// Message types this client understands
///
/// Anything else is reported as `None` by [`MessageType::parse`] and ignored by
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Plain chat text, optionally with attached files.
    Text,
    /// File attachment.
    File,
    /// Interactive compose widgets (buttons, selects).
    Compose,
    /// User action on a compose widget.
    UiAction,
    /// Channel information notice.
    ChannelInfo,
    /// Part notice.
    PartInfo,
    /// Session metadata such as a rating.
    Metadata,
    /// Call invitation.
    RtcCall,
    /// Call accepted or rejected.
    RtcPickUp,
    /// Call terminated.
    RtcHangUp,
    /// SDP offer.
    RtcOffer,
    /// SDP answer.
    RtcAnswer,
    /// ICE candidate.
    RtcIceCandidate,
}

impl MessageType {
    /// Every known type.
    pub const ALL: [MessageType; 13] = [
        Self::Text,
        Self::File,
        Self::Compose,
        Self::UiAction,
        Self::ChannelInfo,
        Self::PartInfo,
        Self::Metadata,
        Self::RtcCall,
        Self::RtcPickUp,
        Self::RtcHangUp,
        Self::RtcOffer,
        Self::RtcAnswer,
        Self::RtcIceCandidate,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "ninchat.com/text",
            Self::File => "ninchat.com/file",
            Self::Compose => "ninchat.com/ui/compose",
            Self::UiAction => "ninchat.com/ui/action",
            Self::ChannelInfo => "ninchat.com/info/channel",
            Self::PartInfo => "ninchat.com/info/part",
            Self::Metadata => "ninchat.com/metadata",
            Self::RtcCall => "ninchat.com/rtc/call",
            Self::RtcPickUp => "ninchat.com/rtc/pick-up",
            Self::RtcHangUp => "ninchat.com/rtc/hang-up",
            Self::RtcOffer => "ninchat.com/rtc/offer",
            Self::RtcAnswer => "ninchat.com/rtc/answer",
            Self::RtcIceCandidate => "ninchat.com/rtc/ice-candidate",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether this is a WebRTC signaling type.
    pub fn is_rtc(self) -> bool {
        self.as_str().starts_with(RTC_PREFIX)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-assigned message identifier
///
/// Identifiers grow in length as they grow in value, so ordering compares the
/// length first and the bytes second. That makes "10" sort after "9".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap a server identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (non-message events).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.len().cmp(&other.0.len()).then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
