//! Chat history for the active channel.
//!
//! History is kept newest-first, the order the UI renders it in. Every
//! insertion reports the index it landed at so the UI can animate exactly
//! one row.
//!
//! # Ordering
//!
//! Entries are ordered by timestamp, newest first. Channel messages with equal
//! timestamps are ordered by message id. Locally created entries (typing
//! indicators, meta notices) carry the wall-clock time of creation.
//!
//! # Series
//!
//! A channel message is part of a series when the nearest older channel
//! message has the same sender. Typing indicators and meta notices are
//! skipped. The flag is recomputed for the inserted message and for the
//! nearest newer channel message, the only two entries whose predecessor can
//! change.

use std::cmp::Ordering;

use parlor_proto::{MessageId, Props, payloads::ComposeContent};

use crate::file::{FileDescription, FileInfo};

/// A member of the active channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelUser {
    /// User id.
    pub user_id: String,
    /// Real name.
    pub real_name: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Avatar URL.
    pub icon_url: Option<String>,
    /// Whether the user is a guest.
    pub guest: bool,
}

impl ChannelUser {
    /// Build from a `user_attrs` object.
    pub fn from_attrs(user_id: impl Into<String>, attrs: &Props) -> Self {
        let text = |key: &str| attrs.str(key).filter(|s| !s.is_empty()).map(str::to_owned);
        Self {
            user_id: user_id.into(),
            real_name: text("realname"),
            display_name: text("name"),
            icon_url: text("iconurl"),
            guest: attrs.flag("guest"),
        }
    }

    /// Best name to show for this user.
    pub fn name(&self) -> &str {
        self.real_name.as_deref().or(self.display_name.as_deref()).unwrap_or(&self.user_id)
    }
}

/// Text (or attachment) message from a channel member.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    /// Server message id.
    pub message_id: MessageId,
    /// Sender.
    pub sender: ChannelUser,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Sent by this client's user.
    pub mine: bool,
    /// Same sender as the previous channel message.
    pub series: bool,
    /// Text content.
    pub text: Option<String>,
    /// Displayable attachment.
    pub attachment: Option<FileInfo>,
}

/// Interactive widget message from an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeMessage {
    /// Server message id.
    pub message_id: MessageId,
    /// Sender.
    pub sender: ChannelUser,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Sent by this client's user.
    pub mine: bool,
    /// Same sender as the previous channel message.
    pub series: bool,
    /// Buttons and selects.
    pub content: Vec<ComposeContent>,
}

/// "User is typing" indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingMessage {
    /// Typing user.
    pub user: ChannelUser,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Locally generated notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaMessage {
    /// Notice text.
    pub text: String,
    /// Title of a close button, for the "conversation ended" notice.
    pub close_button: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Entry in the chat history.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    /// Text or attachment.
    Text(TextMessage),
    /// Compose widgets.
    Compose(ComposeMessage),
    /// Typing indicator.
    Typing(TypingMessage),
    /// Local notice.
    Meta(MetaMessage),
}

impl ChatMessage {
    /// Milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::Text(m) => m.timestamp_ms,
            Self::Compose(m) => m.timestamp_ms,
            Self::Typing(m) => m.timestamp_ms,
            Self::Meta(m) => m.timestamp_ms,
        }
    }

    /// Server id of channel messages.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Text(m) => Some(&m.message_id),
            Self::Compose(m) => Some(&m.message_id),
            Self::Typing(_) | Self::Meta(_) => None,
        }
    }

    /// Sender of channel messages.
    pub fn sender(&self) -> Option<&ChannelUser> {
        match self {
            Self::Text(m) => Some(&m.sender),
            Self::Compose(m) => Some(&m.sender),
            Self::Typing(_) | Self::Meta(_) => None,
        }
    }

    /// Series flag of channel messages.
    pub fn series(&self) -> Option<bool> {
        match self {
            Self::Text(m) => Some(m.series),
            Self::Compose(m) => Some(m.series),
            Self::Typing(_) | Self::Meta(_) => None,
        }
    }

    /// Whether this is a text or compose message.
    pub fn is_channel_message(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Compose(_))
    }

    fn set_series(&mut self, series: bool) {
        match self {
            Self::Text(m) => m.series = series,
            Self::Compose(m) => m.series = series,
            Self::Typing(_) | Self::Meta(_) => {},
        }
    }

    /// Newest-first ordering: `Less` means `self` is newer.
    fn newest_first(&self, other: &Self) -> Ordering {
        let empty = MessageId::default();
        let key = |m: &Self| (m.timestamp_ms(), m.message_id().cloned().unwrap_or_else(|| empty.clone()));
        key(other).cmp(&key(self))
    }
}

/// Newest-first chat history.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    entries: Vec<ChatMessage>,
}

impl ChatHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the position given by timestamp order.
    ///
    /// Returns the index, or `None` if a channel message with the same id is
    /// already present.
    pub fn insert(&mut self, message: ChatMessage) -> Option<usize> {
        if let Some(id) = message.message_id()
            && self.contains_message(id)
        {
            return None;
        }

        let index = self.entries.partition_point(|e| e.newest_first(&message) == Ordering::Less);
        let channel_message = message.is_channel_message();
        self.entries.insert(index, message);

        if channel_message {
            self.recompute_series(index);
            if let Some(newer) = self.entries[..index].iter().rposition(ChatMessage::is_channel_message) {
                self.recompute_series(newer);
            }
        }
        Some(index)
    }

    /// Remove the entry at `index`.
    pub fn remove(&mut self, index: usize) -> Option<ChatMessage> {
        if index >= self.entries.len() {
            return None;
        }
        let removed = self.entries.remove(index);
        if removed.is_channel_message()
            && let Some(newer) = self.entries[..index].iter().rposition(ChatMessage::is_channel_message)
        {
            self.recompute_series(newer);
        }
        Some(removed)
    }

    /// Index of the typing indicator for `user_id`.
    pub fn typing_index(&self, user_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, ChatMessage::Typing(t) if t.user.user_id == user_id))
    }

    /// Whether a channel message with `id` is present.
    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|e| e.message_id() == Some(id))
    }

    /// Refresh the attachment URL of the message carrying the described file.
    ///
    /// Returns the index of the updated entry.
    pub fn apply_file_description(&mut self, description: &FileDescription) -> Option<usize> {
        let index = self.entries.iter().position(|e| {
            matches!(e, ChatMessage::Text(t) if t.attachment.as_ref().is_some_and(|a| a.file_id == description.file_id))
        })?;
        if let ChatMessage::Text(text) = &mut self.entries[index]
            && let Some(attachment) = text.attachment.as_mut()
        {
            attachment.apply(description);
        }
        Some(index)
    }

    /// Entries, newest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.entries
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&ChatMessage> {
        self.entries.get(index)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn recompute_series(&mut self, index: usize) {
        let sender = self.entries[index].sender().map(|s| s.user_id.clone());
        let previous = self.entries[index + 1..]
            .iter()
            .find(|e| e.is_channel_message())
            .and_then(ChatMessage::sender)
            .map(|s| s.user_id.as_str());
        let series = sender.is_some() && sender.as_deref() == previous;
        self.entries[index].set_series(series);
    }
}
