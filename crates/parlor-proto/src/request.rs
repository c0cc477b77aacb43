//! Outbound requests.
//!
//! Each [`Request`] variant maps to exactly one backend action. The session
//! layer hands requests to the transport together with the [`ActionId`] it
//! allocated; [`Request::into_parts`] produces the property header (with
//! `action` and `action_id` filled in) and the payload frames.

use serde_json::Value;

use crate::{event::ActionId, message::MessageType, payload::Payload, props::Props};

/// Message type filter subscribed to on session creation.
pub const SUBSCRIBED_MESSAGE_TYPES: &str = "ninchat.com/*";

/// Parameters of the initial session creation
///
/// Sent by the transport when it opens the connection rather than as a
/// regular request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionParams {
    /// Configuration key identifying the site.
    pub config_key: String,
    /// Site secret, if the site requires one.
    pub site_secret: Option<String>,
    /// Display name for the guest user.
    pub user_name: Option<String>,
}

impl SessionParams {
    /// Property map for the `create_session` action.
    pub fn to_props(&self) -> Props {
        let mut props = Props::new()
            .with("action", "create_session")
            .with("message_types", Value::from(vec![SUBSCRIBED_MESSAGE_TYPES]));
        if !self.config_key.is_empty() {
            props.set("config_key", self.config_key.as_str());
        }
        if let Some(secret) = &self.site_secret {
            props.set("site_secret", secret.as_str());
        }
        if let Some(name) = &self.user_name {
            props.set("user_attrs", Props::new().with("name", name.as_str()));
        }
        props
    }
}

/// Request sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// List the queues of a realm.
    DescribeRealmQueues {
        /// Realm to list.
        realm_id: String,
        /// Restrict to these queues, all when `None`.
        queue_ids: Option<Vec<String>>,
    },
    /// Enter a queue as audience.
    RequestAudience {
        /// Queue to enter.
        queue_id: String,
        /// Pre-chat metadata shown to the agent.
        metadata: Option<Props>,
    },
    /// Leave a queue before being accepted.
    LeaveQueue {
        /// Queue to leave.
        queue_id: String,
    },
    /// Post a message to a channel.
    SendMessage {
        /// Target channel.
        channel_id: String,
        /// Message type.
        message_type: MessageType,
        /// Body frames.
        payload: Payload,
        /// Time-to-live in seconds.
        ttl: Option<u32>,
        /// Explicit recipient list; `Some(vec![])` means nobody but the channel log.
        recipients: Option<Vec<String>>,
        /// Whether the server may fold the message into history.
        fold: Option<bool>,
    },
    /// Update own member attributes (typing indicator).
    UpdateMember {
        /// Channel.
        channel_id: String,
        /// Own user id.
        user_id: String,
        /// Typing flag.
        writing: bool,
    },
    /// Load older channel messages.
    LoadHistory {
        /// Channel.
        channel_id: String,
    },
    /// Describe an uploaded file.
    DescribeFile {
        /// File id.
        file_id: String,
    },
    /// Request STUN/TURN servers.
    BeginIce,
    /// Leave a channel.
    PartChannel {
        /// Channel.
        channel_id: String,
    },
    /// Delete the guest user, ending the session server-side.
    DeleteUser,
}

impl Request {
    /// Backend action name.
    pub fn action(&self) -> &'static str {
        match self {
            Self::DescribeRealmQueues { .. } => "describe_realm_queues",
            Self::RequestAudience { .. } => "request_audience",
            Self::LeaveQueue { .. } => "leave_queue",
            Self::SendMessage { .. } => "send_message",
            Self::UpdateMember { .. } => "update_member",
            Self::LoadHistory { .. } => "load_history",
            Self::DescribeFile { .. } => "describe_file",
            Self::BeginIce => "begin_ice",
            Self::PartChannel { .. } => "part_channel",
            Self::DeleteUser => "delete_user",
        }
    }

    /// Property header and payload frames for the transport.
    pub fn into_parts(self, action_id: ActionId) -> (Props, Payload) {
        let mut props =
            Props::new().with("action", self.action()).with("action_id", action_id.get());
        let mut payload = Payload::empty();

        match self {
            Self::DescribeRealmQueues { realm_id, queue_ids } => {
                props.set("realm_id", realm_id);
                if let Some(ids) = queue_ids {
                    props.set("queue_ids", ids);
                }
            },
            Self::RequestAudience { queue_id, metadata } => {
                props.set("queue_id", queue_id);
                if let Some(metadata) = metadata {
                    props.set("audience_metadata", metadata);
                }
            },
            Self::LeaveQueue { queue_id } => props.set("queue_id", queue_id),
            Self::SendMessage { channel_id, message_type, payload: body, ttl, recipients, fold } => {
                props.set("channel_id", channel_id);
                props.set("message_type", message_type.as_str());
                if let Some(ttl) = ttl {
                    props.set("message_ttl", ttl);
                }
                if let Some(recipients) = recipients {
                    props.set("message_recipient_ids", recipients);
                }
                if let Some(fold) = fold {
                    props.set("message_fold", fold);
                }
                payload = body;
            },
            Self::UpdateMember { channel_id, user_id, writing } => {
                props.set("channel_id", channel_id);
                props.set("user_id", user_id);
                props.set("member_attrs", Props::new().with("writing", writing));
            },
            Self::LoadHistory { channel_id } | Self::PartChannel { channel_id } => {
                props.set("channel_id", channel_id);
            },
            Self::DescribeFile { file_id } => props.set("file_id", file_id),
            Self::BeginIce | Self::DeleteUser => {},
        }

        (props, payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::payloads::RatingBody;

    #[test]
    fn session_params() {
        let props = SessionParams {
            config_key: "cfg".into(),
            site_secret: Some("s3cret".into()),
            user_name: Some("Guest".into()),
        }
        .to_props();
        assert_eq!(props.str("action"), Some("create_session"));
        assert_eq!(props.str("site_secret"), Some("s3cret"));
        assert_eq!(props.object("user_attrs").unwrap().str("name"), Some("Guest"));
        assert_eq!(props.get("message_types"), Some(&json!(["ninchat.com/*"])));
    }

    #[test]
    fn rating_message_has_empty_recipients() {
        let request = Request::SendMessage {
            channel_id: "ch".into(),
            message_type: MessageType::Metadata,
            payload: Payload::json(&RatingBody::new(1)).unwrap(),
            ttl: None,
            recipients: Some(Vec::new()),
            fold: Some(false),
        };
        let (props, payload) = request.into_parts(ActionId::new(3));
        assert_eq!(props.str("action"), Some("send_message"));
        assert_eq!(props.int("action_id"), Some(3));
        assert_eq!(props.str("message_type"), Some("ninchat.com/metadata"));
        assert_eq!(props.get("message_recipient_ids"), Some(&json!([])));
        assert_eq!(props.get("message_fold"), Some(&json!(false)));
        assert!(!props.contains("message_ttl"));
        assert_eq!(payload.len(), 1);
    }

    #[test]
    fn update_member_nests_attrs() {
        let (props, _) = Request::UpdateMember { channel_id: "ch".into(), user_id: "me".into(), writing: true }
            .into_parts(ActionId::new(1));
        assert!(props.object("member_attrs").unwrap().flag("writing"));
    }

    #[test]
    fn list_all_queues_omits_ids() {
        let (props, _) = Request::DescribeRealmQueues { realm_id: "r".into(), queue_ids: None }
            .into_parts(ActionId::new(1));
        assert_eq!(props.str("realm_id"), Some("r"));
        assert!(!props.contains("queue_ids"));
    }
}
