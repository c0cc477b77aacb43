//! Session orchestrator.
//!
//! Owns the session lifecycle, queue membership, channel membership, chat
//! history and request correlation. Uses the action pattern: intent methods
//! and [`Session::handle`] queue [`SessionAction`]s for the driver, which
//! drains them with [`Session::take_actions`].
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ open ┌─────────┐ session_created ┌──────┐ join_queue ┌────────┐
//! │ Idle │─────>│ Opening │────────────────>│ Open │───────────>│ Queued │
//! └──────┘      └─────────┘                 └──────┘<───────────└────────┘
//!                    │                          │   leave_queue     │
//!                    │ failure/timeout          │                   │ channel_joined
//!                    ↓                          ↓ close_chat        ↓
//!               ┌────────┐  ack/timeout   ┌─────────┐ close_chat ┌───────────┐
//!               │ Closed │<───────────────│ Closing │<───────────│ InChannel │
//!               └────────┘                └─────────┘            └───────────┘
//! ```
//!
//! `join_queue` from `InChannel` parts the current channel and queues again.
//! `Closed` is terminal; a new chat needs a new `Session`.
//!
//! # Event routing
//!
//! Chat messages, history entries, queue updates and channel lifecycle events
//! pass through the [`ReorderBuffer`] and are dispatched on the next
//! [`Session::tick`] at or after its deadline. Correlated replies (queue
//! listings, file descriptions, ICE servers, errors) are dispatched at once.
//!
//! # Invariants
//!
//! - Every allocated request produces exactly one `SessionAction::Complete`,
//!   from a reply, a timeout, a transport failure or session closure.
//! - Closing fails every pending request with `SessionError::Closed` before
//!   anything else is dispatched.
//! - After `Closed`, inbound events are dropped and the buffer never releases.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use bytes::Bytes;
use parlor_proto::{
    ActionId, EventKind, InboundEvent, MessageId, MessageType, Payload, ProtocolError, Request,
    SessionParams,
    payloads::{ComposeContent, FileAttrs, FileRef, IceServers, MessageBody, RatingBody, RtcSignal, UiActionBody},
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, trace, warn};

use crate::{
    action::{Reply, SessionAction, SessionNotification},
    chat::{ChannelUser, ChatHistory, ChatMessage, ComposeMessage, MetaMessage, TextMessage, TypingMessage},
    config::SessionConfig,
    env::Environment,
    error::SessionError,
    event::{SessionEvent, UploadedFile},
    file::{FileDescription, FileInfo},
    queue::Queue,
    reorder::{InboundMessage, ReorderBuffer},
    signaling::{CallState, SignalStep, Signaling},
};

/// Notice inserted when an agent accepts the guest.
pub const TEXT_QUEUE_ACCEPTED: &str = "Audience in queue {{queue}} accepted.";

/// Notice inserted when the agent closes the conversation.
pub const TEXT_CONVERSATION_ENDED: &str = "Conversation ended";

/// Close button title on the conversation-ended notice.
pub const TEXT_CLOSE_CHAT: &str = "Close chat";

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet opened.
    Idle,
    /// Connecting and creating the session.
    Opening,
    /// Session created, not in a queue.
    Open,
    /// Waiting in a queue.
    Queued,
    /// Chatting in a channel.
    InChannel,
    /// Close requested, waiting for the server.
    Closing,
    /// Terminal.
    Closed,
}

/// Conversation rating sent when finishing a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rating {
    /// Satisfied.
    Happy,
    /// Indifferent.
    Neutral,
    /// Dissatisfied.
    Sad,
}

impl Rating {
    /// Wire value.
    pub fn value(self) -> i8 {
        match self {
            Self::Happy => 1,
            Self::Neutral => 0,
            Self::Sad => -1,
        }
    }
}

/// Handle for a message handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Request resolved when the server echoes the message.
    pub request: ActionId,
    /// Local sequence number, increasing per session, for optimistic ordering.
    pub local_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingKind {
    Open,
    ListQueues,
    JoinQueue { queue_id: String },
    LeaveQueue,
    SendMessage { close_after: bool },
    Upload,
    SendFile,
    UpdateMember,
    LoadHistory,
    DescribeFile,
    BeginIce,
    PartChannel { then_join: Option<ActionId> },
}

impl PendingKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ListQueues => "list queues",
            Self::JoinQueue { .. } => "join queue",
            Self::LeaveQueue => "leave queue",
            Self::SendMessage { .. } => "send message",
            Self::Upload => "upload",
            Self::SendFile => "send file",
            Self::UpdateMember => "update member",
            Self::LoadHistory => "load history",
            Self::DescribeFile => "describe file",
            Self::BeginIce => "begin ice",
            Self::PartChannel { .. } => "part channel",
        }
    }

    /// Whether an event of `kind` answers this request.
    fn accepts(&self, kind: EventKind) -> bool {
        match self {
            Self::Open => kind == EventKind::SessionCreated,
            Self::ListQueues => kind == EventKind::RealmQueuesFound,
            Self::JoinQueue { .. } => matches!(kind, EventKind::AudienceEnqueued | EventKind::ChannelJoined),
            Self::LeaveQueue => true,
            Self::SendMessage { .. } | Self::SendFile => kind == EventKind::MessageReceived,
            Self::Upload => false,
            Self::UpdateMember => kind == EventKind::ChannelMemberUpdated,
            Self::LoadHistory => matches!(kind, EventKind::HistoryResults | EventKind::MessageReceived),
            Self::DescribeFile => kind == EventKind::FileFound,
            Self::BeginIce => kind == EventKind::IceBegun,
            Self::PartChannel { .. } => matches!(kind, EventKind::ChannelParted | EventKind::ChannelFound),
        }
    }
}

#[derive(Debug)]
struct PendingRequest<I> {
    kind: PendingKind,
    timeout: Option<Duration>,
    deadline: Option<I>,
}

#[derive(Debug)]
struct Closing<I> {
    request: ActionId,
    deadline: I,
    reason: String,
}

/// Events routed through the reordering buffer.
fn is_ordered(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::MessageReceived
            | EventKind::HistoryResults
            | EventKind::AudienceEnqueued
            | EventKind::QueueUpdated
            | EventKind::ChannelJoined
            | EventKind::ChannelUpdated
    )
}

/// Session orchestrator
///
/// Generic over the [`Environment`] so tests drive time by hand.
#[derive(Debug)]
pub struct Session<E: Environment> {
    env: E,
    config: SessionConfig,
    state: SessionState,
    user_id: Option<String>,
    session_id: Option<String>,
    queues: Vec<Queue>,
    audience_queues: Vec<Queue>,
    current_queue: Option<String>,
    channel_id: Option<String>,
    background_channel_id: Option<String>,
    channel_closed: bool,
    users: HashMap<String, ChannelUser>,
    history: ChatHistory,
    buffer: ReorderBuffer<E::Instant>,
    pending: BTreeMap<ActionId, PendingRequest<E::Instant>>,
    closing: Option<Closing<E::Instant>>,
    signaling: Signaling,
    next_action_id: u64,
    next_local_seq: u64,
    outbox: Vec<SessionAction>,
}

impl<E: Environment> Session<E> {
    /// Create an idle session
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidConfig` if the configuration fails validation.
    pub fn new(env: E, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            env,
            buffer: ReorderBuffer::new(config.reorder_delay),
            config,
            state: SessionState::Idle,
            user_id: None,
            session_id: None,
            queues: Vec::new(),
            audience_queues: Vec::new(),
            current_queue: None,
            channel_id: None,
            background_channel_id: None,
            channel_closed: false,
            users: HashMap::new(),
            history: ChatHistory::new(),
            pending: BTreeMap::new(),
            closing: None,
            signaling: Signaling::new(),
            next_action_id: 1,
            next_local_seq: 1,
            outbox: Vec::new(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Own user id, once the session is created.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Server session id, once the session is created.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Queues from the last listing.
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Queues offered to the guest.
    pub fn audience_queues(&self) -> &[Queue] {
        &self.audience_queues
    }

    /// Queue currently waited in.
    pub fn current_queue(&self) -> Option<&str> {
        self.current_queue.as_deref()
    }

    /// Active channel.
    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// Members of the active channel.
    pub fn users(&self) -> &HashMap<String, ChannelUser> {
        &self.users
    }

    /// Chat history of the active channel.
    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Call state of the active channel.
    pub fn call_state(&self) -> CallState {
        self.signaling.state()
    }

    /// Signaling machine, for inspecting the current exchange.
    pub fn signaling(&self) -> &Signaling {
        &self.signaling
    }

    /// Number of requests awaiting resolution.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Drain queued actions.
    pub fn take_actions(&mut self) -> Vec<SessionAction> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest time the driver must call [`tick`](Self::tick).
    pub fn next_deadline(&self) -> Option<E::Instant> {
        let requests = self.pending.values().filter_map(|p| p.deadline);
        self.buffer
            .next_deadline()
            .into_iter()
            .chain(requests)
            .chain(self.closing.as_ref().map(|c| c.deadline))
            .min()
    }

    /// Connect and create the session.
    ///
    /// Resolves with `Reply::SessionCreated`. Failure is terminal: the session
    /// moves to `Closed`.
    pub fn open(&mut self) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::Idle], "open session")?;

        let id = self.allocate_id();
        let params = SessionParams {
            config_key: self.config.config_key.clone(),
            site_secret: self.config.site_secret.clone(),
            user_name: self.config.user_name.clone(),
        };
        info!(address = %self.config.server_address, "opening session");

        self.state = SessionState::Opening;
        self.track(id, PendingKind::Open, Some(self.config.connect_timeout));
        self.outbox.push(SessionAction::Connect {
            address: self.config.server_address.clone(),
            user_agent: self.config.user_agent(),
            params: params.to_props(),
        });
        Ok(id)
    }

    /// List realm queues; `None` lists all of them.
    ///
    /// Resolves with `Reply::Queues` and replaces the known queue list.
    pub fn list_queues(&mut self, queue_ids: Option<Vec<String>>) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::Open, SessionState::Queued, SessionState::InChannel], "list queues")?;
        let request = Request::DescribeRealmQueues { realm_id: self.config.realm_id.clone(), queue_ids };
        Ok(self.request(request, PendingKind::ListQueues))
    }

    /// Enter a queue.
    ///
    /// Resolves with `Reply::Done` once the server confirms the guest is
    /// queued (or accepted). Position updates and the final channel join are
    /// reported as notifications. From `InChannel` the current channel is
    /// parted first; if the part fails the join fails and the session stays
    /// in that channel.
    pub fn join_queue(&mut self, queue_id: impl Into<String>) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::Open, SessionState::InChannel], "join queue")?;
        let queue_id = queue_id.into();

        let transfer_from = if self.state == SessionState::InChannel { self.channel_id.take() } else { None };
        self.state = SessionState::Queued;
        self.current_queue = Some(queue_id.clone());
        info!(%queue_id, transfer = transfer_from.is_some(), "joining queue");

        let Some(channel_id) = transfer_from else {
            let request = Request::RequestAudience { queue_id: queue_id.clone(), metadata: self.config.audience_metadata.clone() };
            return Ok(self.request(request, PendingKind::JoinQueue { queue_id }));
        };

        let steps = self.signaling.reset("queue transfer");
        self.run_steps(steps);
        self.background_channel_id = Some(channel_id.clone());
        let join = self.allocate_id();
        self.track(join, PendingKind::JoinQueue { queue_id }, self.config.request_timeout);
        self.request(Request::PartChannel { channel_id }, PendingKind::PartChannel { then_join: Some(join) });
        Ok(join)
    }

    /// Leave the queue before being accepted.
    ///
    /// The session returns to `Open` immediately; a join still awaiting
    /// confirmation is resolved with `SessionError::Cancelled`.
    pub fn leave_queue(&mut self) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::Queued], "leave queue")?;
        let queue_id = self.current_queue.take().unwrap_or_default();
        self.state = SessionState::Open;
        info!(%queue_id, "leaving queue");

        let joins: Vec<ActionId> = self
            .pending
            .iter()
            .filter(|(_, p)| matches!(p.kind, PendingKind::JoinQueue { .. } | PendingKind::PartChannel { .. }))
            .map(|(id, _)| *id)
            .collect();
        for id in joins {
            self.resolve(id, Err(SessionError::Cancelled));
        }
        Ok(self.request(Request::LeaveQueue { queue_id }, PendingKind::LeaveQueue))
    }

    /// Send a message of any type to the active channel.
    ///
    /// `body` becomes a single JSON payload frame. Resolves with
    /// `Reply::Sent` when the server echoes the message back.
    pub fn send_message<T: Serialize + ?Sized>(
        &mut self,
        message_type: MessageType,
        body: &T,
    ) -> Result<OutgoingMessage, SessionError> {
        self.require(&[SessionState::InChannel], "send message")?;
        let payload = Payload::json(body)?;
        self.post(message_type, payload, PendingKind::SendMessage { close_after: false })
    }

    /// Send a text message.
    pub fn send_text(&mut self, text: impl Into<String>) -> Result<OutgoingMessage, SessionError> {
        self.send_message(MessageType::Text, &MessageBody::text(text))
    }

    /// Report a click on a compose element.
    pub fn send_ui_action(&mut self, target: &ComposeContent) -> Result<OutgoingMessage, SessionError> {
        let target = serde_json::to_value(target).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        self.send_message(MessageType::UiAction, &UiActionBody::click(target))
    }

    /// Upload a file and post it to the channel.
    ///
    /// Queues `SessionAction::Upload`; once the driver reports
    /// `SessionEvent::UploadFinished` the file message is sent. Upload
    /// failures resolve with `SessionError::Upload`.
    pub fn send_file(&mut self, file_name: impl Into<String>, data: Bytes) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::InChannel], "send file")?;
        let id = self.allocate_id();
        self.track(id, PendingKind::Upload, None);
        self.outbox.push(SessionAction::Upload { request: id, file_name: file_name.into(), data });
        Ok(id)
    }

    /// Request a fresh URL for a file. Resolves with `Reply::File`.
    pub fn describe_file(&mut self, file_id: impl Into<String>) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::Open, SessionState::Queued, SessionState::InChannel], "describe file")?;
        Ok(self.request(Request::DescribeFile { file_id: file_id.into() }, PendingKind::DescribeFile))
    }

    /// Re-describe attachments whose URL is missing or about to expire.
    ///
    /// Each `Reply::File` updates the matching history entry in place.
    pub fn refresh_stale_attachments(&mut self) -> Result<Vec<ActionId>, SessionError> {
        self.require(&[SessionState::InChannel], "refresh attachments")?;
        let now_ms = self.env.wall_clock_millis();
        let stale: Vec<String> = self
            .history
            .messages()
            .iter()
            .filter_map(|m| match m {
                ChatMessage::Text(text) => text.attachment.as_ref(),
                _ => None,
            })
            .filter(|file| file.needs_refresh(now_ms))
            .map(|file| file.file_id.clone())
            .collect();
        Ok(stale
            .into_iter()
            .map(|file_id| self.request(Request::DescribeFile { file_id }, PendingKind::DescribeFile))
            .collect())
    }

    /// Update the typing indicator shown to the agent.
    pub fn set_writing(&mut self, writing: bool) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::InChannel], "update typing state")?;
        let (Some(channel_id), Some(user_id)) = (self.channel_id.clone(), self.user_id.clone()) else {
            return Err(self.invalid("update typing state"));
        };
        Ok(self.request(Request::UpdateMember { channel_id, user_id, writing }, PendingKind::UpdateMember))
    }

    /// Load older messages into the history.
    pub fn load_history(&mut self) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::InChannel], "load history")?;
        let channel_id = self.channel_id.clone().unwrap_or_default();
        Ok(self.request(Request::LoadHistory { channel_id }, PendingKind::LoadHistory))
    }

    /// Request STUN/TURN servers. Resolves with `Reply::IceServers`.
    pub fn begin_ice(&mut self) -> Result<ActionId, SessionError> {
        self.require(&[SessionState::Open, SessionState::Queued, SessionState::InChannel], "begin ICE")?;
        Ok(self.request(Request::BeginIce, PendingKind::BeginIce))
    }

    /// Invite the channel to a call.
    pub fn dial(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionState::InChannel], "dial")?;
        let steps = self.signaling.dial()?;
        self.run_steps(steps);
        Ok(())
    }

    /// Accept (`true`) or decline an incoming call.
    pub fn pick_up(&mut self, answer: bool) -> Result<(), SessionError> {
        self.require(&[SessionState::InChannel], "pick up")?;
        let steps = self.signaling.pick_up(answer)?;
        self.run_steps(steps);
        Ok(())
    }

    /// End the current call.
    pub fn hang_up(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionState::InChannel], "hang up")?;
        let steps = self.signaling.hang_up()?;
        self.run_steps(steps);
        Ok(())
    }

    /// Forward the engine's local offer or answer to the peer.
    pub fn send_rtc_description(&mut self, kind: MessageType, sdp: Map<String, Value>) -> Result<(), SessionError> {
        self.require(&[SessionState::InChannel], "send session description")?;
        let steps = self.signaling.local_description(kind, sdp)?;
        self.run_steps(steps);
        Ok(())
    }

    /// Forward a local ICE candidate to the peer.
    pub fn send_rtc_candidate(&mut self, candidate: Map<String, Value>) -> Result<(), SessionError> {
        self.require(&[SessionState::InChannel], "send ICE candidate")?;
        let steps = self.signaling.local_candidate(candidate)?;
        self.run_steps(steps);
        Ok(())
    }

    /// Close the chat.
    ///
    /// Pending requests fail with `SessionError::Closed` at once and the
    /// session enters `Closing`. `SessionEnded` follows when the server
    /// acknowledges or the close timeout forces it.
    pub fn close_chat(&mut self) -> Result<(), SessionError> {
        self.require(
            &[SessionState::Opening, SessionState::Open, SessionState::Queued, SessionState::InChannel],
            "close chat",
        )?;
        self.begin_close("closed by user");
        Ok(())
    }

    /// Optionally rate the conversation, then close.
    pub fn finish_chat(&mut self, rating: Option<Rating>) -> Result<(), SessionError> {
        self.require(
            &[SessionState::Opening, SessionState::Open, SessionState::Queued, SessionState::InChannel],
            "finish chat",
        )?;
        match rating {
            Some(rating) if self.state == SessionState::InChannel => {
                info!(rating = rating.value(), "rating conversation");
                let payload = Payload::json(&RatingBody::new(rating.value()))?;
                self.post(MessageType::Metadata, payload, PendingKind::SendMessage { close_after: true })?;
            },
            _ => self.begin_close("chat finished"),
        }
        Ok(())
    }

    /// Override the timeout of a pending request; `None` waits until close.
    ///
    /// Returns `false` if the request is no longer pending.
    pub fn set_request_timeout(&mut self, request: ActionId, timeout: Option<Duration>) -> bool {
        let now = self.env.now();
        match self.pending.get_mut(&request) {
            Some(pending) => {
                pending.timeout = timeout;
                pending.deadline = timeout.map(|t| now + t);
                true
            },
            None => false,
        }
    }

    /// Process an input and return the resulting actions.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        match event {
            SessionEvent::Inbound(event) => self.on_inbound(event),
            SessionEvent::ConnectFailed { reason } | SessionEvent::TransportClosed { reason } => {
                self.on_transport_lost(&reason);
            },
            SessionEvent::Superseded => self.on_transport_lost("connection superseded"),
            SessionEvent::SendFailed { action_id, reason } => self.on_send_failed(action_id, reason),
            SessionEvent::UploadFinished { request, result } => self.on_upload_finished(request, result),
            SessionEvent::PeerConnectionReady => {
                let steps = self.signaling.on_peer_ready();
                self.run_steps(steps);
            },
            SessionEvent::PeerConnectionFailed { reason } => {
                let steps = self.signaling.on_peer_failed(&reason);
                self.run_steps(steps);
            },
        }
        self.take_actions()
    }

    /// Advance time: release buffered events, expire requests, force a
    /// stalled close.
    pub fn tick(&mut self, now: E::Instant) -> Vec<SessionAction> {
        for message in self.buffer.release(now) {
            if !self.is_live() {
                break;
            }
            if let Some(kind) = message.event.kind() {
                self.dispatch(kind, message.event);
            }
        }

        let expired: Vec<ActionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|deadline| now >= deadline))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(after) = self.pending.get(&id).and_then(|p| p.timeout) else { continue };
            warn!(%id, ?after, "request timed out");
            self.resolve(id, Err(SessionError::Timeout { after }));
        }

        if let Some(closing) = &self.closing
            && now >= closing.deadline
        {
            warn!("close not acknowledged, forcing");
            let reason = closing.reason.clone();
            self.finish_close(&reason);
        }

        self.take_actions()
    }

    fn on_inbound(&mut self, event: InboundEvent) {
        let Some(name) = event.name().map(str::to_owned) else {
            warn!("event without a kind, dropping");
            return;
        };
        let action_id = event.action_id();
        let Some(kind) = EventKind::from_name(&name) else {
            if let Some(id) = action_id
                && self.pending.get(&id).is_some_and(|p| p.kind == PendingKind::LeaveQueue)
            {
                self.resolve(id, Ok(Reply::Done));
                return;
            }
            warn!(event = %name, "unknown event kind, dropping");
            return;
        };
        trace!(%kind, ?action_id, "inbound event");

        match self.state {
            SessionState::Idle | SessionState::Closed => {
                debug!(%kind, state = ?self.state, "session not live, dropping event");
                return;
            },
            SessionState::Closing => {
                let acknowledges = self.closing.as_ref().is_some_and(|c| Some(c.request) == action_id);
                if acknowledges {
                    let reason = self.closing.as_ref().map(|c| c.reason.clone()).unwrap_or_default();
                    self.finish_close(&reason);
                } else {
                    debug!(%kind, "closing, dropping event");
                }
                return;
            },
            _ => {},
        }

        if kind == EventKind::ConnectionSuperseded {
            self.on_transport_lost("connection superseded");
        } else if is_ordered(kind) {
            let now = self.env.now();
            self.buffer.submit(InboundMessage::new(event, now), now);
        } else {
            self.dispatch(kind, event);
        }
    }

    fn dispatch(&mut self, kind: EventKind, event: InboundEvent) {
        let action_id = event.action_id();
        let result = match kind {
            EventKind::SessionCreated => {
                self.on_session_created(&event);
                Ok(())
            },
            EventKind::Error => {
                self.on_error(&event);
                Ok(())
            },
            EventKind::RealmQueuesFound => self.on_realm_queues(&event),
            EventKind::AudienceEnqueued | EventKind::QueueUpdated => self.on_queue_event(kind, &event),
            EventKind::ChannelJoined => self.on_channel_joined(&event),
            EventKind::ChannelUpdated => self.on_channel_updated(&event),
            EventKind::ChannelParted => self.on_channel_parted(&event),
            EventKind::ChannelFound => {
                self.acknowledge(&event, kind);
                Ok(())
            },
            EventKind::ChannelMemberUpdated => self.on_member_updated(&event),
            EventKind::UserUpdated => self.on_user_updated(&event),
            EventKind::UserDeleted => self.on_user_deleted(&event),
            EventKind::MessageReceived | EventKind::HistoryResults => self.on_message(kind, &event),
            EventKind::FileFound => self.on_file_found(&event),
            EventKind::IceBegun => {
                self.on_ice_begun(&event);
                Ok(())
            },
            EventKind::ConnectionSuperseded => {
                self.on_transport_lost("connection superseded");
                Ok(())
            },
        };

        if let Err(error) = result {
            warn!(%kind, %error, "dropping malformed event");
            if let Some(id) = action_id
                && self.pending.contains_key(&id)
            {
                self.resolve(id, Err(error.into()));
            }
        }
    }

    fn on_session_created(&mut self, event: &InboundEvent) {
        if self.state != SessionState::Opening {
            warn!(state = ?self.state, "session_created outside opening, ignoring");
            return;
        }
        let user_id = match event.props.require_str("user_id") {
            Ok(user_id) => user_id.to_owned(),
            Err(error) => {
                warn!(%error, "malformed session_created");
                self.fail_open(error.into());
                return;
            },
        };
        let session_id = event.props.str("session_id").map(str::to_owned);

        info!(%user_id, "session created");
        self.user_id = Some(user_id.clone());
        self.session_id.clone_from(&session_id);
        self.state = SessionState::Open;

        if let Some(id) = self.find_pending(|k| *k == PendingKind::Open) {
            self.resolve(id, Ok(Reply::SessionCreated { user_id, session_id }));
        }
    }

    fn on_error(&mut self, event: &InboundEvent) {
        let error_type = event.props.str("error_type").unwrap_or("unknown").to_owned();
        let reason = event.props.str("error_reason").map(str::to_owned);
        let error = SessionError::Rejected { error_type: error_type.clone(), reason };

        match event.action_id() {
            Some(id) if self.pending.contains_key(&id) => self.resolve(id, Err(error)),
            Some(id) => warn!(%id, %error_type, "error for unknown request"),
            None if self.state == SessionState::Opening => {
                warn!(%error_type, "session creation failed");
                self.fail_open(error);
            },
            None => warn!(%error_type, "server error"),
        }
    }

    fn on_realm_queues(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        let Some(id) = self.correlated(event, EventKind::RealmQueuesFound) else {
            return Ok(());
        };
        let queues = Queue::list_from_props(&event.props)?;
        debug!(count = queues.len(), "realm queues listed");
        self.audience_queues = Queue::audience(&queues, self.config.audience_queues.as_deref());
        self.queues.clone_from(&queues);
        self.resolve(id, Ok(Reply::Queues(queues)));
        Ok(())
    }

    fn on_queue_event(&mut self, kind: EventKind, event: &InboundEvent) -> Result<(), ProtocolError> {
        let queue_id = event.props.require_str("queue_id")?.to_owned();
        let position = u32::try_from(event.props.require_int("queue_position")?).unwrap_or(0);

        if self.state != SessionState::Queued || self.current_queue.as_deref() != Some(queue_id.as_str()) {
            debug!(%queue_id, "update for a queue we are not in, dropping");
            return Ok(());
        }

        if kind == EventKind::AudienceEnqueued {
            if let Some(id) = event.action_id()
                && self.pending.get(&id).is_some_and(|p| matches!(p.kind, PendingKind::JoinQueue { .. }))
            {
                self.resolve(id, Ok(Reply::Done));
            }
            info!(%queue_id, position, "queued");
            self.notify(SessionNotification::QueueJoined { queue_id: queue_id.clone(), position });
        }
        debug!(%queue_id, position, "queue position");
        self.notify(SessionNotification::QueueProgress { queue_id, position });
        Ok(())
    }

    fn on_channel_joined(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        if self.state != SessionState::Queued {
            warn!(state = ?self.state, "channel_joined outside a queue, ignoring");
            return Ok(());
        }
        let channel_id = event.props.require_str("channel_id")?.to_owned();
        let queue_id = self.current_queue.take();

        info!(%channel_id, ?queue_id, "joined channel");
        self.state = SessionState::InChannel;
        self.channel_id = Some(channel_id.clone());
        self.background_channel_id = None;
        self.channel_closed = false;

        self.users.clear();
        if let Some(members) = event.props.object("channel_members") {
            for (user_id, member) in members.objects() {
                let attrs = member.object("user_attrs").unwrap_or_default();
                self.users.insert(user_id.to_owned(), ChannelUser::from_attrs(user_id, &attrs));
            }
        }

        if let Some(id) = self.find_pending(|k| matches!(k, PendingKind::JoinQueue { .. })) {
            self.resolve(id, Ok(Reply::Done));
        }

        self.history.clear();
        self.notify(SessionNotification::HistoryReset);
        self.notify(SessionNotification::ChannelJoined { channel_id, queue_id: queue_id.clone() });

        let queue_name = queue_id
            .as_deref()
            .map(|id| self.queues.iter().find(|q| q.id == id).map_or(id, |q| q.name.as_str()))
            .unwrap_or_default()
            .to_owned();
        let text = self.config.translate(TEXT_QUEUE_ACCEPTED, &[("queue", queue_name.as_str())]);
        self.add_meta(text, None);
        Ok(())
    }

    fn on_channel_updated(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        let channel_id = event.props.require_str("channel_id")?;
        let attrs = event.props.object("channel_attrs").unwrap_or_default();
        if !(attrs.flag("closed") || attrs.flag("suspended")) {
            return Ok(());
        }
        if self.channel_id.as_deref() == Some(channel_id) {
            let channel_id = channel_id.to_owned();
            self.mark_channel_closed(channel_id);
        } else {
            debug!(%channel_id, "inactive channel closed");
        }
        Ok(())
    }

    fn on_channel_parted(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        let channel_id = event.props.require_str("channel_id")?.to_owned();
        if let Some(id) = event.action_id()
            && self.pending.get(&id).is_some_and(|p| p.kind.accepts(EventKind::ChannelParted))
        {
            self.resolve(id, Ok(Reply::Done));
        } else if self.channel_id.as_deref() == Some(channel_id.as_str()) {
            info!(%channel_id, "removed from channel");
            self.mark_channel_closed(channel_id.clone());
        }
        if self.background_channel_id.as_deref() == Some(channel_id.as_str()) {
            self.background_channel_id = None;
        }
        Ok(())
    }

    fn on_member_updated(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        let channel_id = event.props.require_str("channel_id")?;
        let user_id = event.props.require_str("user_id")?.to_owned();
        let active = self.channel_id.as_deref() == Some(channel_id);
        self.acknowledge(event, EventKind::ChannelMemberUpdated);

        if !active || self.user_id.as_deref() == Some(user_id.as_str()) {
            return Ok(());
        }

        let writing = event.props.object("member_attrs").is_some_and(|attrs| attrs.flag("writing"));
        match (writing, self.history.typing_index(&user_id)) {
            (true, None) => {
                let user = self.user(&user_id);
                let timestamp_ms = self.env.wall_clock_millis();
                self.add_message(ChatMessage::Typing(TypingMessage { user, timestamp_ms }));
            },
            (false, Some(index)) => {
                self.history.remove(index);
                self.notify(SessionNotification::MessageRemoved { index });
            },
            _ => {},
        }
        Ok(())
    }

    fn on_user_updated(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        let user_id = event.props.require_str("user_id")?;
        let attrs = event.props.object("user_attrs").unwrap_or_default();
        trace!(%user_id, "user updated");
        self.users.insert(user_id.to_owned(), ChannelUser::from_attrs(user_id, &attrs));
        Ok(())
    }

    fn on_user_deleted(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        let user_id = event.props.require_str("user_id")?;
        if self.user_id.as_deref() == Some(user_id) {
            info!("own user deleted by server");
            self.finish_close("user deleted");
        } else {
            self.users.remove(user_id);
        }
        Ok(())
    }

    fn on_message(&mut self, kind: EventKind, event: &InboundEvent) -> Result<(), ProtocolError> {
        let action_id = event.action_id();
        let message_id = event.message_id();

        // Empty history pages carry no message
        if kind == EventKind::HistoryResults && !event.props.contains("message_type") {
            self.acknowledge_message(action_id, message_id);
            return Ok(());
        }

        let type_name = event.props.require_str("message_type")?;
        let Some(message_type) = MessageType::parse(type_name) else {
            debug!(message_type = %type_name, "unsupported message type, ignoring");
            self.acknowledge_message(action_id, message_id);
            return Ok(());
        };

        let channel_id = event.props.str("channel_id");
        let in_active = channel_id.is_some() && channel_id == self.channel_id.as_deref();
        let in_background = channel_id.is_some() && channel_id == self.background_channel_id.as_deref();
        if !in_active && !in_background {
            debug!(?channel_id, "message outside known channels, dropping");
            self.acknowledge_message(action_id, message_id);
            return Ok(());
        }

        let sender_id = event.props.require_str("message_user_id")?.to_owned();

        if message_type.is_rtc() {
            if action_id.is_some() {
                trace!(%message_type, "own signaling echo");
            } else if in_active {
                let mut signals: Vec<RtcSignal> = event.payload.decode_all()?;
                if signals.is_empty() {
                    signals.push(RtcSignal::default());
                }
                let sender = self.user(&sender_id);
                for signal in signals {
                    let steps = self.signaling.on_signal(message_type, sender.clone(), signal);
                    self.run_steps(steps);
                }
            }
            self.acknowledge_message(action_id, message_id);
            return Ok(());
        }

        let mine = self.user_id.as_deref() == Some(sender_id.as_str());
        let Some(sender) = self.users.get(&sender_id).cloned().or_else(|| mine.then(|| self.user(&sender_id)))
        else {
            warn!(%sender_id, "message from unknown user, dropping");
            self.acknowledge_message(action_id, message_id);
            return Ok(());
        };
        let timestamp_ms = (event.props.require_float("message_time")? * 1000.0) as u64;

        let entry = match message_type {
            MessageType::Text | MessageType::File => {
                let bodies: Vec<MessageBody> = event.payload.decode_all()?;
                let attachment = bodies
                    .iter()
                    .flat_map(|body| &body.files)
                    .map(|file| FileInfo::new(file.file_id.clone(), &file.file_attrs))
                    .find(FileInfo::is_displayable);
                let texts: Vec<String> =
                    bodies.into_iter().filter_map(|body| body.text).filter(|t| !t.is_empty()).collect();
                let text = (!texts.is_empty()).then(|| texts.join("\n"));
                (text.is_some() || attachment.is_some()).then(|| {
                    ChatMessage::Text(TextMessage {
                        message_id: message_id.clone(),
                        sender,
                        timestamp_ms,
                        mine,
                        series: false,
                        text,
                        attachment,
                    })
                })
            },
            MessageType::Compose => {
                let content: Vec<ComposeContent> =
                    event.payload.decode_all::<Vec<ComposeContent>>()?.into_iter().flatten().collect();
                if content.iter().all(ComposeContent::is_supported) {
                    Some(ChatMessage::Compose(ComposeMessage {
                        message_id: message_id.clone(),
                        sender,
                        timestamp_ms,
                        mine,
                        series: false,
                        content,
                    }))
                } else {
                    debug!("compose message with unsupported elements, discarding");
                    None
                }
            },
            _ => {
                trace!(%message_type, "informational message, not shown");
                None
            },
        };

        if let Some(entry) = entry {
            self.add_message(entry);
        }
        self.acknowledge_message(action_id, message_id);
        Ok(())
    }

    fn on_file_found(&mut self, event: &InboundEvent) -> Result<(), ProtocolError> {
        let Some(id) = self.correlated(event, EventKind::FileFound) else {
            return Ok(());
        };
        let description = FileDescription::from_props(&event.props)?;
        self.history.apply_file_description(&description);
        self.resolve(id, Ok(Reply::File(description)));
        Ok(())
    }

    fn on_ice_begun(&mut self, event: &InboundEvent) {
        let Some(id) = self.correlated(event, EventKind::IceBegun) else {
            return;
        };
        let servers = IceServers::from_props(&event.props);
        debug!(stun = servers.stun.len(), turn = servers.turn.len(), "ICE servers granted");
        let steps = self.signaling.on_ice_servers(id, servers.clone());
        self.resolve(id, Ok(Reply::IceServers(servers)));
        self.run_steps(steps);
    }

    fn on_transport_lost(&mut self, reason: &str) {
        match self.state {
            SessionState::Closed => {},
            SessionState::Opening => {
                warn!(reason, "connection failed while opening");
                self.fail_open(SessionError::Transport(reason.to_owned()));
            },
            _ => {
                warn!(reason, "connection lost");
                self.finish_close(reason);
            },
        }
    }

    fn on_send_failed(&mut self, action_id: ActionId, reason: String) {
        if self.closing.as_ref().is_some_and(|c| c.request == action_id) {
            self.finish_close(&reason);
            return;
        }
        if self.pending.contains_key(&action_id) {
            warn!(%action_id, %reason, "send failed");
            self.resolve(action_id, Err(SessionError::Transport(reason)));
        } else {
            debug!(%action_id, "send failure for resolved request");
        }
    }

    fn on_upload_finished(&mut self, request: ActionId, result: Result<UploadedFile, String>) {
        if !self.pending.get(&request).is_some_and(|p| p.kind == PendingKind::Upload) {
            debug!(%request, "upload result for unknown request, dropping");
            return;
        }
        let file = match result {
            Ok(file) => file,
            Err(reason) => {
                warn!(%request, %reason, "upload failed");
                self.resolve(request, Err(SessionError::Upload(reason)));
                return;
            },
        };
        if self.state != SessionState::InChannel {
            let error = self.invalid("send file");
            self.resolve(request, Err(error));
            return;
        }

        let body = MessageBody {
            text: None,
            files: vec![FileRef {
                file_id: file.file_id,
                file_attrs: FileAttrs { name: file.name, mime_type: file.mime_type, size: file.size },
            }],
        };
        let payload = match Payload::json(&body) {
            Ok(payload) => payload,
            Err(error) => {
                self.resolve(request, Err(error.into()));
                return;
            },
        };
        self.pending.remove(&request);
        self.send_message_request(request, MessageType::File, payload, PendingKind::SendFile);
    }

    fn begin_close(&mut self, reason: &str) {
        info!(state = ?self.state, reason, "closing session");
        let delete_user =
            matches!(self.state, SessionState::Open | SessionState::Queued | SessionState::InChannel);

        let steps = self.signaling.reset(reason);
        self.run_steps(steps);
        self.fail_all_pending();
        let discarded = self.buffer.stop();
        if discarded > 0 {
            debug!(discarded, "discarded buffered events");
        }
        self.state = SessionState::Closing;

        if delete_user {
            let id = self.allocate_id();
            let deadline = self.env.now() + self.config.close_timeout;
            self.outbox.push(SessionAction::Send { action_id: id, request: Request::DeleteUser });
            self.closing = Some(Closing { request: id, deadline, reason: reason.to_owned() });
        } else {
            self.finish_close(reason);
        }
    }

    fn finish_close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        info!(reason, "session closed");
        let steps = self.signaling.reset(reason);
        self.run_steps(steps);
        self.fail_all_pending();
        self.buffer.stop();

        self.state = SessionState::Closed;
        self.closing = None;
        self.current_queue = None;
        self.channel_id = None;
        self.background_channel_id = None;

        self.outbox.push(SessionAction::Disconnect);
        self.notify(SessionNotification::SessionEnded { reason: reason.to_owned() });
    }

    fn fail_open(&mut self, error: SessionError) {
        match self.find_pending(|k| *k == PendingKind::Open) {
            Some(id) => self.resolve(id, Err(error)),
            None => self.finish_close(&error.to_string()),
        }
    }

    fn mark_channel_closed(&mut self, channel_id: String) {
        if self.channel_closed {
            return;
        }
        info!(%channel_id, "conversation ended");
        self.channel_closed = true;
        let steps = self.signaling.reset("channel closed");
        self.run_steps(steps);

        let text = self.config.translate(TEXT_CONVERSATION_ENDED, &[]);
        let close_button = self.config.translate(TEXT_CLOSE_CHAT, &[]);
        self.add_meta(text, Some(close_button));
        self.notify(SessionNotification::ChannelClosed { channel_id });
    }

    fn run_steps(&mut self, steps: Vec<SignalStep>) {
        for step in steps {
            match step {
                SignalStep::Send { kind, signal } => {
                    let sent = Payload::json(&signal)
                        .map_err(SessionError::from)
                        .and_then(|payload| self.post(kind, payload, PendingKind::SendMessage { close_after: false }));
                    if let Err(error) = sent {
                        debug!(%kind, %error, "signal not sent");
                    }
                },
                SignalStep::BeginIce => {
                    let id = self.request(Request::BeginIce, PendingKind::BeginIce);
                    self.signaling.ice_requested(id);
                },
                SignalStep::Rtc(command) => self.outbox.push(SessionAction::Rtc(command)),
                SignalStep::Notify(notification) => self.notify(notification),
            }
        }
    }

    /// Resolve a pending request exactly once and run its follow-up.
    fn resolve(&mut self, id: ActionId, outcome: Result<Reply, SessionError>) {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(%id, "request already resolved");
            return;
        };
        match &outcome {
            Ok(_) => debug!(%id, request = pending.kind.name(), "request completed"),
            Err(error) => debug!(%id, request = pending.kind.name(), %error, "request failed"),
        }
        let failure = outcome.as_ref().err().cloned();
        self.outbox.push(SessionAction::Complete { request: id, outcome });

        match (pending.kind, failure) {
            (PendingKind::Open, Some(error)) => self.finish_close(&error.to_string()),
            (PendingKind::JoinQueue { queue_id }, Some(_)) => {
                if self.state == SessionState::Queued && self.current_queue.as_deref() == Some(queue_id.as_str()) {
                    info!(%queue_id, "queue request failed");
                    self.state = SessionState::Open;
                    self.current_queue = None;
                }
            },
            (PendingKind::BeginIce, Some(error)) => {
                let steps = self.signaling.on_ice_failed(id, &error.to_string());
                self.run_steps(steps);
            },
            (PendingKind::PartChannel { then_join: Some(join) }, None) => self.send_deferred_join(join),
            (PendingKind::PartChannel { then_join: Some(join) }, Some(error)) => {
                let cancelled = error == SessionError::Cancelled;
                self.resolve(join, Err(error));
                if !cancelled {
                    self.restore_transfer_channel();
                }
            },
            (PendingKind::SendMessage { close_after: true }, _) => {
                if self.is_open() {
                    self.begin_close("chat finished");
                }
            },
            _ => {},
        }
    }

    fn fail_all_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending requests");
        }
        for id in pending.into_keys() {
            self.outbox.push(SessionAction::Complete { request: id, outcome: Err(SessionError::Closed) });
        }
    }

    /// The channel was never parted, so the guest is still in it.
    fn restore_transfer_channel(&mut self) {
        if !matches!(self.state, SessionState::Open | SessionState::Queued) {
            return;
        }
        let Some(channel_id) = self.background_channel_id.take() else { return };
        info!(%channel_id, "queue transfer failed, staying in channel");
        self.state = SessionState::InChannel;
        self.current_queue = None;
        self.channel_id = Some(channel_id);
    }

    fn send_deferred_join(&mut self, join: ActionId) {
        let Some(PendingKind::JoinQueue { queue_id }) = self.pending.get(&join).map(|p| p.kind.clone()) else {
            return;
        };
        let request = Request::RequestAudience { queue_id, metadata: self.config.audience_metadata.clone() };
        self.outbox.push(SessionAction::Send { action_id: join, request });
    }

    fn post(&mut self, message_type: MessageType, payload: Payload, kind: PendingKind) -> Result<OutgoingMessage, SessionError> {
        if self.state != SessionState::InChannel {
            return Err(self.invalid("send message"));
        }
        let id = self.allocate_id();
        let local_seq = self.next_local_seq;
        self.next_local_seq += 1;
        self.send_message_request(id, message_type, payload, kind);
        Ok(OutgoingMessage { request: id, local_seq })
    }

    fn send_message_request(&mut self, id: ActionId, message_type: MessageType, payload: Payload, kind: PendingKind) {
        let channel_id = self.channel_id.clone().unwrap_or_default();
        let ttl = message_type.is_rtc().then_some(self.config.rtc_message_ttl);
        let (recipients, fold) =
            if message_type == MessageType::Metadata { (Some(Vec::new()), Some(false)) } else { (None, None) };
        trace!(%id, %message_type, "sending message");
        self.track(id, kind, self.config.request_timeout);
        self.outbox.push(SessionAction::Send {
            action_id: id,
            request: Request::SendMessage { channel_id, message_type, payload, ttl, recipients, fold },
        });
    }

    fn request(&mut self, request: Request, kind: PendingKind) -> ActionId {
        let id = self.allocate_id();
        trace!(%id, action = request.action(), "sending request");
        self.track(id, kind, self.config.request_timeout);
        self.outbox.push(SessionAction::Send { action_id: id, request });
        id
    }

    fn track(&mut self, id: ActionId, kind: PendingKind, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| self.env.now() + t);
        self.pending.insert(id, PendingRequest { kind, timeout, deadline });
    }

    fn allocate_id(&mut self) -> ActionId {
        let id = ActionId::new(self.next_action_id);
        self.next_action_id += 1;
        id
    }

    /// The pending request `event` answers, if any.
    fn correlated(&self, event: &InboundEvent, kind: EventKind) -> Option<ActionId> {
        let Some(id) = event.action_id() else {
            warn!(%kind, "reply without action id, dropping");
            return None;
        };
        match self.pending.get(&id) {
            Some(pending) if pending.kind.accepts(kind) => Some(id),
            Some(pending) => {
                warn!(%id, %kind, request = pending.kind.name(), "reply does not match request, dropping");
                None
            },
            None => {
                warn!(%id, %kind, "unexpected response, no matching request");
                None
            },
        }
    }

    /// Resolve the request `event` answers, if it is pending.
    fn acknowledge(&mut self, event: &InboundEvent, kind: EventKind) {
        if let Some(id) = event.action_id()
            && self.pending.get(&id).is_some_and(|p| p.kind.accepts(kind))
        {
            self.resolve(id, Ok(Reply::Done));
        }
    }

    fn acknowledge_message(&mut self, action_id: Option<ActionId>, message_id: MessageId) {
        let Some(id) = action_id else { return };
        let reply = match self.pending.get(&id).map(|p| &p.kind) {
            Some(PendingKind::SendMessage { .. } | PendingKind::SendFile) => Reply::Sent { message_id },
            Some(PendingKind::LoadHistory) => Reply::Done,
            _ => return,
        };
        self.resolve(id, Ok(reply));
    }

    fn find_pending(&self, predicate: impl Fn(&PendingKind) -> bool) -> Option<ActionId> {
        self.pending.iter().find(|(_, p)| predicate(&p.kind)).map(|(id, _)| *id)
    }

    fn add_message(&mut self, message: ChatMessage) {
        match self.history.insert(message) {
            Some(index) => self.notify(SessionNotification::MessageAdded { index }),
            None => debug!("duplicate message, not inserted"),
        }
    }

    fn add_meta(&mut self, text: String, close_button: Option<String>) {
        let timestamp_ms = self.env.wall_clock_millis();
        self.add_message(ChatMessage::Meta(MetaMessage { text, close_button, timestamp_ms }));
    }

    fn user(&self, user_id: &str) -> ChannelUser {
        self.users.get(user_id).cloned().unwrap_or_else(|| ChannelUser {
            user_id: user_id.to_owned(),
            display_name: if self.user_id.as_deref() == Some(user_id) { self.config.user_name.clone() } else { None },
            ..ChannelUser::default()
        })
    }

    fn notify(&mut self, notification: SessionNotification) {
        self.outbox.push(SessionAction::Notify(notification));
    }

    fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open | SessionState::Queued | SessionState::InChannel)
    }

    fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    fn require(&self, allowed: &[SessionState], operation: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.state) { Ok(()) } else { Err(self.invalid(operation)) }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState { state: self.state, operation }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        ops::{Add, Sub},
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    };

    use parlor_proto::Props;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct Ms(u64);

    impl Add<Duration> for Ms {
        type Output = Ms;

        fn add(self, rhs: Duration) -> Ms {
            Ms(self.0 + u64::try_from(rhs.as_millis()).unwrap())
        }
    }

    impl Sub for Ms {
        type Output = Duration;

        fn sub(self, rhs: Ms) -> Duration {
            Duration::from_millis(self.0.saturating_sub(rhs.0))
        }
    }

    #[derive(Debug, Clone, Default)]
    struct ManualEnv(Arc<AtomicU64>);

    impl ManualEnv {
        fn advance(&self, by: Duration) -> Ms {
            let by = u64::try_from(by.as_millis()).unwrap();
            Ms(self.0.fetch_add(by, Ordering::SeqCst) + by)
        }
    }

    impl Environment for ManualEnv {
        type Instant = Ms;

        fn now(&self) -> Ms {
            Ms(self.0.load(Ordering::SeqCst))
        }

        fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn wall_clock_millis(&self) -> u64 {
            1_700_000_000_000 + self.0.load(Ordering::SeqCst)
        }
    }

    const REORDER: Duration = Duration::from_millis(200);

    fn event(name: &str, props: serde_json::Value) -> InboundEvent {
        let serde_json::Value::Object(map) = props else { panic!("props must be an object") };
        InboundEvent::new(Props::from(map).with("event", name), Payload::empty())
    }

    fn message(id: &str, sender: &str, text: &str) -> InboundEvent {
        let mut event = event(
            "message_received",
            json!({
                "channel_id": "ch-1",
                "message_id": id,
                "message_type": "ninchat.com/text",
                "message_user_id": sender,
                "message_time": 1_800_000_000.0,
            }),
        );
        event.payload = Payload::json(&MessageBody::text(text)).unwrap();
        event
    }

    fn config() -> SessionConfig {
        SessionConfig { user_name: Some("Guest".into()), ..SessionConfig::new("wss://chat.example", "realm-1") }
    }

    fn completions(actions: &[SessionAction]) -> Vec<(ActionId, Result<Reply, SessionError>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Complete { request, outcome } => Some((*request, outcome.clone())),
                _ => None,
            })
            .collect()
    }

    fn notifications(actions: &[SessionAction]) -> Vec<SessionNotification> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Notify(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    fn sent(actions: &[SessionAction]) -> Vec<(ActionId, Request)> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Send { action_id, request } => Some((*action_id, request.clone())),
                _ => None,
            })
            .collect()
    }

    fn opened() -> (ManualEnv, Session<ManualEnv>) {
        let env = ManualEnv::default();
        let mut session = Session::new(env.clone(), config()).unwrap();
        session.open().unwrap();
        session.take_actions();
        session.handle(SessionEvent::Inbound(event("session_created", json!({"user_id": "guest-1"}))));
        (env, session)
    }

    fn in_channel() -> (ManualEnv, Session<ManualEnv>) {
        let (env, mut session) = opened();
        session.join_queue("q-1").unwrap();
        session.take_actions();
        session.handle(SessionEvent::Inbound(event(
            "channel_joined",
            json!({
                "channel_id": "ch-1",
                "channel_members": {
                    "agent-1": {"user_attrs": {"realname": "Alice"}},
                    "guest-1": {"user_attrs": {"name": "Guest", "guest": true}},
                },
            }),
        )));
        session.tick(env.advance(REORDER));
        assert_eq!(session.state(), SessionState::InChannel);
        (env, session)
    }

    #[test]
    fn open_connects_and_resolves_on_session_created() {
        let env = ManualEnv::default();
        let mut session = Session::new(env, config()).unwrap();
        let id = session.open().unwrap();

        let actions = session.take_actions();
        assert!(matches!(&actions[..], [SessionAction::Connect { address, .. }] if address == "wss://chat.example"));
        assert_eq!(session.state(), SessionState::Opening);

        let actions = session.handle(SessionEvent::Inbound(event(
            "session_created",
            json!({"user_id": "guest-1", "session_id": "s-9"}),
        )));
        assert_eq!(
            completions(&actions),
            [(id, Ok(Reply::SessionCreated { user_id: "guest-1".into(), session_id: Some("s-9".into()) }))]
        );
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.user_id(), Some("guest-1"));
    }

    #[test]
    fn invalid_config_rejected() {
        let result = Session::new(ManualEnv::default(), SessionConfig::default());
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn open_twice_is_invalid_state() {
        let (_env, mut session) = opened();
        assert!(matches!(session.open(), Err(SessionError::InvalidState { state: SessionState::Open, .. })));
    }

    #[test]
    fn connect_failure_closes_session() {
        let mut session = Session::new(ManualEnv::default(), config()).unwrap();
        let id = session.open().unwrap();
        session.take_actions();

        let actions = session.handle(SessionEvent::ConnectFailed { reason: "refused".into() });
        assert_eq!(completions(&actions), [(id, Err(SessionError::Transport("refused".into())))]);
        assert!(actions.contains(&SessionAction::Disconnect));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn open_times_out() {
        let env = ManualEnv::default();
        let mut session = Session::new(env.clone(), config()).unwrap();
        let id = session.open().unwrap();
        session.take_actions();

        assert_eq!(session.next_deadline(), Some(Ms(30_000)));
        assert!(completions(&session.tick(env.advance(Duration::from_secs(29)))).is_empty());

        let actions = session.tick(env.advance(Duration::from_secs(1)));
        assert_eq!(
            completions(&actions),
            [(id, Err(SessionError::Timeout { after: Duration::from_secs(30) }))]
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn uncorrelated_error_while_opening_fails_open() {
        let mut session = Session::new(ManualEnv::default(), config()).unwrap();
        let id = session.open().unwrap();
        session.take_actions();

        let actions = session.handle(SessionEvent::Inbound(event("error", json!({"error_type": "realm_not_found"}))));
        assert_eq!(
            completions(&actions),
            [(id, Err(SessionError::Rejected { error_type: "realm_not_found".into(), reason: None }))]
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn list_queues_applies_audience_filter() {
        let env = ManualEnv::default();
        let config = SessionConfig { audience_queues: Some(vec!["q-2".into()]), ..config() };
        let mut session = Session::new(env, config).unwrap();
        session.open().unwrap();
        session.handle(SessionEvent::Inbound(event("session_created", json!({"user_id": "guest-1"}))));

        let id = session.list_queues(None).unwrap();
        let sends = sent(&session.take_actions());
        assert!(matches!(&sends[..], [(sent_id, Request::DescribeRealmQueues { queue_ids: None, .. })] if *sent_id == id));

        let actions = session.handle(SessionEvent::Inbound(event(
            "realm_queues_found",
            json!({
                "action_id": id.get(),
                "realm_queues": {
                    "q-1": {"queue_attrs": {"name": "Sales"}},
                    "q-2": {"queue_attrs": {"name": "Support"}},
                },
            }),
        )));
        let done = completions(&actions);
        assert!(matches!(&done[..], [(_, Ok(Reply::Queues(queues)))] if queues.len() == 2));
        assert_eq!(session.queues().len(), 2);
        assert_eq!(session.audience_queues().len(), 1);
        assert_eq!(session.audience_queues()[0].name, "Support");
    }

    #[test]
    fn reply_without_matching_request_is_dropped() {
        let (_env, mut session) = opened();
        let actions = session.handle(SessionEvent::Inbound(event(
            "realm_queues_found",
            json!({"action_id": 99, "realm_queues": {}}),
        )));
        assert!(completions(&actions).is_empty());
    }

    #[test]
    fn join_reports_position_then_channel() {
        let (env, mut session) = opened();
        let id = session.join_queue("q-1").unwrap();
        assert_eq!(session.state(), SessionState::Queued);
        session.take_actions();

        session.handle(SessionEvent::Inbound(event(
            "audience_enqueued",
            json!({"action_id": id.get(), "queue_id": "q-1", "queue_position": 5}),
        )));
        let actions = session.tick(env.advance(REORDER));
        assert_eq!(completions(&actions), [(id, Ok(Reply::Done))]);
        assert_eq!(
            notifications(&actions),
            [
                SessionNotification::QueueJoined { queue_id: "q-1".into(), position: 5 },
                SessionNotification::QueueProgress { queue_id: "q-1".into(), position: 5 },
            ]
        );

        session.handle(SessionEvent::Inbound(event("queue_updated", json!({"queue_id": "q-1", "queue_position": 2}))));
        session.handle(SessionEvent::Inbound(event("queue_updated", json!({"queue_id": "q-9", "queue_position": 1}))));
        let actions = session.tick(env.advance(REORDER));
        assert_eq!(
            notifications(&actions),
            [SessionNotification::QueueProgress { queue_id: "q-1".into(), position: 2 }]
        );

        session.handle(SessionEvent::Inbound(event("channel_joined", json!({"channel_id": "ch-1"}))));
        let actions = session.tick(env.advance(REORDER));
        let notes = notifications(&actions);
        assert!(notes.contains(&SessionNotification::ChannelJoined {
            channel_id: "ch-1".into(),
            queue_id: Some("q-1".into())
        }));
        assert_eq!(session.state(), SessionState::InChannel);
        assert_eq!(session.channel_id(), Some("ch-1"));

        let Some(ChatMessage::Meta(meta)) = session.history().get(0) else { panic!("expected accept notice") };
        assert_eq!(meta.text, "Audience in queue q-1 accepted.");
    }

    #[test]
    fn rejected_join_returns_to_open() {
        let (_env, mut session) = opened();
        let id = session.join_queue("q-1").unwrap();
        let actions = session.handle(SessionEvent::Inbound(event(
            "error",
            json!({"action_id": id.get(), "error_type": "queue_is_closed"}),
        )));
        assert_eq!(
            completions(&actions),
            [(id, Err(SessionError::Rejected { error_type: "queue_is_closed".into(), reason: None }))]
        );
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.current_queue(), None);
    }

    #[test]
    fn leave_queue_cancels_join() {
        let (_env, mut session) = opened();
        let join = session.join_queue("q-1").unwrap();
        session.take_actions();

        let leave = session.leave_queue().unwrap();
        let actions = session.take_actions();
        assert_eq!(completions(&actions), [(join, Err(SessionError::Cancelled))]);
        assert!(matches!(&sent(&actions)[..], [(_, Request::LeaveQueue { queue_id })] if queue_id == "q-1"));
        assert_eq!(session.state(), SessionState::Open);

        let actions = session.handle(SessionEvent::Inbound(event("queue_left", json!({"action_id": leave.get()}))));
        assert_eq!(completions(&actions), [(leave, Ok(Reply::Done))]);
    }

    #[test]
    fn send_outside_channel_is_invalid_state() {
        let (_env, mut session) = opened();
        assert!(matches!(
            session.send_text("hello"),
            Err(SessionError::InvalidState { state: SessionState::Open, .. })
        ));
        assert_eq!(session.pending_requests(), 0);
    }

    #[test]
    fn sent_message_resolves_on_echo() {
        let (env, mut session) = in_channel();
        let outgoing = session.send_text("hello").unwrap();
        let second = session.send_text("again").unwrap();
        assert!(second.local_seq > outgoing.local_seq);
        session.take_actions();

        let mut echo = message("100", "guest-1", "hello");
        echo.props.set("action_id", outgoing.request.get());
        session.handle(SessionEvent::Inbound(echo));
        let actions = session.tick(env.advance(REORDER));

        assert_eq!(
            completions(&actions),
            [(outgoing.request, Ok(Reply::Sent { message_id: MessageId::new("100") }))]
        );
        let Some(ChatMessage::Text(text)) = session.history().get(0) else { panic!("expected text") };
        assert!(text.mine);
        assert_eq!(text.text.as_deref(), Some("hello"));
    }

    #[test]
    fn messages_released_in_id_order_with_series() {
        let (env, mut session) = in_channel();
        session.handle(SessionEvent::Inbound(message("12", "agent-1", "third")));
        session.handle(SessionEvent::Inbound(message("10", "agent-1", "first")));
        session.handle(SessionEvent::Inbound(message("11", "agent-1", "second")));
        let actions = session.tick(env.advance(REORDER));

        let added = notifications(&actions)
            .into_iter()
            .filter(|n| matches!(n, SessionNotification::MessageAdded { .. }))
            .count();
        assert_eq!(added, 3);

        let texts: Vec<_> = session
            .history()
            .messages()
            .iter()
            .filter_map(|m| match m {
                ChatMessage::Text(t) => Some((t.text.clone().unwrap_or_default(), t.series)),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            [("third".to_owned(), true), ("second".to_owned(), true), ("first".to_owned(), false)]
        );
    }

    #[test]
    fn message_from_unknown_user_dropped() {
        let (env, mut session) = in_channel();
        let before = session.history().len();
        session.handle(SessionEvent::Inbound(message("50", "stranger", "hi")));
        session.tick(env.advance(REORDER));
        assert_eq!(session.history().len(), before);
    }

    #[test]
    fn rating_sends_metadata_then_closes() {
        let (env, mut session) = in_channel();
        session.finish_chat(Some(Rating::Happy)).unwrap();
        let actions = session.take_actions();
        let sends = sent(&actions);
        let [(id, Request::SendMessage { message_type, recipients, fold, payload, .. })] = &sends[..] else {
            panic!("expected one metadata message, got {sends:?}");
        };
        assert_eq!(*message_type, MessageType::Metadata);
        assert_eq!(recipients.as_deref(), Some(&[][..]));
        assert_eq!(*fold, Some(false));
        let body: serde_json::Value = payload.decode_first().unwrap();
        assert_eq!(body, json!({"data": {"rating": 1}}));

        let mut echo = event(
            "message_received",
            json!({
                "action_id": id.get(),
                "channel_id": "ch-1",
                "message_id": "200",
                "message_type": "ninchat.com/metadata",
                "message_user_id": "guest-1",
                "message_time": 1.0,
            }),
        );
        echo.payload = payload.clone();
        session.handle(SessionEvent::Inbound(echo));
        let actions = session.tick(env.advance(REORDER));
        assert!(matches!(&sent(&actions)[..], [(_, Request::DeleteUser)]));
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn close_fails_pending_then_waits_for_ack() {
        let (env, mut session) = in_channel();
        let load = session.load_history().unwrap();
        let ice = session.begin_ice().unwrap();
        session.take_actions();

        session.close_chat().unwrap();
        let actions = session.take_actions();
        assert_eq!(completions(&actions), [(load, Err(SessionError::Closed)), (ice, Err(SessionError::Closed))]);
        let sends = sent(&actions);
        let [(delete, Request::DeleteUser)] = &sends[..] else { panic!("expected delete_user") };
        assert_eq!(session.state(), SessionState::Closing);

        // Events for other requests are dropped while closing
        let actions = session.handle(SessionEvent::Inbound(message("300", "agent-1", "late")));
        assert!(actions.is_empty());
        assert!(session.tick(env.advance(REORDER)).is_empty());

        let actions = session.handle(SessionEvent::Inbound(event(
            "user_deleted",
            json!({"action_id": delete.get(), "user_id": "guest-1"}),
        )));
        assert!(actions.contains(&SessionAction::Disconnect));
        assert!(notifications(&actions).iter().any(|n| matches!(n, SessionNotification::SessionEnded { .. })));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.close_chat(), Err(SessionError::InvalidState { .. })));
    }

    #[test]
    fn close_forced_after_timeout() {
        let (env, mut session) = in_channel();
        session.close_chat().unwrap();
        session.take_actions();

        assert!(session.tick(env.advance(Duration::from_secs(4))).is_empty());
        let actions = session.tick(env.advance(Duration::from_secs(1)));
        assert!(actions.contains(&SessionAction::Disconnect));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn channel_closed_notice_added_once() {
        let (env, mut session) = in_channel();
        let closed = || event("channel_updated", json!({"channel_id": "ch-1", "channel_attrs": {"closed": true}}));
        session.handle(SessionEvent::Inbound(closed()));
        session.handle(SessionEvent::Inbound(closed()));
        let actions = session.tick(env.advance(REORDER));

        let closed_notes = notifications(&actions)
            .into_iter()
            .filter(|n| matches!(n, SessionNotification::ChannelClosed { .. }))
            .count();
        assert_eq!(closed_notes, 1);
        let Some(ChatMessage::Meta(meta)) = session.history().get(0) else { panic!("expected notice") };
        assert_eq!(meta.text, "Conversation ended");
        assert_eq!(meta.close_button.as_deref(), Some("Close chat"));
    }

    #[test]
    fn typing_indicator_added_and_removed() {
        let (_env, mut session) = in_channel();
        let writing = |on: bool| {
            event(
                "channel_member_updated",
                json!({"channel_id": "ch-1", "user_id": "agent-1", "member_attrs": {"writing": on}}),
            )
        };
        let actions = session.handle(SessionEvent::Inbound(writing(true)));
        assert!(matches!(&notifications(&actions)[..], [SessionNotification::MessageAdded { .. }]));
        assert!(session.history().typing_index("agent-1").is_some());

        let actions = session.handle(SessionEvent::Inbound(writing(false)));
        assert!(matches!(&notifications(&actions)[..], [SessionNotification::MessageRemoved { .. }]));
        assert!(session.history().typing_index("agent-1").is_none());
    }

    #[test]
    fn upload_failure_resolves_request() {
        let (_env, mut session) = in_channel();
        let id = session.send_file("cat.png", Bytes::from_static(b"png")).unwrap();
        let actions = session.take_actions();
        assert!(matches!(&actions[..], [SessionAction::Upload { request, .. }] if *request == id));

        let actions = session.handle(SessionEvent::UploadFinished { request: id, result: Err("too large".into()) });
        assert_eq!(completions(&actions), [(id, Err(SessionError::Upload("too large".into())))]);
    }

    #[test]
    fn upload_success_posts_file_message() {
        let (_env, mut session) = in_channel();
        let id = session.send_file("cat.png", Bytes::from_static(b"png")).unwrap();
        session.take_actions();

        let file = UploadedFile { file_id: "f-1".into(), name: "cat.png".into(), mime_type: "image/png".into(), size: 3 };
        let actions = session.handle(SessionEvent::UploadFinished { request: id, result: Ok(file) });
        let sends = sent(&actions);
        let [(sent_id, Request::SendMessage { message_type: MessageType::File, payload, .. })] = &sends[..] else {
            panic!("expected file message, got {sends:?}");
        };
        assert_eq!(*sent_id, id);
        let body: MessageBody = payload.decode_first().unwrap();
        assert_eq!(body.files[0].file_id, "f-1");
    }

    #[test]
    fn stale_attachment_described_and_updated() {
        let (env, mut session) = in_channel();
        let body = MessageBody {
            text: None,
            files: vec![FileRef {
                file_id: "f-7".into(),
                file_attrs: FileAttrs { name: "cat.png".into(), mime_type: "image/png".into(), size: 10 },
            }],
        };
        let mut file = message("40", "agent-1", "");
        file.props.set("message_type", "ninchat.com/file");
        file.payload = Payload::json(&body).unwrap();
        session.handle(SessionEvent::Inbound(file));
        session.tick(env.advance(REORDER));

        let ids = session.refresh_stale_attachments().unwrap();
        let sends = sent(&session.take_actions());
        assert!(matches!(&sends[..], [(id, Request::DescribeFile { file_id })] if *id == ids[0] && file_id == "f-7"));

        let actions = session.handle(SessionEvent::Inbound(event(
            "file_found",
            json!({
                "action_id": ids[0].get(),
                "file_id": "f-7",
                "file_url": "https://files.example/f-7",
                "url_expiry": 1_900_000_000.0,
            }),
        )));
        assert!(matches!(&completions(&actions)[..], [(_, Ok(Reply::File(_)))]));
        let Some(ChatMessage::Text(text)) = session.history().get(0) else { panic!("expected attachment") };
        let attachment = text.attachment.as_ref().unwrap();
        assert_eq!(attachment.url.as_deref(), Some("https://files.example/f-7"));
        assert!(session.refresh_stale_attachments().unwrap().is_empty());
    }

    #[test]
    fn request_timeout_can_be_disabled() {
        let (env, mut session) = in_channel();
        let id = session.load_history().unwrap();
        assert!(session.set_request_timeout(id, None));
        session.take_actions();

        assert!(completions(&session.tick(env.advance(Duration::from_secs(60)))).is_empty());
        assert_eq!(session.pending_requests(), 1);
        assert!(!session.set_request_timeout(ActionId::new(999), None));
    }

    #[test]
    fn superseded_connection_ends_session() {
        let (_env, mut session) = in_channel();
        let actions = session.handle(SessionEvent::Superseded);
        assert!(actions.contains(&SessionAction::Disconnect));
        assert_eq!(session.state(), SessionState::Closed);
    }
}
