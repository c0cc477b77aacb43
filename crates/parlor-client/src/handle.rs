//! Cloneable handle to a running session.
//!
//! Every call is a message to the owner task, so the session is only ever
//! mutated there. A call returns once the session has accepted or refused the
//! operation; requests then complete through a [`Completion`].

use bytes::Bytes;
use parlor_core::{Rating, Reply, SessionError, SessionState};
use parlor_proto::{ActionId, MessageType, payloads::ComposeContent};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

pub(crate) type Responder<T> = oneshot::Sender<Result<T, SessionError>>;

/// Operations forwarded to the owner task.
#[derive(Debug)]
pub(crate) enum Command {
    Open(Responder<Completion>),
    ListQueues { queue_ids: Option<Vec<String>>, reply: Responder<Completion> },
    JoinQueue { queue_id: String, reply: Responder<QueueJoin> },
    LeaveQueue(Responder<Completion>),
    SendText { text: String, reply: Responder<SentMessage> },
    SendUiAction { target: ComposeContent, reply: Responder<SentMessage> },
    SendFile { file_name: String, data: Bytes, reply: Responder<Completion> },
    DescribeFile { file_id: String, reply: Responder<Completion> },
    RefreshAttachments(Responder<Vec<Completion>>),
    SetWriting { writing: bool, reply: Responder<Completion> },
    LoadHistory(Responder<Completion>),
    BeginIce(Responder<Completion>),
    Dial(Responder<()>),
    PickUp { answer: bool, reply: Responder<()> },
    HangUp(Responder<()>),
    RtcDescription { kind: MessageType, sdp: Map<String, Value>, reply: Responder<()> },
    RtcCandidate { candidate: Map<String, Value>, reply: Responder<()> },
    CloseChat(Responder<()>),
    FinishChat { rating: Option<Rating>, reply: Responder<()> },
    State(oneshot::Sender<SessionState>),
}

/// Outcome of a request, delivered exactly once.
#[derive(Debug)]
pub struct Completion {
    request: ActionId,
    rx: oneshot::Receiver<Result<Reply, SessionError>>,
}

impl Completion {
    pub(crate) fn new(request: ActionId, rx: oneshot::Receiver<Result<Reply, SessionError>>) -> Self {
        Self { request, rx }
    }

    /// Correlation id of the request.
    pub fn request(&self) -> ActionId {
        self.request
    }

    /// Wait for the outcome.
    ///
    /// # Errors
    ///
    /// The request's error, or `SessionError::Closed` if the runtime stopped.
    pub async fn wait(self) -> Result<Reply, SessionError> {
        self.rx.await.unwrap_or(Err(SessionError::Closed))
    }
}

/// A message handed to the transport.
#[derive(Debug)]
pub struct SentMessage {
    /// Local sequence number for optimistic display ordering.
    pub local_seq: u64,
    /// Resolves with `Reply::Sent` when the server echoes the message.
    pub completion: Completion,
}

/// Progress of a queue join.
#[derive(Debug)]
pub struct QueueJoin {
    /// Resolves once the server confirms the guest is queued.
    pub enqueued: Completion,
    /// Queue positions as they are announced; may yield nothing.
    pub progress: mpsc::UnboundedReceiver<u32>,
    /// Channel id once an agent accepts; dropped if the join ends otherwise.
    pub channel: oneshot::Receiver<String>,
}

/// Handle to the session owned by a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    async fn call<T>(&self, command: impl FnOnce(Responder<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).map_err(|_| SessionError::Closed)?;
        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Current lifecycle state; `Closed` once the runtime has stopped.
    pub async fn state(&self) -> SessionState {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::State(tx)).is_err() {
            return SessionState::Closed;
        }
        rx.await.unwrap_or(SessionState::Closed)
    }

    /// Connect and create the session
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` unless the session is idle.
    pub async fn open(&self) -> Result<Completion, SessionError> {
        self.call(Command::Open).await
    }

    /// List realm queues, all when `queue_ids` is `None`
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` before the session is open.
    pub async fn list_queues(&self, queue_ids: Option<Vec<String>>) -> Result<Completion, SessionError> {
        self.call(|reply| Command::ListQueues { queue_ids, reply }).await
    }

    /// Enter a queue, or transfer to one from the current channel
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` unless open or in a channel.
    pub async fn join_queue(&self, queue_id: impl Into<String>) -> Result<QueueJoin, SessionError> {
        let queue_id = queue_id.into();
        self.call(|reply| Command::JoinQueue { queue_id, reply }).await
    }

    /// Leave the queue before being accepted
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` unless queued.
    pub async fn leave_queue(&self) -> Result<Completion, SessionError> {
        self.call(Command::LeaveQueue).await
    }

    /// Send a text message
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a channel.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<SentMessage, SessionError> {
        let text = text.into();
        self.call(|reply| Command::SendText { text, reply }).await
    }

    /// Report a click on a compose element
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a channel.
    pub async fn send_ui_action(&self, target: ComposeContent) -> Result<SentMessage, SessionError> {
        self.call(|reply| Command::SendUiAction { target, reply }).await
    }

    /// Upload a file and post it
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a channel.
    pub async fn send_file(&self, file_name: impl Into<String>, data: Bytes) -> Result<Completion, SessionError> {
        let file_name = file_name.into();
        self.call(|reply| Command::SendFile { file_name, data, reply }).await
    }

    /// Fetch a fresh URL for a file
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` before the session is open.
    pub async fn describe_file(&self, file_id: impl Into<String>) -> Result<Completion, SessionError> {
        let file_id = file_id.into();
        self.call(|reply| Command::DescribeFile { file_id, reply }).await
    }

    /// Re-describe attachments with missing or expiring URLs
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a channel.
    pub async fn refresh_attachments(&self) -> Result<Vec<Completion>, SessionError> {
        self.call(Command::RefreshAttachments).await
    }

    /// Set the typing indicator
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a channel.
    pub async fn set_writing(&self, writing: bool) -> Result<Completion, SessionError> {
        self.call(|reply| Command::SetWriting { writing, reply }).await
    }

    /// Load older messages
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a channel.
    pub async fn load_history(&self) -> Result<Completion, SessionError> {
        self.call(Command::LoadHistory).await
    }

    /// Request STUN/TURN servers
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` before the session is open.
    pub async fn begin_ice(&self) -> Result<Completion, SessionError> {
        self.call(Command::BeginIce).await
    }

    /// Call the agent
    ///
    /// # Errors
    ///
    /// `InvalidState` outside a channel, `InvalidCallState` during a call.
    pub async fn dial(&self) -> Result<(), SessionError> {
        self.call(Command::Dial).await
    }

    /// Answer (`true`) or decline a ringing call
    ///
    /// # Errors
    ///
    /// `InvalidCallState` unless ringing.
    pub async fn pick_up(&self, answer: bool) -> Result<(), SessionError> {
        self.call(|reply| Command::PickUp { answer, reply }).await
    }

    /// End the call
    ///
    /// # Errors
    ///
    /// `InvalidCallState` without a call.
    pub async fn hang_up(&self) -> Result<(), SessionError> {
        self.call(Command::HangUp).await
    }

    /// Forward the engine's local offer or answer
    ///
    /// # Errors
    ///
    /// `InvalidCallState` unless the peer connection has started.
    pub async fn send_rtc_description(&self, kind: MessageType, sdp: Map<String, Value>) -> Result<(), SessionError> {
        self.call(|reply| Command::RtcDescription { kind, sdp, reply }).await
    }

    /// Forward a local ICE candidate
    ///
    /// # Errors
    ///
    /// `InvalidCallState` unless the peer connection has started.
    pub async fn send_rtc_candidate(&self, candidate: Map<String, Value>) -> Result<(), SessionError> {
        self.call(|reply| Command::RtcCandidate { candidate, reply }).await
    }

    /// Close the chat; pending requests fail with `SessionError::Closed`
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` if already closing or closed.
    pub async fn close_chat(&self) -> Result<(), SessionError> {
        self.call(Command::CloseChat).await
    }

    /// Rate the conversation (optional) and close
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` if already closing or closed.
    pub async fn finish_chat(&self, rating: Option<Rating>) -> Result<(), SessionError> {
        self.call(|reply| Command::FinishChat { rating, reply }).await
    }
}
