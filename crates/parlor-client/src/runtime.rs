//! Owner task for a session.
//!
//! The runtime owns the [`Session`] and is the only place it is mutated.
//! Handle commands, transport events, upload results, engine reports and
//! timer expiry are all serialized through one `tokio::select!` loop, then
//! the resulting [`SessionAction`]s are executed in order.
//!
//! ```text
//!  SessionHandle ──┐
//!  Transport ──────┤                 ┌──> Transport (connect/send/close)
//!  Uploader task ──┼──> Session ─────┼──> Completion waiters
//!  WebRtcEngine ───┤    (owner)      ├──> EventSink / QueueJoin
//!  next_deadline ──┘                 └──> WebRtcEngine
//! ```
//!
//! # Invariants
//!
//! - Actions are executed in the order the session produced them.
//! - Every completion waiter is answered exactly once; waiters still present
//!   when the loop ends observe `SessionError::Closed`.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parlor_core::{
    Environment, Reply, Session, SessionAction, SessionConfig, SessionError, SessionEvent, SessionNotification,
    SessionState,
};
use parlor_proto::{ActionId, Props};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::{
    error::TransportError,
    handle::{Command, Completion, QueueJoin, Responder, SentMessage, SessionHandle},
    sink::EventSink,
    transport::{Transport, TransportEvent},
    upload::Uploader,
    webrtc::{EngineEvents, WebRtcEngine},
};

/// Queue join the caller is watching.
struct QueueWatch {
    queue_id: String,
    progress: mpsc::UnboundedSender<u32>,
    channel: oneshot::Sender<String>,
}

/// Drives a [`Session`] against real collaborators.
pub struct Runtime<E, T, S>
where
    E: Environment,
    T: Transport,
    S: EventSink,
{
    env: E,
    session: Session<E>,
    transport: T,
    sink: S,
    uploader: Option<Arc<dyn Uploader>>,
    engine: Option<Box<dyn WebRtcEngine>>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_rx: mpsc::UnboundedReceiver<SessionEvent>,
    waiters: HashMap<ActionId, oneshot::Sender<Result<Reply, SessionError>>>,
    queue_watch: Option<QueueWatch>,
    connected: bool,
}

impl<E, T, S> Runtime<E, T, S>
where
    E: Environment,
    T: Transport,
    S: EventSink,
{
    /// Create a runtime and the handle that talks to it.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidConfig` if `config` fails validation.
    pub fn new(env: E, config: SessionConfig, transport: T, sink: S) -> Result<(Self, SessionHandle), SessionError> {
        let session = Session::new(env.clone(), config)?;
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let runtime = Self {
            env,
            session,
            transport,
            sink,
            uploader: None,
            engine: None,
            commands,
            internal_tx,
            internal_rx,
            waiters: HashMap::new(),
            queue_watch: None,
            connected: false,
        };
        Ok((runtime, SessionHandle::new(command_tx)))
    }

    /// Use `uploader` for file messages.
    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Drive `engine` for calls.
    #[must_use]
    pub fn with_webrtc(mut self, engine: impl WebRtcEngine) -> Self {
        self.engine = Some(Box::new(engine));
        self
    }

    /// Run until the session is closed, or until every handle is dropped
    /// while the session is idle.
    ///
    /// Dropping every handle on a live session closes the chat.
    pub async fn run(mut self) {
        let mut accepting = true;

        while self.session.state() != SessionState::Closed {
            let timer = self.session.next_deadline().map(|deadline| {
                let now = self.env.now();
                self.env.sleep(if deadline > now { deadline - now } else { Duration::ZERO })
            });

            let actions = tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(command) => {
                        self.apply(command);
                        self.session.take_actions()
                    },
                    None if self.session.state() == SessionState::Idle => break,
                    None => {
                        info!("all handles dropped, closing chat");
                        accepting = false;
                        if let Err(error) = self.session.close_chat() {
                            debug!(%error, "close on handle drop");
                        }
                        self.session.take_actions()
                    },
                },

                Some(event) = self.internal_rx.recv() => self.session.handle(event),

                event = self.transport.recv(), if self.connected => self.on_transport(event),

                () = async {
                    match timer {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                } => self.session.tick(self.env.now()),
            };

            self.execute(actions).await;
        }

        if self.connected {
            self.transport.close().await;
            self.connected = false;
        }
        if !self.waiters.is_empty() {
            debug!(count = self.waiters.len(), "dropping unanswered waiters");
        }
        info!(state = ?self.session.state(), "session runtime stopped");
    }

    fn on_transport(&mut self, event: Option<TransportEvent>) -> Vec<SessionAction> {
        let event = match event {
            Some(event) if event.is_superseded() => SessionEvent::Superseded,
            Some(TransportEvent::Event(event)) => SessionEvent::Inbound(event),
            Some(TransportEvent::Log(line)) => {
                trace!(%line, "transport log");
                return Vec::new();
            },
            Some(TransportEvent::Closed { reason }) => {
                self.connected = false;
                SessionEvent::TransportClosed { reason }
            },
            None => {
                self.connected = false;
                SessionEvent::TransportClosed { reason: "connection ended".into() }
            },
        };
        self.session.handle(event)
    }

    /// Run a handle command against the session and answer the caller.
    fn apply(&mut self, command: Command) {
        match command {
            Command::Open(reply) => {
                let result = self.session.open().map(|id| self.watch(id));
                respond(reply, result);
            },
            Command::ListQueues { queue_ids, reply } => {
                let result = self.session.list_queues(queue_ids).map(|id| self.watch(id));
                respond(reply, result);
            },
            Command::JoinQueue { queue_id, reply } => {
                let result = self.session.join_queue(queue_id.clone()).map(|id| self.watch_queue(queue_id, id));
                respond(reply, result);
            },
            Command::LeaveQueue(reply) => {
                let result = self.session.leave_queue().map(|id| self.watch(id));
                if result.is_ok() {
                    self.queue_watch = None;
                }
                respond(reply, result);
            },
            Command::SendText { text, reply } => {
                let result = self.session.send_text(text).map(|outgoing| SentMessage {
                    local_seq: outgoing.local_seq,
                    completion: self.watch(outgoing.request),
                });
                respond(reply, result);
            },
            Command::SendUiAction { target, reply } => {
                let result = self.session.send_ui_action(&target).map(|outgoing| SentMessage {
                    local_seq: outgoing.local_seq,
                    completion: self.watch(outgoing.request),
                });
                respond(reply, result);
            },
            Command::SendFile { file_name, data, reply } => {
                let result = self.session.send_file(file_name, data).map(|id| self.watch(id));
                respond(reply, result);
            },
            Command::DescribeFile { file_id, reply } => {
                let result = self.session.describe_file(file_id).map(|id| self.watch(id));
                respond(reply, result);
            },
            Command::RefreshAttachments(reply) => {
                let result = self
                    .session
                    .refresh_stale_attachments()
                    .map(|ids| ids.into_iter().map(|id| self.watch(id)).collect());
                respond(reply, result);
            },
            Command::SetWriting { writing, reply } => {
                let result = self.session.set_writing(writing).map(|id| self.watch(id));
                respond(reply, result);
            },
            Command::LoadHistory(reply) => {
                let result = self.session.load_history().map(|id| self.watch(id));
                respond(reply, result);
            },
            Command::BeginIce(reply) => {
                let result = self.session.begin_ice().map(|id| self.watch(id));
                respond(reply, result);
            },
            Command::Dial(reply) => respond(reply, self.session.dial()),
            Command::PickUp { answer, reply } => respond(reply, self.session.pick_up(answer)),
            Command::HangUp(reply) => respond(reply, self.session.hang_up()),
            Command::RtcDescription { kind, sdp, reply } => {
                respond(reply, self.session.send_rtc_description(kind, sdp));
            },
            Command::RtcCandidate { candidate, reply } => respond(reply, self.session.send_rtc_candidate(candidate)),
            Command::CloseChat(reply) => respond(reply, self.session.close_chat()),
            Command::FinishChat { rating, reply } => respond(reply, self.session.finish_chat(rating)),
            Command::State(reply) => {
                if reply.send(self.session.state()).is_err() {
                    trace!("state caller went away");
                }
            },
        }
    }

    fn watch(&mut self, request: ActionId) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request, tx);
        Completion::new(request, rx)
    }

    fn watch_queue(&mut self, queue_id: String, request: ActionId) -> QueueJoin {
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let (channel_tx, channel) = oneshot::channel();
        self.queue_watch = Some(QueueWatch { queue_id, progress: progress_tx, channel: channel_tx });
        QueueJoin { enqueued: self.watch(request), progress, channel }
    }

    /// Execute actions in order, feeding collaborator failures back in.
    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Connect { address, user_agent, params } => {
                    if let Err(error) = self.connect(&address, &user_agent, params).await {
                        warn!(%error, "connect failed");
                        queue.extend(self.session.handle(SessionEvent::ConnectFailed { reason: error.to_string() }));
                    }
                },
                SessionAction::Send { action_id, request } => {
                    if let Err(error) = self.transport.send(action_id, request).await {
                        warn!(%action_id, %error, "send failed");
                        let failed = SessionEvent::SendFailed { action_id, reason: error.to_string() };
                        queue.extend(self.session.handle(failed));
                    }
                },
                SessionAction::Upload { request, file_name, data } => self.upload(request, file_name, data),
                SessionAction::Complete { request, outcome } => self.complete(request, outcome),
                SessionAction::Notify(notification) => self.deliver(&notification),
                SessionAction::Rtc(command) => match self.engine.as_mut() {
                    Some(engine) => engine.apply(command, &EngineEvents::new(self.internal_tx.clone())),
                    None => debug!(?command, "no media engine attached, dropping command"),
                },
                SessionAction::Disconnect => {
                    if self.connected {
                        self.transport.close().await;
                        self.connected = false;
                    }
                },
            }
        }
    }

    async fn connect(&mut self, address: &str, user_agent: &str, params: Props) -> Result<(), TransportError> {
        let timeout = self.session.config().connect_timeout;
        info!(address, user_agent, "connecting");
        match tokio::time::timeout(timeout, self.transport.connect(address, user_agent, params)).await {
            Ok(Ok(())) => {
                self.connected = true;
                Ok(())
            },
            Ok(Err(error)) => Err(error),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        }
    }

    fn upload(&mut self, request: ActionId, file_name: String, data: Bytes) {
        let Some(uploader) = self.uploader.clone() else {
            let result = Err("no uploader configured".to_owned());
            if self.internal_tx.send(SessionEvent::UploadFinished { request, result }).is_err() {
                debug!(%request, "runtime channel closed");
            }
            return;
        };
        debug!(%request, %file_name, size = data.len(), "uploading");
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = uploader.upload(file_name, data).await.map_err(|error| error.to_string());
            if events.send(SessionEvent::UploadFinished { request, result }).is_err() {
                debug!(%request, "runtime stopped before upload finished");
            }
        });
    }

    fn complete(&mut self, request: ActionId, outcome: Result<Reply, SessionError>) {
        match self.waiters.remove(&request) {
            Some(waiter) => {
                if waiter.send(outcome).is_err() {
                    trace!(%request, "completion dropped by caller");
                }
            },
            None => trace!(%request, "completion without waiter"),
        }
    }

    fn deliver(&mut self, notification: &SessionNotification) {
        match notification {
            SessionNotification::QueueProgress { queue_id, position } => {
                if let Some(watch) = &self.queue_watch
                    && &watch.queue_id == queue_id
                    && watch.progress.send(*position).is_err()
                {
                    trace!("queue progress receiver dropped");
                }
            },
            SessionNotification::ChannelJoined { channel_id, queue_id: Some(queue_id) } => {
                if let Some(watch) = self.queue_watch.take_if(|w| &w.queue_id == queue_id)
                    && watch.channel.send(channel_id.clone()).is_err()
                {
                    trace!("channel receiver dropped");
                }
            },
            SessionNotification::SessionEnded { .. } => self.queue_watch = None,
            _ => {},
        }
        self.sink.notify(notification);
    }
}

fn respond<T>(reply: Responder<T>, result: Result<T, SessionError>) {
    if reply.send(result).is_err() {
        trace!("caller went away before the reply");
    }
}
