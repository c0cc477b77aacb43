//! Transport boundary.
//!
//! The session core speaks in [`Request`]s and [`InboundEvent`]s; a
//! [`Transport`] moves them over whatever connection the host provides. Wire
//! encoding belongs to the transport, not to the core.
//!
//! [`channel_transport`] builds an in-memory pair for tests and for hosts that
//! bridge to a connection living on another task.

use std::future::Future;

use parlor_proto::{ActionId, InboundEvent, Payload, Props, Request};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportError;

/// Capacity of each direction of the in-memory transport.
const CHANNEL_CAPACITY: usize = 64;

/// Something the transport delivers to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Server event.
    Event(InboundEvent),
    /// Diagnostic line from the connection layer.
    Log(String),
    /// The connection went away.
    Closed {
        /// Why.
        reason: String,
    },
}

impl TransportEvent {
    /// Whether this is the connection layer's notice that another connection
    /// took over the session.
    pub fn is_superseded(&self) -> bool {
        match self {
            Self::Log(line) => line.contains("connection_superseded"),
            Self::Event(event) => event.name() == Some("connection_superseded"),
            Self::Closed { .. } => false,
        }
    }
}

/// Bidirectional connection to the chat backend.
///
/// # Cancel safety
///
/// [`recv`](Transport::recv) is polled inside `tokio::select!` and must not
/// lose events when its future is dropped before completion.
pub trait Transport: Send + 'static {
    /// Open the connection and create the session with `params`.
    ///
    /// # Errors
    ///
    /// `TransportError::Connect` if the connection cannot be established.
    fn connect(
        &mut self,
        address: &str,
        user_agent: &str,
        params: Props,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send a request tagged with `action_id`.
    ///
    /// # Errors
    ///
    /// `TransportError::Send` or `TransportError::Closed`.
    fn send(&mut self, action_id: ActionId, request: Request) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next event, or `None` once the connection is gone for good.
    fn recv(&mut self) -> impl Future<Output = Option<TransportEvent>> + Send;

    /// Close the connection. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// What the client side of a [`ChannelTransport`] hands to the server side.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Session creation.
    Connect {
        /// Backend address.
        address: String,
        /// User agent.
        user_agent: String,
        /// `create_session` parameters.
        params: Props,
    },
    /// A request in wire form.
    Request {
        /// Property header, including `action` and `action_id`.
        props: Props,
        /// Payload frames.
        payload: Payload,
    },
    /// The client closed the connection.
    Close,
}

impl Outbound {
    /// `action` of a request.
    pub fn action(&self) -> Option<&str> {
        match self {
            Self::Request { props, .. } => props.str("action"),
            _ => None,
        }
    }

    /// `action_id` of a request.
    pub fn action_id(&self) -> Option<i64> {
        match self {
            Self::Request { props, .. } => props.int("action_id"),
            _ => None,
        }
    }
}

/// Client side of an in-memory transport.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<TransportEvent>,
    open: bool,
}

/// Server side of an in-memory transport.
#[derive(Debug)]
pub struct ServerEnd {
    outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<TransportEvent>,
}

/// Build a connected in-memory transport pair.
pub fn channel_transport() -> (ChannelTransport, ServerEnd) {
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        ChannelTransport { outbound: out_tx, inbound: in_rx, open: false },
        ServerEnd { outbound: out_rx, inbound: in_tx },
    )
}

impl Transport for ChannelTransport {
    async fn connect(&mut self, address: &str, user_agent: &str, params: Props) -> Result<(), TransportError> {
        let connect = Outbound::Connect { address: address.to_owned(), user_agent: user_agent.to_owned(), params };
        self.outbound.send(connect).await.map_err(|_| TransportError::Connect("server end dropped".into()))?;
        self.open = true;
        Ok(())
    }

    async fn send(&mut self, action_id: ActionId, request: Request) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        trace!(%action_id, action = request.action(), "sending");
        let (props, payload) = request.into_parts(action_id);
        self.outbound
            .send(Outbound::Request { props, payload })
            .await
            .map_err(|_| TransportError::Send("server end dropped".into()))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        if std::mem::take(&mut self.open) && self.outbound.send(Outbound::Close).await.is_err() {
            trace!("server end already gone");
        }
    }
}

impl ServerEnd {
    /// Next thing the client sent, `None` once the client side is dropped.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Push a server event to the client.
    ///
    /// # Errors
    ///
    /// `TransportError::Closed` if the client side is gone.
    pub async fn push(&self, event: InboundEvent) -> Result<(), TransportError> {
        self.deliver(TransportEvent::Event(event)).await
    }

    /// Push a connection-layer log line.
    ///
    /// # Errors
    ///
    /// `TransportError::Closed` if the client side is gone.
    pub async fn log(&self, line: impl Into<String>) -> Result<(), TransportError> {
        self.deliver(TransportEvent::Log(line.into())).await
    }

    /// Drop the connection from the server side.
    ///
    /// # Errors
    ///
    /// `TransportError::Closed` if the client side is gone.
    pub async fn close(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.deliver(TransportEvent::Closed { reason: reason.into() }).await
    }

    async fn deliver(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.inbound.send(event).await.map_err(|_| TransportError::Closed)
    }
}
