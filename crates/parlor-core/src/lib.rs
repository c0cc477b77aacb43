//! Parlor session core.
//!
//! Sans-IO state machines for a customer-service chat client: the reordering
//! buffer that normalizes server event order, the session orchestrator that
//! tracks session, queue and channel lifecycle, and the WebRTC signaling
//! sub-protocol layered on chat messages.
//!
//! # Architecture
//!
//! Nothing in this crate performs I/O. The application calls intent methods on
//! [`Session`] (`open`, `join_queue`, `send_text`, ...) and feeds it
//! [`SessionEvent`]s from the transport. The session answers with
//! [`SessionAction`]s describing what to do next: send a request, complete a
//! waiting caller, notify the UI, drive the media engine.
//!
//! Time enters through the [`Environment`] and [`Session::tick`]. The driver
//! sleeps until [`Session::next_deadline`] and ticks; that single mechanism
//! releases the reordering buffer and expires request timeouts.

pub mod action;
pub mod chat;
pub mod config;
pub mod env;
pub mod error;
pub mod event;
pub mod file;
pub mod queue;
pub mod reorder;
pub mod session;
pub mod signaling;

pub use action::{Reply, SessionAction, SessionNotification};
pub use chat::{ChannelUser, ChatHistory, ChatMessage};
pub use config::SessionConfig;
pub use env::Environment;
pub use error::SessionError;
pub use event::{SessionEvent, UploadedFile};
pub use file::{FileDescription, FileInfo};
pub use queue::Queue;
pub use reorder::{InboundMessage, ReorderBuffer};
pub use session::{OutgoingMessage, Rating, Session, SessionState};
pub use signaling::{CallState, OperatingMode, RtcCommand};
