//! Parlor client runtime.
//!
//! Async driver for the Sans-IO [`parlor_core::Session`]. A [`Runtime`] owns
//! the session on one tokio task and executes its actions against the host's
//! collaborators; applications talk to it through a cloneable
//! [`SessionHandle`].
//!
//! # Components
//!
//! - [`Runtime`]: owner task, one `tokio::select!` loop per session
//! - [`SessionHandle`]: intent calls, each answered with a [`Completion`]
//! - [`Transport`]: connection to the backend; [`channel_transport`] builds an
//!   in-memory one
//! - [`Uploader`]: file storage for file messages
//! - [`WebRtcEngine`]: media engine for calls
//! - [`EventSink`]: application notifications
//!
//! # Example
//!
//! ```no_run
//! use parlor_client::{Runtime, SystemEnv, channel_transport};
//! use parlor_core::SessionConfig;
//!
//! # async fn demo() -> Result<(), parlor_core::SessionError> {
//! let (transport, _server) = channel_transport();
//! let config = SessionConfig::new("wss://chat.example", "realm-1");
//! let (runtime, handle) = Runtime::new(SystemEnv::new(), config, transport, ())?;
//! tokio::spawn(runtime.run());
//!
//! let created = handle.open().await?;
//! created.wait().await?;
//! # Ok(())
//! # }
//! ```

mod env;
mod error;
mod handle;
mod runtime;
mod sink;
mod transport;
mod upload;
mod webrtc;

pub use env::SystemEnv;
pub use error::{TransportError, UploadError};
pub use handle::{Completion, QueueJoin, SentMessage, SessionHandle};
pub use runtime::Runtime;
pub use sink::EventSink;
pub use transport::{ChannelTransport, Outbound, ServerEnd, Transport, TransportEvent, channel_transport};
pub use upload::Uploader;
pub use webrtc::{EngineEvents, WebRtcEngine};
