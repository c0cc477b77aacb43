//! Parlor wire vocabulary.
//!
//! Everything exchanged with the chat backend is a flat JSON property map
//! (`Props`) plus an optional list of opaque payload parts (`Payload`). This
//! crate names the pieces: inbound event kinds, message types, outbound
//! requests, and the JSON bodies carried in payload parts.
//!
//! Nothing here performs I/O or holds session state. `parlor-core` decides
//! what to do with an event; this crate only knows how to read and build one.

pub mod errors;
pub mod event;
pub mod message;
pub mod payload;
pub mod payloads;
pub mod props;
pub mod request;

pub use errors::{ProtocolError, Result};
pub use event::{ActionId, EventKind, InboundEvent};
pub use message::{MessageId, MessageType};
pub use payload::Payload;
pub use props::Props;
pub use request::{Request, SessionParams};
