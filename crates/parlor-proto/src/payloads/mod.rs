//! JSON bodies carried in payload frames.

pub mod chat;
pub mod rtc;

pub use chat::{ComposeContent, FileAttrs, FileRef, MessageBody, RatingBody, UiActionBody};
pub use rtc::{IceServer, IceServers, RtcSignal};
