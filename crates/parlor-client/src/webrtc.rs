//! Media engine collaborator.
//!
//! The session decides *when* the peer connection starts, which descriptions
//! it applies and which candidates it adds. The engine does the media work
//! and reports back through [`EngineEvents`]. Local descriptions and
//! candidates go back through the [`SessionHandle`](crate::SessionHandle).

use parlor_core::{RtcCommand, SessionEvent};
use tokio::sync::mpsc;
use tracing::debug;

/// WebRTC engine driven by the session.
pub trait WebRtcEngine: Send + 'static {
    /// Execute a command. Must not block.
    fn apply(&mut self, command: RtcCommand, events: &EngineEvents);
}

/// Reporting channel from the engine to the session's owner task.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// The peer connection can take remote candidates.
    pub fn peer_ready(&self) {
        self.report(SessionEvent::PeerConnectionReady);
    }

    /// The peer connection failed; the call is torn down.
    pub fn peer_failed(&self, reason: impl Into<String>) {
        self.report(SessionEvent::PeerConnectionFailed { reason: reason.into() });
    }

    fn report(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("session runtime gone, dropping engine event");
        }
    }
}
