//! Application notification sink.

use parlor_core::SessionNotification;
use tokio::sync::mpsc;
use tracing::trace;

/// Receives session notifications on the owner task, in production order.
pub trait EventSink: Send + 'static {
    /// Deliver one notification.
    fn notify(&mut self, notification: &SessionNotification);
}

impl EventSink for mpsc::UnboundedSender<SessionNotification> {
    fn notify(&mut self, notification: &SessionNotification) {
        if self.send(notification.clone()).is_err() {
            trace!("notification receiver dropped");
        }
    }
}

/// Discards every notification.
impl EventSink for () {
    fn notify(&mut self, _notification: &SessionNotification) {}
}
