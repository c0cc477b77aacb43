//! Time-bounded reordering of inbound events.
//!
//! The transport may hand over logically sequential events (successive chat
//! messages, queue position updates) out of order. The buffer holds them
//! briefly and releases them sorted by message id.
//!
//! # Timing
//!
//! The first submission into an empty buffer arms a single deadline
//! `now + delay`. Later submissions do not move it, so added latency is
//! bounded by `delay`. When the owner ticks at or past the deadline everything
//! buffered is released at once, in id order, and the deadline is cleared.
//! The next submission arms a fresh one.
//!
//! # Invariants
//!
//! - Pending entries are sorted by [`MessageId`] at all times. Equal ids keep
//!   arrival order.
//! - Events without a message id (`channel_joined`, `channel_updated`,
//!   `queue_updated` and the like) carry the empty id, which sorts below every
//!   real id. Within a release they come out ahead of all messages, in the
//!   order they arrived, so channel and queue state is applied before the
//!   messages that depend on it.
//! - At most one deadline is armed.
//! - After [`ReorderBuffer::stop`] nothing is ever released again.

use std::{ops::Add, time::Duration};

use parlor_proto::{InboundEvent, MessageId};
use tracing::{trace, warn};

/// An inbound event waiting in the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage<I> {
    /// The event as received.
    pub event: InboundEvent,
    /// Ordering key; empty for events that are not messages, which therefore
    /// release ahead of every message in the same batch.
    pub message_id: MessageId,
    /// Arrival time.
    pub received_at: I,
}

impl<I> InboundMessage<I> {
    /// Wrap an event, taking its id from the `message_id` property.
    pub fn new(event: InboundEvent, received_at: I) -> Self {
        let message_id = event.message_id();
        Self { event, message_id, received_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Listening,
    Stopped,
}

/// Sorting buffer with a single release deadline.
#[derive(Debug)]
pub struct ReorderBuffer<I> {
    pending: Vec<InboundMessage<I>>,
    delay: Duration,
    deadline: Option<I>,
    state: BufferState,
}

impl<I> ReorderBuffer<I>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    /// Empty buffer releasing after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { pending: Vec::new(), delay, deadline: None, state: BufferState::Listening }
    }

    /// Insert a message in id order, arming the deadline if none is armed.
    ///
    /// An id-less event lands after the id-less events already buffered and
    /// before every message.
    ///
    /// Returns `false` if the buffer was stopped and the message dropped.
    pub fn submit(&mut self, message: InboundMessage<I>, now: I) -> bool {
        if self.state == BufferState::Stopped {
            warn!(message_id = %message.message_id, "reorder buffer stopped, dropping event");
            return false;
        }

        let position = self.pending.partition_point(|m| m.message_id <= message.message_id);
        trace!(message_id = %message.message_id, position, "buffering event");
        self.pending.insert(position, message);

        if self.deadline.is_none() {
            self.deadline = Some(now + self.delay);
        }
        true
    }

    /// Release everything if the deadline has passed.
    ///
    /// Returns the released messages in id order; empty when the deadline has
    /// not been reached, nothing is buffered, or the buffer is stopped.
    pub fn release(&mut self, now: I) -> Vec<InboundMessage<I>> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                std::mem::take(&mut self.pending)
            },
            _ => Vec::new(),
        }
    }

    /// When the owner must tick next, if anything is buffered.
    pub fn next_deadline(&self) -> Option<I> {
        self.deadline
    }

    /// Cancel the deadline and discard pending entries.
    ///
    /// Terminal: later submissions are dropped. Returns how many entries were
    /// discarded.
    pub fn stop(&mut self) -> usize {
        self.state = BufferState::Stopped;
        self.deadline = None;
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.state == BufferState::Stopped
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parlor_proto::{Payload, Props};

    use super::*;

    const DELAY: Duration = Duration::from_millis(200);

    /// Virtual instant: milliseconds since an arbitrary origin.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct Ms(u64);

    impl Add<Duration> for Ms {
        type Output = Ms;

        fn add(self, rhs: Duration) -> Ms {
            Ms(self.0 + rhs.as_millis() as u64)
        }
    }

    fn message(id: &str, at: Ms) -> InboundMessage<Ms> {
        let props = Props::new().with("event", "message_received").with("message_id", id);
        InboundMessage::new(InboundEvent::new(props, Payload::empty()), at)
    }

    fn ids(released: &[InboundMessage<Ms>]) -> Vec<&str> {
        released.iter().map(|m| m.message_id.as_str()).collect()
    }

    #[test]
    fn releases_in_id_order() {
        let mut buffer = ReorderBuffer::new(DELAY);
        buffer.submit(message("3", Ms(0)), Ms(0));
        buffer.submit(message("1", Ms(10)), Ms(10));
        buffer.submit(message("2", Ms(20)), Ms(20));

        assert!(buffer.release(Ms(199)).is_empty());
        let released = buffer.release(Ms(200));
        assert_eq!(ids(&released), ["1", "2", "3"]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_deadline(), None);
    }

    #[test]
    fn deadline_armed_once_at_first_insertion() {
        let mut buffer = ReorderBuffer::new(DELAY);
        buffer.submit(message("1", Ms(0)), Ms(0));
        buffer.submit(message("2", Ms(150)), Ms(150));
        assert_eq!(buffer.next_deadline(), Some(Ms(200)));
    }

    #[test]
    fn late_arrivals_wait_for_next_cycle() {
        let mut buffer = ReorderBuffer::new(DELAY);
        buffer.submit(message("1", Ms(0)), Ms(0));
        assert_eq!(ids(&buffer.release(Ms(200))), ["1"]);

        buffer.submit(message("2", Ms(250)), Ms(250));
        assert_eq!(buffer.next_deadline(), Some(Ms(450)));
        assert!(buffer.release(Ms(300)).is_empty());
        assert_eq!(ids(&buffer.release(Ms(450))), ["2"]);
    }

    #[test]
    fn stop_discards_and_never_releases() {
        let mut buffer = ReorderBuffer::new(DELAY);
        buffer.submit(message("1", Ms(0)), Ms(0));
        buffer.submit(message("2", Ms(0)), Ms(0));
        assert_eq!(buffer.stop(), 2);

        assert!(buffer.release(Ms(1_000)).is_empty());
        assert!(!buffer.submit(message("3", Ms(1_000)), Ms(1_000)));
        assert!(buffer.release(Ms(5_000)).is_empty());
        assert_eq!(buffer.next_deadline(), None);
    }

    #[test]
    fn release_of_empty_buffer_is_noop() {
        let mut buffer = ReorderBuffer::new(DELAY);
        buffer.submit(message("1", Ms(0)), Ms(0));
        assert_eq!(buffer.release(Ms(200)).len(), 1);
        assert!(buffer.release(Ms(200)).is_empty());
        assert!(buffer.release(Ms(10_000)).is_empty());
    }

    #[test]
    fn non_message_events_sort_first_and_keep_arrival_order() {
        let mut buffer = ReorderBuffer::new(DELAY);
        buffer.submit(message("5", Ms(0)), Ms(0));
        let progress = |position: i64| {
            let props = Props::new().with("event", "queue_updated").with("queue_position", position);
            InboundMessage::new(InboundEvent::new(props, Payload::empty()), Ms(0))
        };
        buffer.submit(progress(3), Ms(0));
        buffer.submit(progress(2), Ms(0));

        let released = buffer.release(Ms(200));
        let positions: Vec<_> = released.iter().map(|m| m.event.props.int("queue_position")).collect();
        assert_eq!(positions, [Some(3), Some(2), None]);
    }

    #[test]
    fn channel_update_between_messages_releases_first() {
        let mut buffer = ReorderBuffer::new(DELAY);
        buffer.submit(message("2", Ms(0)), Ms(0));
        let update = Props::new().with("event", "channel_updated").with("channel_id", "ch-1");
        buffer.submit(InboundMessage::new(InboundEvent::new(update, Payload::empty()), Ms(5)), Ms(5));
        buffer.submit(message("1", Ms(10)), Ms(10));

        let released = buffer.release(Ms(200));
        let events: Vec<_> = released.iter().map(|m| (m.event.props.str("event"), m.message_id.as_str())).collect();
        assert_eq!(
            events,
            [(Some("channel_updated"), ""), (Some("message_received"), "1"), (Some("message_received"), "2")]
        );
    }
}
