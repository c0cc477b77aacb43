//! Environment abstraction for deterministic testing.
//!
//! The session core never reads a clock directly. Production drivers supply
//! tokio's clock; tests supply a manually advanced one.

use std::{
    fmt::Debug,
    future::Future,
    ops::{Add, Sub},
    time::Duration,
};

/// Time source for the session core.
///
/// # Invariants
///
/// - `now()` never goes backwards within one environment instance.
/// - `wall_clock_millis()` is only used for display timestamps, never for
///   deadlines.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `tokio::time::Instant` so paused-clock tests work;
    /// unit tests use a hand-rolled virtual instant.
    type Instant: Copy
        + Ord
        + Debug
        + Send
        + Sync
        + Sub<Output = Duration>
        + Add<Duration, Output = Self::Instant>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this; state machines use deadlines.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Milliseconds since the Unix epoch, for locally created chat entries.
    fn wall_clock_millis(&self) -> u64;
}
