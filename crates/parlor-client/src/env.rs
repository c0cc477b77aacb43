//! Production environment on the tokio clock.
//!
//! `SystemEnv` reads `tokio::time::Instant`, so a runtime under
//! `#[tokio::test(start_paused = true)]` runs on virtual time without any
//! changes to the session core.

use std::{
    future::Future,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parlor_core::Environment;

/// Tokio clock and system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn wall_clock_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}
