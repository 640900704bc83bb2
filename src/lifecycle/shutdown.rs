//! Shutdown and drain sequencing.
//!
//! # Sequence
//! ```text
//! SIGINT / SIGTERM
//!     → state Running → ShuttingDown (refused if not Running)
//!     → drain timer started (when a timeout is configured)
//!     → listener closed; accept loop ends cleanly
//!     → serve loop waits for outstanding connections
//!     → timer fires first: outstanding connections force-released
//!     → state ShuttingDown → Terminated; serve returns
//! ```
//!
//! The forced release only stops the wait. Abandoned connections keep
//! running until the process exits.

use std::time::Duration;

use crate::net::ConnectionTracker;

/// Default drain timeout in milliseconds.
pub const DEFAULT_DRAIN_TIMEOUT_MS: i64 = 60_000;

/// Interpret a configured drain timeout; negative means wait forever.
pub fn drain_timeout(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

/// Sleep for `timeout`, then stop waiting on `tracker`'s connections.
pub async fn run_drain_timer(tracker: ConnectionTracker, timeout: Duration, address: String) {
    tokio::time::sleep(timeout).await;

    let abandoned = tracker.force_release();
    if abandoned > 0 {
        tracing::warn!(
            pid = std::process::id(),
            address = %address,
            abandoned,
            timeout_ms = timeout.as_millis() as u64,
            "[STOP - Hammer Time] Drain timeout expired, releasing outstanding connections"
        );
    }
}
