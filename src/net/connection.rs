//! Connection lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count outstanding connections per server
//! - Release each connection's slot exactly once (close or drop)
//! - Let the serve loop await "no work left", or give up waiting

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DrainState {
    active: u64,
    /// Bumped by a forced release; guards from older generations no longer count.
    generation: u64,
}

/// Outstanding-connection counter for one server.
///
/// Backed by a watch channel so the serve loop can await the count reaching
/// zero while connection tasks update it concurrently.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: Arc<watch::Sender<DrainState>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DrainState::default());
        Self { state: Arc::new(tx) }
    }

    /// Record a new outstanding connection. The returned guard releases it.
    pub fn track(&self) -> ConnectionGuard {
        let mut generation = 0;
        self.state.send_modify(|s| {
            s.active += 1;
            generation = s.generation;
        });
        metrics::connection_opened();
        ConnectionGuard {
            tracker: self.clone(),
            id: ConnectionId::new(),
            generation,
            released: AtomicBool::new(false),
        }
    }

    /// Current number of outstanding connections.
    pub fn active_count(&self) -> u64 {
        self.state.borrow().active
    }

    /// Stop waiting for the outstanding connections.
    ///
    /// Zeroes the counter in one step and wakes the waiter. Connections
    /// tracked before this call keep running; their later release is ignored.
    /// Returns how many connections were abandoned.
    pub fn force_release(&self) -> u64 {
        let mut abandoned = 0;
        self.state.send_if_modified(|s| {
            abandoned = s.active;
            if s.active == 0 {
                return false;
            }
            s.active = 0;
            s.generation += 1;
            true
        });
        if abandoned > 0 {
            metrics::connections_force_released(abandoned);
        }
        abandoned
    }

    /// Wait until no connection is outstanding.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| s.active == 0).await;
    }

    fn release(&self, generation: u64) {
        let changed = self.state.send_if_modified(|s| {
            if s.generation != generation || s.active == 0 {
                return false;
            }
            s.active -= 1;
            true
        });
        if changed {
            metrics::connection_closed();
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one slot of a [`ConnectionTracker`].
/// Releases it on the first call to [`release`](Self::release) or on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
    generation: u64,
    released: AtomicBool,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Release the slot. Returns `true` only for the call that released it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tracker.release(self.generation);
        tracing::trace!(connection_id = %self.id, "Connection released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// An accepted connection whose lifetime counts against its server's drain.
///
/// All I/O is forwarded to the wrapped stream.
#[derive(Debug)]
pub struct TrackedConnection<S> {
    stream: S,
    peer_addr: SocketAddr,
    guard: ConnectionGuard,
}

impl<S> TrackedConnection<S> {
    pub fn new(stream: S, peer_addr: SocketAddr, guard: ConnectionGuard) -> Self {
        Self {
            stream,
            peer_addr,
            guard,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Split into the stream and its guard, e.g. to wrap the stream in TLS.
    pub fn into_parts(self) -> (S, SocketAddr, ConnectionGuard) {
        (self.stream, self.peer_addr, self.guard)
    }
}

impl<S: AsyncWrite + Unpin> TrackedConnection<S> {
    /// Shut the write half down and release the connection's slot.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.guard.is_released() {
            return Ok(());
        }
        let result = self.stream.shutdown().await;
        self.guard.release();
        result
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedConnection<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedConnection<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn guard_releases_once() {
        let tracker = ConnectionTracker::new();
        let _other = tracker.track();
        let guard = tracker.track();
        assert!(guard.release());
        assert!(!guard.release());
        drop(guard);
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn force_release_zeroes_once() {
        let tracker = ConnectionTracker::new();
        let stale: Vec<_> = (0..3).map(|_| tracker.track()).collect();
        assert_eq!(tracker.force_release(), 3);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.force_release(), 0);

        // A connection tracked after the release must not be undercounted
        // when the abandoned ones finally close.
        let fresh = tracker.track();
        drop(stale);
        assert_eq!(tracker.active_count(), 1);
        drop(fresh);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_empty() {
        let tracker = ConnectionTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .expect("idle tracker should not block");
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_last_release() {
        let tracker = ConnectionTracker::new();
        let guards: Vec<_> = (0..5).map(|_| tracker.track()).collect();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guards);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let tracker = ConnectionTracker::new();
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = TrackedConnection::new(client, peer(), tracker.track());
        assert_eq!(tracker.active_count(), 1);

        conn.close().await.unwrap();
        assert_eq!(tracker.active_count(), 0);
        conn.close().await.unwrap();
        drop(conn);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn io_passes_through() {
        use tokio::io::AsyncReadExt;

        let tracker = ConnectionTracker::new();
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = TrackedConnection::new(client, peer(), tracker.track());

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
