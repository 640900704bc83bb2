//! Listening socket wrapper that cooperates with drain and restart.
//!
//! # Responsibilities
//! - Bind to a configured address (Go-style `":8080"` accepted)
//! - Accept connections and count them against the server's tracker
//! - Apply per-connection socket tuning (keepalive)
//! - Close exactly once through a handshake with a background task
//! - Hand out duplicated descriptors for a forked child
//!
//! # Design Decisions
//! - Closing is reported to `accept` as [`ListenerError::Closed`], never as
//!   an I/O error, so the accept loop can tell shutdown from failure
//! - `close` does not return until the socket has actually been dropped

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::net::connection::{ConnectionTracker, TrackedConnection};
use crate::net::inherit::{dup_above, INHERIT_FD_FLOOR};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener was closed on purpose; the accept loop should stop.
    #[error("listener closed")]
    Closed,

    /// `close` was called on a listener that is already closed.
    #[error("invalid operation: listener already closed")]
    InvalidOperation,

    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to duplicate listening descriptor: {0}")]
    Export(#[source] io::Error),

    /// The close task went away before confirming (runtime shutting down).
    #[error("listener close handshake interrupted")]
    Handshake,
}

impl ListenerError {
    /// Whether this error means "the application closed us" rather than a failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ListenerError::Closed)
    }
}

type CloseRequest = oneshot::Sender<()>;

/// A listening socket whose accepts are tracked and whose close is a handshake.
#[derive(Debug)]
pub struct GraceListener {
    inner: Arc<RwLock<Option<TcpListener>>>,
    local_addr: SocketAddr,
    closing: CancellationToken,
    stopped: AtomicBool,
    close_tx: mpsc::Sender<CloseRequest>,
    tracker: ConnectionTracker,
    keepalive: Option<Duration>,
}

impl GraceListener {
    /// Wrap a bound listener. Must be called inside a Tokio runtime.
    pub fn new(
        listener: TcpListener,
        tracker: ConnectionTracker,
        keepalive: Option<Duration>,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(RwLock::new(Some(listener)));
        let closing = CancellationToken::new();
        let (close_tx, close_rx) = mpsc::channel(1);

        tokio::spawn(run_close_task(
            Arc::clone(&inner),
            closing.clone(),
            close_rx,
            local_addr,
        ));

        Ok(Self {
            inner,
            local_addr,
            closing,
            stopped: AtomicBool::new(false),
            close_tx,
            tracker,
            keepalive,
        })
    }

    /// Wait for the next connection.
    ///
    /// The connection is counted against the tracker before it is returned.
    pub async fn accept(&self) -> Result<TrackedConnection<TcpStream>, ListenerError> {
        if self.closing.is_cancelled() {
            return Err(ListenerError::Closed);
        }

        let slot = self.inner.read().await;
        let listener = slot.as_ref().ok_or(ListenerError::Closed)?;

        let (stream, peer_addr) = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(ListenerError::Closed),
            accepted = listener.accept() => accepted.map_err(ListenerError::Accept)?,
        };
        drop(slot);

        let guard = self.tracker.track();
        self.tune(&stream);

        tracing::debug!(
            connection_id = %guard.id(),
            peer_addr = %peer_addr,
            address = %self.local_addr,
            "Connection accepted"
        );

        Ok(TrackedConnection::new(stream, peer_addr, guard))
    }

    /// Close the listener. Only the first call succeeds.
    ///
    /// Later calls return [`ListenerError::InvalidOperation`] immediately.
    pub async fn close(&self) -> Result<(), ListenerError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::InvalidOperation);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.close_tx
            .send(reply_tx)
            .await
            .map_err(|_| ListenerError::Handshake)?;
        reply_rx.await.map_err(|_| ListenerError::Handshake)
    }

    /// Duplicate the listening descriptor for a child process.
    ///
    /// The duplicate has close-on-exec set and sits at or above
    /// [`INHERIT_FD_FLOOR`]; the fork places it in the child's range.
    pub fn export_descriptor(&self) -> Result<OwnedFd, ListenerError> {
        let slot = self.inner.try_read().map_err(|_| ListenerError::Closed)?;
        let listener = slot.as_ref().ok_or(ListenerError::Closed)?;
        dup_above(listener.as_raw_fd(), INHERIT_FD_FLOOR).map_err(ListenerError::Export)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    fn tune(&self, stream: &TcpStream) {
        let Some(period) = self.keepalive else {
            return;
        };
        let keepalive = TcpKeepalive::new().with_time(period);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(error = %e, "Failed to enable TCP keepalive");
        }
    }
}

/// Waits for the single close request, releases the socket, then confirms.
async fn run_close_task(
    inner: Arc<RwLock<Option<TcpListener>>>,
    closing: CancellationToken,
    mut requests: mpsc::Receiver<CloseRequest>,
    local_addr: SocketAddr,
) {
    let Some(reply) = requests.recv().await else {
        return;
    };

    closing.cancel();
    // Pending accepts hold read guards; they bail out on the cancellation above.
    let released = inner.write().await.take();
    drop(released);

    tracing::debug!(address = %local_addr, "Listening socket released");
    let _ = reply.send(());
}

/// Turn a configured address into something `bind` understands.
///
/// An empty host (`":8080"`) means every IPv4 interface.
pub fn normalize_address(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    }
}

/// Bind a fresh listening socket for `address`.
pub async fn bind(address: &str) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(normalize_address(address)).await?;
    tracing::info!(
        address = %address,
        local_addr = %listener.local_addr()?,
        "Listener bound"
    );
    Ok(listener)
}
