//! One listening server and its serve/drain lifecycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::lifecycle::fork::InheritedListener;
use crate::lifecycle::hooks::SignalHooks;
use crate::lifecycle::shutdown::run_drain_timer;
use crate::lifecycle::state::{ServerState, StateCell};
use crate::net::{ConnectionTracker, GraceListener, ListenerError, Protocol, Transport};
use crate::server::handler::ConnectionHandler;

/// Pause after a failed accept (e.g. out of descriptors) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server {0} is already serving")]
    AlreadyServing(String),
}

/// Per-server settings that do not come from the socket itself.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Configured address, the key used for descriptor inheritance.
    pub address: String,
    /// How long a drain may take before outstanding connections are abandoned.
    /// `None` waits forever.
    pub drain_timeout: Option<Duration>,
    /// Whether this process was spawned by a restart.
    pub is_child: bool,
}

/// A server instance. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct GraceServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    options: ServerOptions,
    transport: Transport,
    listener: GraceListener,
    state: StateCell,
    hooks: SignalHooks,
    serving: AtomicBool,
    drain_timer: Mutex<Option<JoinHandle<()>>>,
}

impl GraceServer {
    pub fn new(
        options: ServerOptions,
        listener: GraceListener,
        transport: Transport,
        hooks: SignalHooks,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                options,
                transport,
                listener,
                state: StateCell::new(),
                hooks,
                serving: AtomicBool::new(false),
                drain_timer: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.options.address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.listener.local_addr()
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.transport.protocol()
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.get()
    }

    pub fn is_child(&self) -> bool {
        self.inner.options.is_child
    }

    pub fn hooks(&self) -> &SignalHooks {
        &self.inner.hooks
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        self.inner.listener.tracker()
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker().active_count()
    }

    /// Accept and dispatch connections until shut down, then wait for the
    /// outstanding ones (or the drain timeout) before returning.
    pub async fn serve<H: ConnectionHandler>(&self, handler: Arc<H>) -> Result<(), ServerError> {
        if self.inner.serving.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyServing(self.address().to_string()));
        }

        let pid = std::process::id();
        tracing::info!(
            pid,
            address = %self.address(),
            local_addr = %self.local_addr(),
            protocol = %self.protocol(),
            child = self.is_child(),
            "Server running"
        );

        loop {
            match self.inner.listener.accept().await {
                Ok(conn) => {
                    let transport = self.inner.transport.clone();
                    let handler = Arc::clone(&handler);
                    let span = tracing::info_span!(
                        "connection",
                        connection_id = %conn.id(),
                        peer_addr = %conn.peer_addr(),
                    );
                    tokio::spawn(
                        async move {
                            let conn = match transport.establish(conn).await {
                                Ok(conn) => conn,
                                Err(e) => {
                                    tracing::debug!(error = %e, "Transport handshake failed");
                                    return;
                                }
                            };
                            if let Err(e) = handler.handle(conn).await {
                                tracing::debug!(error = %e, "Connection ended with error");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) if e.is_shutdown() => break,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(address = %self.address(), error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(e) => {
                    tracing::warn!(address = %self.address(), error = %e, "Accept loop stopped");
                    break;
                }
            }
        }

        tracing::info!(
            pid,
            address = %self.address(),
            active_connections = self.active_connections(),
            "Waiting for connections to finish..."
        );
        self.tracker().wait_idle().await;

        if let Some(timer) = self.take_drain_timer() {
            timer.abort();
        }
        // The listener only closes through `shutdown`, but stay monotonic regardless.
        self.inner.state.transition(ServerState::Running, ServerState::ShuttingDown);
        self.inner.state.transition(ServerState::ShuttingDown, ServerState::Terminated);

        tracing::info!(pid, address = %self.address(), "Server terminated");
        Ok(())
    }

    /// Stop accepting and start draining.
    ///
    /// Only acts while `Running`; returns whether this call started the drain.
    pub async fn shutdown(&self) -> bool {
        if !self.inner.state.transition(ServerState::Running, ServerState::ShuttingDown) {
            tracing::debug!(
                address = %self.address(),
                state = %self.state(),
                "Shutdown already in progress"
            );
            return false;
        }

        let pid = std::process::id();
        if let Some(timeout) = self.inner.options.drain_timeout {
            let timer = tokio::spawn(run_drain_timer(
                self.tracker().clone(),
                timeout,
                self.address().to_string(),
            ));
            *self.lock_drain_timer() = Some(timer);
        }

        match self.inner.listener.close().await {
            Ok(()) => tracing::info!(pid, address = %self.address(), "Listener closed"),
            Err(ListenerError::InvalidOperation) => {
                tracing::debug!(pid, address = %self.address(), "Listener was already closed")
            }
            Err(e) => tracing::warn!(pid, address = %self.address(), error = %e, "Listener close failed"),
        }
        true
    }

    /// Describe this server's listener for a child process.
    pub fn export(&self) -> Result<InheritedListener, ListenerError> {
        Ok(InheritedListener {
            address: self.address().to_string(),
            protocol: self.protocol(),
            fd: self.inner.listener.export_descriptor()?,
        })
    }

    fn take_drain_timer(&self) -> Option<JoinHandle<()>> {
        self.lock_drain_timer().take()
    }

    fn lock_drain_timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .drain_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for GraceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraceServer")
            .field("address", &self.address())
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}
