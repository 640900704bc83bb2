//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGHUP, SIGINT, SIGTERM)
//! - Run pre/post hooks around the built-in handling
//! - SIGHUP → spawn the replacement process (state unchanged)
//! - SIGINT / SIGTERM → graceful shutdown of the server
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - One handler task per server, started only after every listener is bound
//! - Repeated termination signals are no-ops once shutdown has begun

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::lifecycle::fork::{ForkCoordinator, ForkOutcome};
use crate::lifecycle::hooks::HookPhase;
use crate::server::GraceServer;

/// The signals this subsystem distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGHUP: restart.
    Hangup,
    /// SIGINT: graceful shutdown.
    Interrupt,
    /// SIGTERM: graceful shutdown.
    Terminate,
    /// Anything else, by number.
    Other(i32),
}

impl Signal {
    pub fn from_raw(signum: i32) -> Self {
        match signum {
            libc::SIGHUP => Signal::Hangup,
            libc::SIGINT => Signal::Interrupt,
            libc::SIGTERM => Signal::Terminate,
            other => Signal::Other(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Hangup => libc::SIGHUP,
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Other(signum) => signum,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Hangup => f.write_str("SIGHUP"),
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Terminate => f.write_str("SIGTERM"),
            Signal::Other(signum) => write!(f, "signal {signum}"),
        }
    }
}

/// Drives one server's lifecycle from signals.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    server: GraceServer,
    fork: Arc<ForkCoordinator>,
}

impl SignalHandler {
    pub fn new(server: GraceServer, fork: Arc<ForkCoordinator>) -> Self {
        Self { server, fork }
    }

    /// Handle one signal: pre hooks, built-in action, post hooks.
    pub async fn dispatch(&self, signal: Signal) {
        let pid = std::process::id();
        let hooks = self.server.hooks();
        hooks.fire(HookPhase::Pre, signal);

        match signal {
            Signal::Hangup => {
                tracing::info!(pid, address = %self.server.address(), "Received SIGHUP, forking");
                match self.fork.restart() {
                    Ok(ForkOutcome::Spawned { pid: child_pid }) => {
                        tracing::debug!(pid, child_pid, "Restart handed to replacement")
                    }
                    Ok(ForkOutcome::AlreadyForked) => {}
                    Err(e) => tracing::error!(pid, error = %e, "Fork failed; continuing to serve"),
                }
            }
            Signal::Interrupt | Signal::Terminate => {
                tracing::info!(pid, address = %self.server.address(), signal = %signal, "Received termination signal");
                self.server.shutdown().await;
            }
            Signal::Other(_) => {
                tracing::info!(pid, signal = %signal, "Received signal, nothing to do");
            }
        }

        hooks.fire(HookPhase::Post, signal);
    }

    /// Register the OS signal streams and spawn the task feeding [`dispatch`](Self::dispatch).
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        Ok(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = hangup.recv() => Signal::Hangup,
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = terminate.recv() => Signal::Terminate,
                    else => break,
                };
                self.dispatch(received).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;

    use crate::lifecycle::fork::{HandoffMode, LaunchSpec};
    use crate::lifecycle::hooks::SignalHooks;
    use crate::lifecycle::registry::ServerRegistry;
    use crate::lifecycle::state::ServerState;
    use crate::net::{ConnectionTracker, GraceListener, Transport};
    use crate::server::ServerOptions;

    async fn handler_with(hooks: SignalHooks, program: &str) -> (SignalHandler, Arc<ServerRegistry>) {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = GraceListener::new(tcp, ConnectionTracker::new(), None).unwrap();
        let server = GraceServer::new(
            ServerOptions {
                address: ":8080".to_string(),
                drain_timeout: Some(Duration::from_secs(30)),
                is_child: false,
            },
            listener,
            Transport::Plain,
            hooks,
        );
        let registry = Arc::new(ServerRegistry::new());
        registry.register(server.clone()).unwrap();
        let fork = Arc::new(ForkCoordinator::new(
            Arc::clone(&registry),
            LaunchSpec {
                program: program.into(),
                args: Vec::new(),
            },
            HandoffMode::Graceful,
            Duration::from_secs(1),
        ));
        (SignalHandler::new(server, fork), registry)
    }

    #[test]
    fn raw_numbers_round_trip() {
        for signal in [Signal::Hangup, Signal::Interrupt, Signal::Terminate, Signal::Other(libc::SIGUSR1)] {
            assert_eq!(Signal::from_raw(signal.as_raw()), signal);
        }
    }

    #[tokio::test]
    async fn hooks_wrap_builtin_handling() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = SignalHooks::new();
        {
            let log = Arc::clone(&log);
            hooks.register(HookPhase::Pre, Signal::Terminate, move || log.lock().unwrap().push("pre"));
        }
        {
            let log = Arc::clone(&log);
            hooks.register(HookPhase::Post, Signal::Terminate, move || log.lock().unwrap().push("post"));
        }

        let (handler, _registry) = handler_with(hooks, "/bin/true").await;
        assert_eq!(handler.server.state(), ServerState::Running);

        handler.dispatch(Signal::Terminate).await;
        assert_eq!(*log.lock().unwrap(), vec!["pre", "post"]);
        assert_eq!(handler.server.state(), ServerState::ShuttingDown);
    }

    #[tokio::test]
    async fn second_termination_signal_is_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = SignalHooks::new();
        {
            let calls = Arc::clone(&calls);
            hooks.register(HookPhase::Post, Signal::Interrupt, move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (handler, _registry) = handler_with(hooks, "/bin/true").await;

        handler.dispatch(Signal::Terminate).await;
        handler.dispatch(Signal::Interrupt).await;

        assert_eq!(handler.server.state(), ServerState::ShuttingDown);
        // Hooks still fire; only the built-in action is skipped.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_termination_signal_starts_no_second_timer() {
        let (handler, _registry) = handler_with(SignalHooks::new(), "/bin/true").await;
        let tracker = handler.server.tracker().clone();
        let _outstanding = tracker.track();

        // Drain timeout is 30s: the first timer fires at t=30s.
        handler.dispatch(Signal::Terminate).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        handler.dispatch(Signal::Interrupt).await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(tracker.active_count(), 0);

        // A timer started by the second signal would fire at t=50s.
        let _late = tracker.track();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(tracker.active_count(), 1);
    }

    #[tokio::test]
    async fn hangup_forks_once_and_keeps_serving() {
        let (handler, registry) = handler_with(SignalHooks::new(), "/bin/true").await;

        handler.dispatch(Signal::Hangup).await;
        handler.dispatch(Signal::Hangup).await;

        assert!(registry.has_forked());
        assert_eq!(handler.server.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn failed_fork_keeps_serving() {
        let (handler, registry) = handler_with(SignalHooks::new(), "/nonexistent/grace-server").await;

        handler.dispatch(Signal::Hangup).await;

        assert!(registry.has_forked());
        assert_eq!(handler.server.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn other_signals_change_nothing() {
        let (handler, registry) = handler_with(SignalHooks::new(), "/bin/true").await;
        handler.dispatch(Signal::Other(libc::SIGUSR2)).await;
        assert_eq!(handler.server.state(), ServerState::Running);
        assert!(!registry.has_forked());
    }
}
