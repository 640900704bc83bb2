//! Startup orchestration.
//!
//! # Responsibilities
//! - Acquire every configured listener: bind fresh, or adopt from the parent
//! - Register servers and install per-server signal handlers
//! - Record the pid and confirm readiness to a waiting parent
//! - Start serve loops
//! - Wait for every server to terminate, then clean up
//!
//! # Design Decisions
//! - Fail fast: any listener error is fatal before a single task is spawned
//! - Signal handlers start only once every listener is bound
//! - The pid file belongs to whichever process wrote it last

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::schema::ServerConfig;
use crate::config::GraceConfig;
use crate::lifecycle::fork::{notify_ready, ForkCoordinator, LaunchSpec};
use crate::lifecycle::hooks::{HookPhase, SignalHooks};
use crate::lifecycle::registry::{RegistryError, ServerRegistry};
use crate::lifecycle::signals::{Signal, SignalHandler};
use crate::net::inherit::is_socket;
use crate::net::listener::bind;
use crate::net::tls::load_tls_acceptor;
use crate::net::{ConnectionTracker, GraceListener, InheritError, Inheritance, Transport};
use crate::server::{ConnectionHandler, GraceServer, ServerError, ServerOptions};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Inherit(#[from] InheritError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS material for {address}: {source}")]
    Tls {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare listener for {address}: {source}")]
    Listener {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to write pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to report readiness to parent: {0}")]
    Readiness(#[source] io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Owns the registry and runs every configured server to completion.
pub struct Supervisor {
    config: GraceConfig,
    inheritance: Inheritance,
    launch: LaunchSpec,
    hooks: SignalHooks,
    registry: Arc<ServerRegistry>,
}

impl Supervisor {
    pub fn new(config: GraceConfig, inheritance: Inheritance, launch: LaunchSpec) -> Self {
        Self {
            config,
            inheritance,
            launch,
            hooks: SignalHooks::new(),
            registry: Arc::new(ServerRegistry::new()),
        }
    }

    /// Register a hook for every server, around the built-in handling of `signal`.
    pub fn on_signal<F>(&mut self, phase: HookPhase, signal: Signal, hook: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.register(phase, signal, hook);
        self
    }

    pub fn registry(&self) -> Arc<ServerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Start every server and return once all of them have terminated.
    pub async fn run<H: ConnectionHandler>(self, handler: Arc<H>) -> Result<(), StartupError> {
        let pid = std::process::id();
        let servers = self.acquire_servers().await?;

        for server in &servers {
            self.registry.register(server.clone())?;
        }

        let fork = Arc::new(ForkCoordinator::new(
            Arc::clone(&self.registry),
            self.launch.clone(),
            self.config.restart.handoff,
            self.config.timeouts.readiness_timeout(),
        ));

        // Installed before anyone can learn our pid: an early SIGHUP must not
        // hit the default action.
        let mut signal_tasks = Vec::with_capacity(servers.len());
        for server in &servers {
            match SignalHandler::new(server.clone(), Arc::clone(&fork)).spawn() {
                Ok(task) => signal_tasks.push(task),
                Err(e) => {
                    signal_tasks.iter().for_each(|t| t.abort());
                    return Err(StartupError::Signals(e));
                }
            }
        }

        if let Err(e) = self.announce() {
            signal_tasks.iter().for_each(|t| t.abort());
            return Err(e);
        }

        let serve_tasks: Vec<_> = servers
            .iter()
            .map(|server| {
                let server = server.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { server.serve(handler).await })
            })
            .collect();

        tracing::info!(
            pid,
            servers = servers.len(),
            child = self.inheritance.is_child,
            "All servers started"
        );

        let mut outcome = Ok(());
        for (server, task) in servers.iter().zip(serve_tasks) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(pid, address = %server.address(), error = %e, "Server failed");
                    if outcome.is_ok() {
                        outcome = Err(e.into());
                    }
                }
                Err(e) => {
                    tracing::error!(pid, address = %server.address(), error = %e, "Serve task panicked")
                }
            }
            self.registry.deregister(server.address());
        }

        for task in signal_tasks {
            task.abort();
        }

        if let Some(path) = &self.config.restart.pid_file {
            remove_pid_file(path);
        }

        tracing::info!(pid, "Shutdown complete");
        outcome
    }

    /// Make this process known: pid file, then readiness to a waiting parent.
    fn announce(&self) -> Result<(), StartupError> {
        if let Some(path) = &self.config.restart.pid_file {
            write_pid_file(path)?;
        }
        if self.inheritance.is_child {
            // A parent that did not ask for readiness simply has no pipe.
            notify_ready().map_err(StartupError::Readiness)?;
        }
        Ok(())
    }

    /// Bind or adopt every listener. Nothing is spawned until all succeed.
    async fn acquire_servers(&self) -> Result<Vec<GraceServer>, StartupError> {
        let addresses: Vec<&str> = self.config.servers.iter().map(|s| s.address.as_str()).collect();
        self.inheritance.validate(&addresses)?;
        if self.inheritance.is_child {
            for server_config in &self.config.servers {
                let fd = self.inheritance.descriptor_for(&server_config.address)?;
                if !is_socket(fd) {
                    return Err(InheritError::NotASocket {
                        fd,
                        address: server_config.address.clone(),
                    }
                    .into());
                }
            }
        }

        let mut servers = Vec::with_capacity(self.config.servers.len());
        for server_config in &self.config.servers {
            servers.push(self.acquire_server(server_config).await?);
        }
        Ok(servers)
    }

    async fn acquire_server(&self, server_config: &ServerConfig) -> Result<GraceServer, StartupError> {
        let address = server_config.address.clone();

        let transport = match &server_config.tls {
            Some(tls) => {
                let acceptor = load_tls_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path))
                    .await
                    .map_err(|source| StartupError::Tls {
                        address: address.clone(),
                        source,
                    })?;
                Transport::Tls(acceptor)
            }
            None => Transport::Plain,
        };

        let listener: TcpListener = if self.inheritance.is_child {
            self.inheritance.adopt(&address)?
        } else {
            bind(&address).await.map_err(|source| StartupError::Bind {
                address: address.clone(),
                source,
            })?
        };

        let listener = GraceListener::new(
            listener,
            ConnectionTracker::new(),
            self.config.timeouts.keepalive(),
        )
        .map_err(|source| StartupError::Listener {
            address: address.clone(),
            source,
        })?;

        Ok(GraceServer::new(
            ServerOptions {
                address,
                drain_timeout: self.config.timeouts.drain_timeout(),
                is_child: self.inheritance.is_child,
            },
            listener,
            transport,
            self.hooks.clone(),
        ))
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("servers", &self.config.servers.len())
            .field("inheritance", &self.inheritance)
            .field("registry", &self.registry)
            .finish()
    }
}

fn write_pid_file(path: &Path) -> Result<(), StartupError> {
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n")).map_err(|source| StartupError::PidFile {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(pid, path = %path.display(), "Pid file written");
    Ok(())
}

/// Remove the pid file, unless a replacement has since claimed it.
fn remove_pid_file(path: &Path) {
    let pid = std::process::id();
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().parse::<u32>().ok() == Some(pid) => {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(pid, path = %path.display(), error = %e, "Failed to remove pid file");
            }
        }
        Ok(_) => tracing::debug!(pid, path = %path.display(), "Pid file now owned by replacement"),
        Err(e) => tracing::debug!(pid, path = %path.display(), error = %e, "Pid file already gone"),
    }
}
