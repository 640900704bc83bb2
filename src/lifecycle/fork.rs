//! Launching the replacement process.
//!
//! # Responsibilities
//! - Spawn at most one child per process generation
//! - Place every live listener at `3 + offset` in the child
//! - Rebuild the command line with the restart marker and socket order
//! - In immediate handoff, hand over only after the child confirms it has
//!   bound every inherited listener
//!
//! # Child command line
//! ```text
//! <program> <original args up to any previous --graceful> --graceful [--socketorder=a,b,...]
//! ```
//! `--socketorder` is only present with more than one listener; its order is
//! the order the descriptors were placed in.

use std::ffi::OsString;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::lifecycle::hooks::HookPhase;
use crate::lifecycle::registry::ServerRegistry;
use crate::lifecycle::signals::Signal;
use crate::net::inherit::{dup_above, INHERIT_FD_FLOOR, LISTEN_FDS_START};
use crate::net::{ListenerError, Protocol};
use crate::observability::metrics;

/// Marks a process as spawned by a restart.
pub const GRACEFUL_FLAG: &str = "--graceful";

/// Prefix of the argument mapping inherited descriptors to addresses.
pub const SOCKET_ORDER_FLAG: &str = "--socketorder";

/// Environment variable naming the descriptor a child writes its readiness to.
pub const READY_FD_ENV: &str = "GRACE_READY_FD";

/// What happens to the parent once a child has been spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// The parent keeps serving until it receives its own SIGTERM/SIGINT.
    #[default]
    Graceful,
    /// The parent drains as soon as the child confirms readiness.
    Immediate,
}

/// One listener as handed to a child: which address, which protocol, which socket.
#[derive(Debug)]
pub struct InheritedListener {
    pub address: String,
    pub protocol: Protocol,
    pub fd: OwnedFd,
}

/// Descriptors for a child, in the order they will be placed.
#[derive(Debug)]
pub struct ForkPlan {
    listeners: Vec<InheritedListener>,
}

impl ForkPlan {
    pub fn new(listeners: Vec<InheritedListener>) -> Self {
        Self { listeners }
    }

    /// Addresses in descriptor order, i.e. the `--socketorder` value.
    pub fn order(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.address.clone()).collect()
    }

    pub fn listeners(&self) -> &[InheritedListener] {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Program and arguments used to start the replacement.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<OsString>,
}

impl LaunchSpec {
    /// Re-run this process the way it was started.
    ///
    /// Uses `argv[0]` rather than the resolved executable so that a binary
    /// replaced on disk is the one that gets started.
    pub fn current() -> io::Result<Self> {
        let mut argv = std::env::args_os();
        let program = match argv.next() {
            Some(program) if !program.is_empty() => PathBuf::from(program),
            _ => std::env::current_exe()?,
        };
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }
}

/// Build the child's arguments from the current ones.
pub fn child_args(args: &[OsString], order: &[String]) -> Vec<OsString> {
    let mut child: Vec<OsString> = args
        .iter()
        .take_while(|arg| *arg != GRACEFUL_FLAG)
        .cloned()
        .collect();
    child.push(GRACEFUL_FLAG.into());
    if order.len() > 1 {
        child.push(format!("{}={}", SOCKET_ORDER_FLAG, order.join(",")).into());
    }
    child
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// This process already spawned its replacement.
    AlreadyForked,
    Spawned { pid: u32 },
}

#[derive(Debug, Error)]
pub enum ForkError {
    #[error("failed to export listeners: {0}")]
    Export(#[from] ListenerError),

    #[error("failed to create readiness pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Spawns the replacement process on a restart signal.
#[derive(Debug)]
pub struct ForkCoordinator {
    registry: Arc<ServerRegistry>,
    launch: LaunchSpec,
    handoff: HandoffMode,
    readiness_timeout: Duration,
}

impl ForkCoordinator {
    pub fn new(
        registry: Arc<ServerRegistry>,
        launch: LaunchSpec,
        handoff: HandoffMode,
        readiness_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            launch,
            handoff,
            readiness_timeout,
        }
    }

    pub fn handoff(&self) -> HandoffMode {
        self.handoff
    }

    /// Spawn the replacement, unless this process already did.
    ///
    /// A failure leaves the fork guard set: there is no second attempt in
    /// this process and the current servers keep running.
    pub fn restart(&self) -> Result<ForkOutcome, ForkError> {
        let plan = match self.registry.begin_fork() {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                tracing::info!(pid = std::process::id(), "Restart already in progress, ignoring");
                return Ok(ForkOutcome::AlreadyForked);
            }
            Err(e) => {
                metrics::fork_failed("export");
                return Err(e.into());
            }
        };

        let result = self.spawn(plan);
        if result.is_err() {
            metrics::fork_failed("spawn");
        }
        result
    }

    fn spawn(&self, plan: ForkPlan) -> Result<ForkOutcome, ForkError> {
        let order = plan.order();
        let args = child_args(&self.launch.args, &order);

        let mut sources: Vec<RawFd> = plan.listeners().iter().map(|l| l.fd.as_raw_fd()).collect();

        let mut command = Command::new(&self.launch.program);
        command
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .env_remove(READY_FD_ENV);

        let readiness = match self.handoff {
            HandoffMode::Graceful => None,
            HandoffMode::Immediate => {
                let (read, write) = readiness_pipe().map_err(ForkError::Pipe)?;
                let target = LISTEN_FDS_START + sources.len() as RawFd;
                command.env(READY_FD_ENV, target.to_string());
                sources.push(write.as_raw_fd());
                Some((read, write))
            }
        };

        // SAFETY: the closure runs between fork and exec and only calls dup2,
        // which is async-signal-safe. Every source is >= INHERIT_FD_FLOOR, so
        // no placement overwrites a source that is still to be placed.
        unsafe {
            command.pre_exec(move || {
                for (slot, fd) in sources.iter().enumerate() {
                    if libc::dup2(*fd, LISTEN_FDS_START + slot as RawFd) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        tracing::info!(
            pid = std::process::id(),
            program = %self.launch.program.display(),
            args = ?args,
            listeners = ?order,
            handoff = ?self.handoff,
            "Forking replacement process"
        );

        let child = command.spawn().map_err(|source| ForkError::Spawn {
            program: self.launch.program.display().to_string(),
            source,
        })?;
        // The child has its copies; ours close here.
        drop(plan);

        let pid = child.id().unwrap_or_default();
        metrics::fork_spawned();
        tracing::info!(pid = std::process::id(), child_pid = pid, "Replacement process started");

        if let Some((read, write)) = readiness {
            drop(write);
            tokio::spawn(await_readiness(
                read,
                child,
                self.readiness_timeout,
                Arc::clone(&self.registry),
            ));
        }

        Ok(ForkOutcome::Spawned { pid })
    }
}

/// Immediate handoff: drain this process once the child reports ready.
/// Anything else (exit, closed pipe, timeout) kills the child and keeps us serving.
async fn await_readiness(
    read: OwnedFd,
    mut child: Child,
    timeout: Duration,
    registry: Arc<ServerRegistry>,
) {
    let child_pid = child.id().unwrap_or_default();
    let pending = tokio::task::spawn_blocking(move || {
        let mut pipe = std::fs::File::from(read);
        let mut byte = [0u8; 1];
        pipe.read(&mut byte)
    });

    let failure = match tokio::time::timeout(timeout, pending).await {
        Ok(Ok(Ok(1))) => None,
        Ok(Ok(Ok(_))) => Some("replacement closed its readiness pipe without confirming".to_string()),
        Ok(Ok(Err(e))) => Some(format!("reading readiness failed: {e}")),
        Ok(Err(e)) => Some(format!("readiness reader panicked: {e}")),
        Err(_) => Some(format!("no readiness within {timeout:?}")),
    };

    match failure {
        None => {
            tracing::info!(
                pid = std::process::id(),
                child_pid,
                "Replacement confirmed ready, draining this process"
            );
            // Same path as a SIGTERM, hooks included.
            for server in registry.servers() {
                server.hooks().fire(HookPhase::Pre, Signal::Terminate);
                server.shutdown().await;
                server.hooks().fire(HookPhase::Post, Signal::Terminate);
            }
        }
        Some(reason) => {
            metrics::fork_failed("readiness");
            tracing::error!(
                pid = std::process::id(),
                child_pid,
                reason = %reason,
                "Replacement did not become ready; killing it and continuing to serve"
            );
            if let Err(e) = child.start_kill() {
                tracing::debug!(child_pid, error = %e, "Replacement already gone");
            }
            let _ = child.wait().await;
        }
    }
}

/// A pipe whose ends are parked above the inheritance floor, close-on-exec.
fn readiness_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe just returned two fresh descriptors owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((
        dup_above(read.as_raw_fd(), INHERIT_FD_FLOOR)?,
        dup_above(write.as_raw_fd(), INHERIT_FD_FLOOR)?,
    ))
}

/// Tell the parent this process is serving, if it asked to be told.
///
/// Called by a child once every inherited listener is adopted.
pub fn notify_ready() -> io::Result<bool> {
    let Some(fd) = std::env::var(READY_FD_ENV)
        .ok()
        .and_then(|v| v.parse::<RawFd>().ok())
    else {
        return Ok(false);
    };
    if fd < LISTEN_FDS_START {
        return Ok(false);
    }

    // SAFETY: the parent placed the pipe's write end at this number for us
    // alone; nothing else in this process refers to it.
    let mut pipe = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    io::Write::write_all(&mut pipe, b"1")?;
    tracing::info!(pid = std::process::id(), fd, "Readiness reported to parent");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    fn order(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn single_listener_gets_marker_only() {
        let args = child_args(&os(&["--config", "grace.toml"]), &order(&[":8080"]));
        assert_eq!(args, os(&["--config", "grace.toml", "--graceful"]));
    }

    #[test]
    fn several_listeners_get_socket_order() {
        let args = child_args(&os(&["--config", "grace.toml"]), &order(&[":8080", ":8443"]));
        assert_eq!(
            args,
            os(&["--config", "grace.toml", "--graceful", "--socketorder=:8080,:8443"])
        );
    }

    #[test]
    fn previous_marker_and_order_are_dropped() {
        let args = child_args(
            &os(&["--config", "grace.toml", "--graceful", "--socketorder=:9000,:9001"]),
            &order(&[":8443", ":8080"]),
        );
        assert_eq!(
            args,
            os(&["--config", "grace.toml", "--graceful", "--socketorder=:8443,:8080"])
        );
    }

    #[test]
    fn handoff_mode_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            handoff: HandoffMode,
        }
        let w: Wrapper = toml::from_str("handoff = \"immediate\"").unwrap();
        assert_eq!(w.handoff, HandoffMode::Immediate);
        assert_eq!(HandoffMode::default(), HandoffMode::Graceful);
    }

    #[test]
    fn readiness_pipe_is_parked_high() {
        let (read, write) = readiness_pipe().unwrap();
        assert!(read.as_raw_fd() >= INHERIT_FD_FLOOR);
        assert!(write.as_raw_fd() >= INHERIT_FD_FLOOR);

        let mut writer = std::fs::File::from(write);
        io::Write::write_all(&mut writer, b"1").unwrap();
        drop(writer);

        let mut reader = std::fs::File::from(read);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"1");
    }
}
