//! Operator control of a running server through its pid file.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::Signal;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no pid file configured; pass --pid-file or set restart.pid_file")]
    NoPidFile,

    #[error("failed to read pid file {path}: {source}")]
    ReadPidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pid file {path} does not hold a pid: {content:?}")]
    InvalidPid { path: PathBuf, content: String },

    #[error("process {0} is not running")]
    NotRunning(i32),

    #[error("failed to send {signal} to {pid}: {source}")]
    Signal {
        pid: i32,
        signal: Signal,
        #[source]
        source: io::Error,
    },
}

/// Read the pid recorded in `path`.
pub fn read_pid(path: &Path) -> Result<i32, ControlError> {
    let content = std::fs::read_to_string(path).map_err(|source| ControlError::ReadPidFile {
        path: path.to_path_buf(),
        source,
    })?;
    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ControlError::InvalidPid {
            path: path.to_path_buf(),
            content,
        }),
    }
}

/// Whether a process with this pid exists.
pub fn is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs the existence and permission check only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // Exists, but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn send_signal(pid: i32, signal: Signal) -> Result<(), ControlError> {
    if !is_alive(pid) {
        return Err(ControlError::NotRunning(pid));
    }
    // SAFETY: plain kill(2); pid was checked to be positive when read.
    if unsafe { libc::kill(pid, signal.as_raw()) } < 0 {
        return Err(ControlError::Signal {
            pid,
            signal,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
