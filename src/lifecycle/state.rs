//! Server lifecycle state machine.
//!
//! # States
//! - Running: accepting and serving connections
//! - ShuttingDown: listener closed, draining outstanding connections
//! - Terminated: drain finished, serve loop returned
//!
//! # State Transitions
//! ```text
//! Running → ShuttingDown: SIGINT / SIGTERM (or confirmed immediate handoff)
//! ShuttingDown → Terminated: outstanding connections reached zero
//! ```
//!
//! Transitions only move forward. A transition requested from the wrong
//! state is refused, which is what makes shutdown idempotent under
//! concurrent signal delivery.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one server instance.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Running = 0,
    ShuttingDown = 1,
    Terminated = 2,
}

impl From<u8> for ServerState {
    fn from(val: u8) -> Self {
        match val {
            0 => ServerState::Running,
            1 => ServerState::ShuttingDown,
            _ => ServerState::Terminated,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting-down",
            ServerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a [`ServerState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// A new cell in the `Running` state.
    pub fn new() -> Self {
        Self(AtomicU8::new(ServerState::Running as u8))
    }

    pub fn get(&self) -> ServerState {
        self.0.load(Ordering::SeqCst).into()
    }

    /// Move from `from` to `to`.
    ///
    /// Returns `false` without changing anything when the current state is
    /// not `from` or when `to` would move backwards.
    pub fn transition(&self, from: ServerState, to: ServerState) -> bool {
        if to <= from {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        assert_eq!(StateCell::new().get(), ServerState::Running);
    }

    #[test]
    fn forward_transitions_only() {
        let state = StateCell::new();
        assert!(state.transition(ServerState::Running, ServerState::ShuttingDown));
        assert!(!state.transition(ServerState::Running, ServerState::ShuttingDown));
        assert!(!state.transition(ServerState::ShuttingDown, ServerState::Running));
        assert!(state.transition(ServerState::ShuttingDown, ServerState::Terminated));
        assert_eq!(state.get(), ServerState::Terminated);
    }

    #[test]
    fn cannot_skip_from_wrong_state() {
        let state = StateCell::new();
        assert!(!state.transition(ServerState::ShuttingDown, ServerState::Terminated));
        assert_eq!(state.get(), ServerState::Running);
    }
}
