//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate inheritance → Bind or adopt listeners → Register servers
//!     → Pid file → Readiness to parent → Signal handlers → Serve
//!
//! Restart (signals.rs → fork.rs):
//!     SIGHUP → fork guard (registry.rs) → export listeners
//!     → spawn child with fds at 3.. and --graceful --socketorder=...
//!     → immediate handoff: wait for readiness, then drain
//!
//! Shutdown (signals.rs → shutdown.rs):
//!     SIGTERM/SIGINT → Running → ShuttingDown (state.rs)
//!     → drain timer → close listener → wait for connections → Terminated
//! ```
//!
//! # Design Decisions
//! - Ordered startup: every listener first, then tasks
//! - State only moves forward: Running → ShuttingDown → Terminated
//! - At most one fork per process; a failed fork is not retried
//! - Drain has an optional deadline after which connections are abandoned

pub mod fork;
pub mod hooks;
pub mod registry;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;

pub use fork::{ForkCoordinator, HandoffMode, LaunchSpec};
pub use hooks::{HookPhase, SignalHooks};
pub use registry::ServerRegistry;
pub use signals::{Signal, SignalHandler};
pub use startup::{StartupError, Supervisor};
pub use state::ServerState;
