//! Zero-downtime restarts for listening servers.
//!
//! A running process hands its listening sockets to a freshly started copy
//! of itself on SIGHUP, then drains its own connections and exits when told
//! to (or, in immediate handoff, as soon as the copy reports ready).

pub mod config;
pub mod control;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;

pub use config::GraceConfig;
pub use lifecycle::{StartupError, Supervisor};
pub use server::{ConnectionHandler, GraceServer};
