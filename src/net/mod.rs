//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Cold start:  listener.rs bind(":8080")
//! Restart:     inherit.rs adopt(fd 3 + offset)
//!     → listener.rs (GraceListener: tracked accept, close handshake)
//!     → stream.rs (optional TLS handshake via tls.rs)
//!     → connection.rs (TrackedConnection, released once on close/drop)
//!     → Hand off to the connection handler
//! ```
//!
//! # Design Decisions
//! - Every accepted connection counts against its server's drain
//! - Closing the listener is a clean termination for the accept loop
//! - TLS handshakes run in the connection task, never in the accept loop

pub mod connection;
pub mod inherit;
pub mod listener;
pub mod stream;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker, TrackedConnection};
pub use inherit::{Inheritance, InheritError, LISTEN_FDS_START};
pub use listener::{GraceListener, ListenerError};
pub use stream::{Protocol, ServerStream, Transport};
