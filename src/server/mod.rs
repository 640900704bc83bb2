//! Server instances.
//!
//! # Data Flow
//! ```text
//! GraceListener::accept
//!     → TrackedConnection<TcpStream>
//!     → Transport::establish (TLS handshake when configured)
//!     → ConnectionHandler::handle (one task per connection)
//!     → guard released on close or drop
//! ```

pub mod handler;
pub mod instance;

pub use handler::ConnectionHandler;
pub use instance::{GraceServer, ServerError, ServerOptions};
