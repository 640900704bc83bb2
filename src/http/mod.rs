//! HTTP protocol handling for the demo application.
//!
//! # Data Flow
//! ```text
//! TrackedConnection<ServerStream>
//!     → service.rs (hyper-util auto: HTTP/1.1 or HTTP/2)
//!     → request.rs (request ID set and propagated)
//!     → Axum router: GET / (identity), GET /healthz
//!     → Send to client
//! ```

pub mod request;
pub mod service;

pub use request::{MakeRequestUuid, X_REQUEST_ID};
pub use service::{build_router, ConnectionInfo, HttpHandler};
