//! The contract between the restart core and the application.

use std::future::Future;
use std::io;

use crate::net::{ServerStream, TrackedConnection};

/// Processes one accepted connection to completion.
///
/// The connection counts against the server's drain until it is closed or
/// dropped, so a handler that returns early releases it early.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(
        &self,
        conn: TrackedConnection<ServerStream>,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(TrackedConnection<ServerStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<()>> + Send,
{
    fn handle(
        &self,
        conn: TrackedConnection<ServerStream>,
    ) -> impl Future<Output = io::Result<()>> + Send {
        self(conn)
    }
}
