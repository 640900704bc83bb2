//! Registry of the servers running in this process.
//!
//! # Responsibilities
//! - Keep the live servers in registration order
//! - Assign each address a stable descriptor offset on first registration
//! - Hold the fork guard: at most one restart per process generation
//! - Produce the ordered set of descriptors a child inherits
//!
//! # Design Decisions
//! - Owned by the supervisor and shared by `Arc`, not a global
//! - One lock covers servers, offsets and the guard, so a fork sees a
//!   consistent snapshot
//! - The descriptor order and the `--socketorder` argument both come from the
//!   same [`ForkPlan`], so they cannot disagree

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::lifecycle::fork::{ForkPlan, InheritedListener};
use crate::net::ListenerError;
use crate::server::GraceServer;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a server is already registered for {0}")]
    DuplicateAddress(String),
}

#[derive(Default)]
struct RegistryState {
    servers: Vec<GraceServer>,
    offsets: HashMap<String, usize>,
    forked: bool,
}

/// The set of live servers plus the fork guard.
#[derive(Default)]
pub struct ServerRegistry {
    state: Mutex<RegistryState>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live server and return its address's offset.
    ///
    /// An address keeps the offset it was first given, even after its server
    /// has been deregistered.
    pub fn register(&self, server: GraceServer) -> Result<usize, RegistryError> {
        let mut state = self.lock();
        let address = server.address().to_string();
        if state.servers.iter().any(|s| s.address() == address) {
            return Err(RegistryError::DuplicateAddress(address));
        }

        let next = state.offsets.len();
        let offset = *state.offsets.entry(address.clone()).or_insert(next);
        state.servers.push(server);

        tracing::debug!(address = %address, offset, "Server registered");
        Ok(offset)
    }

    /// Remove the server for `address`, if registered.
    pub fn deregister(&self, address: &str) -> Option<GraceServer> {
        let mut state = self.lock();
        let pos = state.servers.iter().position(|s| s.address() == address)?;
        Some(state.servers.remove(pos))
    }

    pub fn offset_of(&self, address: &str) -> Option<usize> {
        self.lock().offsets.get(address).copied()
    }

    /// Live servers in registration order.
    pub fn servers(&self) -> Vec<GraceServer> {
        self.lock().servers.clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock()
            .servers
            .iter()
            .map(|s| s.address().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_forked(&self) -> bool {
        self.lock().forked
    }

    /// Claim the fork guard and collect the descriptors for the child.
    ///
    /// Returns `Ok(None)` when a fork already happened in this process. The
    /// guard stays set even if exporting a descriptor fails.
    pub fn begin_fork(&self) -> Result<Option<ForkPlan>, ListenerError> {
        let mut state = self.lock();
        if state.forked {
            return Ok(None);
        }
        state.forked = true;

        let mut ranked: Vec<(usize, &GraceServer)> = state
            .servers
            .iter()
            .map(|s| (state.offsets.get(s.address()).copied().unwrap_or(usize::MAX), s))
            .collect();
        ranked.sort_by_key(|(offset, _)| *offset);

        let listeners = ranked
            .into_iter()
            .map(|(_, server)| server.export())
            .collect::<Result<Vec<InheritedListener>, _>>()?;

        Ok(Some(ForkPlan::new(listeners)))
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ServerRegistry")
            .field("servers", &state.servers)
            .field("offsets", &state.offsets)
            .field("forked", &state.forked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::hooks::SignalHooks;
    use crate::net::{ConnectionTracker, GraceListener, Transport};
    use crate::server::ServerOptions;
    use tokio::net::TcpListener;

    async fn server(address: &str) -> GraceServer {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = GraceListener::new(tcp, ConnectionTracker::new(), None).unwrap();
        GraceServer::new(
            ServerOptions {
                address: address.to_string(),
                drain_timeout: None,
                is_child: false,
            },
            listener,
            Transport::Plain,
            SignalHooks::new(),
        )
    }

    #[tokio::test]
    async fn offsets_assigned_in_registration_order() {
        let registry = ServerRegistry::new();
        assert_eq!(registry.register(server(":8080").await).unwrap(), 0);
        assert_eq!(registry.register(server(":8443").await).unwrap(), 1);
        assert_eq!(registry.offset_of(":8443"), Some(1));
        assert_eq!(registry.addresses(), vec![":8080", ":8443"]);
    }

    #[tokio::test]
    async fn duplicate_address_rejected() {
        let registry = ServerRegistry::new();
        registry.register(server(":8080").await).unwrap();
        assert!(matches!(
            registry.register(server(":8080").await),
            Err(RegistryError::DuplicateAddress(_))
        ));
    }

    #[tokio::test]
    async fn offsets_never_reused() {
        let registry = ServerRegistry::new();
        registry.register(server(":8080").await).unwrap();
        registry.register(server(":8081").await).unwrap();
        registry.deregister(":8080").unwrap();

        assert_eq!(registry.register(server(":8082").await).unwrap(), 2);
        assert_eq!(registry.register(server(":8080").await).unwrap(), 0);
    }

    #[tokio::test]
    async fn fork_guard_claimed_once() {
        let registry = ServerRegistry::new();
        registry.register(server(":8080").await).unwrap();

        assert!(registry.begin_fork().unwrap().is_some());
        assert!(registry.has_forked());
        assert!(registry.begin_fork().unwrap().is_none());
    }

    #[tokio::test]
    async fn plan_follows_offsets_and_stays_dense() {
        let registry = ServerRegistry::new();
        registry.register(server(":8080").await).unwrap();
        registry.register(server(":8081").await).unwrap();
        registry.register(server(":8443").await).unwrap();
        registry.deregister(":8081").unwrap();

        let plan = registry.begin_fork().unwrap().unwrap();
        assert_eq!(plan.order(), vec![":8080", ":8443"]);
        assert_eq!(plan.len(), 2);
    }
}
