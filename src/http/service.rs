//! Demo HTTP application served on every listener.
//!
//! # Responsibilities
//! - Build the Axum router (identity and health endpoints)
//! - Serve HTTP/1.1 and HTTP/2 per accepted connection via hyper-util
//! - Close keep-alive connections once draining starts, after answering
//!   the request they have in flight
//!
//! # Design Decisions
//! - One router shared by all servers; per-connection facts travel as a
//!   request extension
//! - Keep-alive connections would otherwise hold a drain open until its
//!   deadline, so the handler listens for a drain token

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::Extension;
use axum::http::{HeaderMap, Request};
use axum::routing::get;
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::http::request::{request_id, MakeRequestUuid, X_REQUEST_ID};
use crate::net::{Protocol, ServerStream, TrackedConnection};
use crate::server::ConnectionHandler;

/// Facts about the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: SocketAddr,
    pub protocol: Protocol,
}

#[derive(Debug, Serialize)]
struct Identity {
    pid: u32,
    address: Option<String>,
    peer: String,
    protocol: String,
    request_id: Option<String>,
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(identity))
        .route("/healthz", get(healthz))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
}

/// Reports which process answered, so restarts are observable from outside.
async fn identity(Extension(conn): Extension<ConnectionInfo>, headers: HeaderMap) -> Json<Identity> {
    Json(Identity {
        pid: std::process::id(),
        address: conn.local_addr.map(|a| a.to_string()),
        peer: conn.peer_addr.to_string(),
        protocol: conn.protocol.to_string(),
        request_id: request_id(&headers).map(str::to_string),
    })
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serves `router` over each connection, HTTP/1.1 or HTTP/2.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    router: Router,
    draining: CancellationToken,
}

impl HttpHandler {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            draining: CancellationToken::new(),
        }
    }

    /// Cancel to finish in-flight requests and close keep-alive connections.
    ///
    /// A connection that has not sent a request yet is left open until it
    /// does, or until the drain timeout abandons it.
    pub fn drain_token(&self) -> CancellationToken {
        self.draining.clone()
    }
}

impl ConnectionHandler for HttpHandler {
    fn handle(
        &self,
        conn: TrackedConnection<ServerStream>,
    ) -> impl Future<Output = io::Result<()>> + Send {
        let router = self.router.clone();
        let draining = self.draining.clone();

        async move {
            let info = ConnectionInfo {
                local_addr: conn.get_ref().local_addr().ok(),
                peer_addr: conn.peer_addr(),
                protocol: conn.get_ref().protocol(),
            };
            // Set once hyper has read a request, which also fixes the protocol.
            let first_request = CancellationToken::new();
            let seen = first_request.clone();
            let service = router.map_request(move |mut request: Request<Incoming>| {
                seen.cancel();
                request.extensions_mut().insert(info.clone());
                request
            });

            let builder = Builder::new(TokioExecutor::new());
            let connection =
                builder.serve_connection_with_upgrades(TokioIo::new(conn), TowerToHyperService::new(service));
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = draining.cancelled() => {
                    // A request already on the wire is answered before the
                    // connection is wound down.
                    tokio::select! {
                        result = connection.as_mut() => result,
                        _ = first_request.cancelled() => {
                            connection.as_mut().graceful_shutdown();
                            connection.await
                        }
                    }
                }
            };
            result.map_err(io::Error::other)
        }
    }
}
