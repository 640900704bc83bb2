//! grace-server
//!
//! Serves HTTP on every configured listener and survives its own upgrade:
//! on SIGHUP it starts a replacement that inherits the listening sockets,
//! so no connection attempt is refused while the binary changes.
//!
//! # Architecture Overview
//!
//! ```text
//!     ┌───────────────────── parent (pid N) ─────────────────────┐
//!     │  Supervisor                                              │
//!     │    ├─ ServerRegistry ── GraceServer :8080 ── GraceListener│
//!     │    │                 └─ GraceServer :8443 ── GraceListener│
//!     │    └─ SignalHandler per server                           │
//!     │          SIGHUP ──▶ ForkCoordinator ──┐                  │
//!     │          SIGTERM ─▶ drain + exit      │ fds 3, 4         │
//!     └───────────────────────────────────────┼──────────────────┘
//!                                             ▼
//!     ┌──────── child (pid M): --graceful --socketorder=:8080,:8443 ┐
//!     │  Supervisor adopts fd 3 → :8080, fd 4 → :8443 and serves    │
//!     └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use grace_server::config::load_config;
use grace_server::http::{build_router, HttpHandler};
use grace_server::lifecycle::{HookPhase, LaunchSpec, Signal, Supervisor};
use grace_server::net::Inheritance;
use grace_server::observability::{logging::init_logging, metrics::init_metrics};

#[derive(Parser, Debug)]
#[command(name = "grace-server", version)]
#[command(about = "HTTP server with zero-downtime restarts", long_about = None)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "grace.toml")]
    config: PathBuf,

    /// Set by the parent process on a restart: listeners are inherited.
    #[arg(long)]
    graceful: bool,

    /// Addresses of the inherited descriptors, in descriptor order.
    #[arg(long, value_delimiter = ',')]
    socketorder: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    init_logging(&config.observability.log_level);

    tracing::info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        child = cli.graceful,
        "grace-server starting"
    );

    if let Some(metrics_address) = &config.observability.metrics_address {
        match metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let inheritance = if cli.graceful {
        Inheritance::child(cli.socketorder)
    } else {
        Inheritance::root()
    };

    let handler = HttpHandler::new(build_router(config.timeouts.request_timeout()));
    let mut supervisor = Supervisor::new(config, inheritance, LaunchSpec::current()?);

    // Idle keep-alive connections would otherwise hold the drain open.
    for signal in [Signal::Interrupt, Signal::Terminate] {
        let drain = handler.drain_token();
        supervisor.on_signal(HookPhase::Post, signal, move || drain.cancel());
    }

    supervisor.run(Arc::new(handler)).await?;
    Ok(())
}
