//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::fork::HandoffMode;
use crate::lifecycle::shutdown::{self, DEFAULT_DRAIN_TIMEOUT_MS};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GraceConfig {
    /// Listening servers, in registration order.
    pub servers: Vec<ServerConfig>,

    /// Drain, keepalive and readiness timeouts.
    pub timeouts: TimeoutConfig,

    /// Restart behaviour.
    pub restart: RestartConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// One listening server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address (e.g., ":8080" or "127.0.0.1:8443").
    pub address: String,

    /// Serve TLS on this listener.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a drain may take, in milliseconds. Negative waits forever.
    pub drain_timeout_ms: i64,

    /// TCP keepalive period for accepted connections. 0 leaves it untouched.
    pub keepalive_secs: u64,

    /// How long an immediate handoff waits for the child to report ready.
    pub readiness_timeout_secs: u64,

    /// Per-request timeout of the demo HTTP handler.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            keepalive_secs: 180,
            readiness_timeout_secs: 10,
            request_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn drain_timeout(&self) -> Option<Duration> {
        shutdown::drain_timeout(self.drain_timeout_ms)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

/// Restart configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RestartConfig {
    /// What the parent does once its replacement is running.
    pub handoff: HandoffMode,

    /// Where the serving process records its pid.
    pub pid_file: Option<PathBuf>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Prometheus exporter bind address. No exporter when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_address: None,
        }
    }
}
