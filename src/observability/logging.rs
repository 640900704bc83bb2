//! Structured logging.
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` overrides the configured level when set
//! - Every process logs its pid so parent and child output can be told apart
//!   on the shared stdout/stderr

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `level` is either a bare level (`"info"`) or a full filter directive.
/// Calling this twice is harmless; the second call is ignored.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn default_directive(level: &str) -> String {
    if level.contains('=') {
        level.to_string()
    } else {
        format!("grace_server={level},tower_http={level}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_scoped_to_crate() {
        assert_eq!(
            default_directive("debug"),
            "grace_server=debug,tower_http=debug"
        );
    }

    #[test]
    fn directive_passed_through() {
        assert_eq!(default_directive("grace_server=trace"), "grace_server=trace");
    }
}
