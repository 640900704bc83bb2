//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GraceConfig (validated, immutable)
//!     → handed to the Supervisor
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a restart re-reads it in the child
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{GraceConfig, ServerConfig, TlsConfig};
pub use validation::ValidationError;
