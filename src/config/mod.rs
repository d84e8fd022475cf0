//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → UpstreamConfig::normalize (slot and segment clamps)
//!     → UpstreamConfig (validated, immutable)
//!     → shared via Arc with the engine and the driver
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Tuned thresholds (slot escalation, rate sampling floor, CNAME depth)
//!   are plain fields rather than constants

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::AdditionalRequests;
pub use schema::UpstreamConfig;
