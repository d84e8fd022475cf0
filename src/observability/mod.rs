//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! upstream engine and driver produce:
//!     → logging.rs (structured log events through `tracing`)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//!
//! Consumers:
//!     → stdout, plain or JSON
//!     → Prometheus scrape endpoint, when enabled
//! ```
//!
//! # Design Decisions
//! - The engine only calls the `metrics` facade; without an installed
//!   recorder every update is a no-op
//! - Log level comes from `RUST_LOG` first, then the config file

pub mod logging;
pub mod metrics;
