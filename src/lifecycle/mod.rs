//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Ctrl-C, or the CLI running out of work
//!     → Shutdown::trigger
//!     → driver loop exits, outstanding fetches fail with `Stopped`
//!     → sockets dropped
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
