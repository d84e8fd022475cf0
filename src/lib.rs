//! Upstream fetch engine for a caching HTTP proxy.
//!
//! Fetches objects from origin servers into a cache object store over
//! persistent, pipelined HTTP/1.x connections, learning per-origin
//! behavior (persistence, pipelining, round-trip time, rate) as it goes.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod runtime;
pub mod store;
pub mod upstream;

pub use config::UpstreamConfig;
pub use error::UpstreamError;
pub use lifecycle::Shutdown;
pub use runtime::{Driver, FetchHandle, FetchReport};
pub use store::{MemoryStore, ObjectStore};
pub use upstream::Upstream;
