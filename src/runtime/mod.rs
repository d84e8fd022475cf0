//! Tokio substrate for the upstream engine.
//!
//! # Data Flow
//! ```text
//! FetchHandle ──Command──▶ Driver ──enqueue_fetch──▶ Upstream
//!                            ▲                          │
//!                            │ Event                    │ Action
//!                            │                          ▼
//!                   resolve / connect / readiness / timer tasks
//! ```
//!
//! # Design Decisions
//! - One actor owns the engine and every socket; spawned tasks only wait
//!   (DNS, connect, readiness, timers) and report back over a channel
//! - Reads and writes happen on the actor with `try_read_vectored` and
//!   `try_write`, straight into the memory the engine hands out
//! - Fetches land in an in-memory object store

pub mod driver;
mod resolver;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::error::UpstreamError;
use crate::http::Method;
use crate::upstream::OriginSummary;

pub use driver::Driver;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver stopped")]
    Stopped,
    #[error("{status} {message}")]
    Upstream { status: StatusCode, message: String },
    #[error(transparent)]
    Rejected(#[from] UpstreamError),
}

impl DriverError {
    /// Status a client of the proxy would see.
    pub fn status(&self) -> StatusCode {
        match self {
            DriverError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            DriverError::Upstream { status, .. } => *status,
            DriverError::Rejected(e) => e.status(),
        }
    }
}

/// What a completed fetch left in the store.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub url: String,
    pub status: u16,
    pub message: String,
    pub length: Option<u64>,
    pub etag: Option<String>,
    pub body: Bytes,
}

pub(crate) enum Command {
    Fetch {
        url: String,
        method: Method,
        body: Option<Bytes>,
        reply: oneshot::Sender<Result<FetchReport, DriverError>>,
    },
    Listing {
        reply: oneshot::Sender<Vec<OriginSummary>>,
    },
}

/// Cloneable handle onto a running `Driver`.
#[derive(Clone)]
pub struct FetchHandle {
    tx: mpsc::Sender<Command>,
}

impl FetchHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Fetch `url` into the store.
    pub async fn fetch(&self, url: &str, method: Method) -> Result<FetchReport, DriverError> {
        self.request(url, method, None).await
    }

    /// POST or PUT `body` to `url`.
    pub async fn fetch_with_body(
        &self,
        url: &str,
        method: Method,
        body: Bytes,
    ) -> Result<FetchReport, DriverError> {
        self.request(url, method, Some(body)).await
    }

    async fn request(
        &self,
        url: &str,
        method: Method,
        body: Option<Bytes>,
    ) -> Result<FetchReport, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Fetch {
                url: url.to_string(),
                method,
                body,
                reply,
            })
            .await
            .map_err(|_| DriverError::Stopped)?;
        rx.await.map_err(|_| DriverError::Stopped)?
    }

    /// Snapshot of the known origins.
    pub async fn listing(&self) -> Result<Vec<OriginSummary>, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Listing { reply })
            .await
            .map_err(|_| DriverError::Stopped)?;
        rx.await.map_err(|_| DriverError::Stopped)
    }
}
