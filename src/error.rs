//! Failure classification for the upstream engine.
//!
//! Every abort carries a status and a short message that reach the
//! requestor unchanged.

use http::StatusCode;
use thiserror::Error;

use crate::http::chunked::ChunkError;
use crate::http::request::WriteError;
use crate::http::response::HeadError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// DNS, connect, read or write failure, reset, timeout.
    #[error("{message}")]
    Transport { status: StatusCode, message: String },

    /// The origin violated HTTP framing or semantics.
    #[error("{message}")]
    Protocol { status: StatusCode, message: String },

    /// Stored metadata and the reply disagree in a way that cannot be
    /// repaired by superseding the object.
    #[error("{message}")]
    Consistency { message: String },

    /// A connection budget or allocation limit was hit.
    #[error("{message}")]
    Resource { message: String },

    /// Refused before anything was queued.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
}

impl UpstreamError {
    pub fn transport(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// Protocol violation surfaced as 502.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    pub fn protocol_with(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            message: message.into(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    pub fn rejected(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Status reported to the requestor.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Transport { status, .. }
            | Self::Protocol { status, .. }
            | Self::Rejected { status, .. } => *status,
            Self::Consistency { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Resource { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message, .. }
            | Self::Protocol { message, .. }
            | Self::Consistency { message }
            | Self::Resource { message }
            | Self::Rejected { message, .. } => message,
        }
    }

    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Protocol { .. } => "protocol",
            Self::Consistency { .. } => "consistency",
            Self::Resource { .. } => "resource",
            Self::Rejected { .. } => "rejected",
        }
    }
}

impl From<ChunkError> for UpstreamError {
    fn from(e: ChunkError) -> Self {
        Self::protocol(format!("Couldn't parse chunk size: {}", e))
    }
}

impl From<HeadError> for UpstreamError {
    fn from(e: HeadError) -> Self {
        Self::protocol(e.to_string())
    }
}

/// A request that cannot be written. A proxy loop is the origin side's
/// fault; everything else is ours.
impl From<WriteError> for UpstreamError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::ProxyLoop => Self::protocol(e.to_string()),
            _ => Self::transport(StatusCode::SERVICE_UNAVAILABLE, "Couldn't write request"),
        }
    }
}

impl From<StoreError> for UpstreamError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Exhausted => Self::resource(e.to_string()),
            _ => Self::consistency(format!("Couldn't add data to object: {}", e)),
        }
    }
}
