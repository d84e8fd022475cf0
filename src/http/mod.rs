//! HTTP/1.x wire handling for upstream connections.
//!
//! # Data Flow
//! ```text
//! queued request
//!     → request.rs (request line, Range/conditional headers, Via)
//!     → socket
//! socket
//!     → response.rs (find end of head, parse status and headers)
//!     → chunked.rs (incremental chunked decoding) or identity length
//!     → object store
//! ```
//!
//! # Design Decisions
//! - Parsing is sans-IO: every function works on borrowed byte slices
//! - `httparse` does the tokenizing, `httpdate` the date formats
//! - Cache-control bits are shared with stored object metadata

pub mod cache_control;
pub mod chunked;
pub mod request;
pub mod response;

use std::fmt;

pub use cache_control::{CacheControl, CacheFlags};
pub use chunked::{ChunkError, ChunkedDecoder};
pub use request::{write_request, RequestSpec, WriteError, MAX_REQUEST_BYTES};
pub use response::{find_header_end, parse_response_head, HeadError, ResponseHead, TransferEncoding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    /// Protocol number as written in `Via`.
    pub fn via_token(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "1.0",
            HttpVersion::Http11 => "1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpVersion::Http10 => write!(f, "HTTP/1.0"),
            HttpVersion::Http11 => write!(f, "HTTP/1.1"),
        }
    }
}

/// Methods the engine issues upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    /// GET carrying the object's validators.
    ConditionalGet,
    Post,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get | Method::ConditionalGet => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }

    /// Carries a request body and goes through the side relay.
    pub fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::ConditionalGet => write!(f, "conditional GET"),
            m => write!(f, "{}", m.as_str()),
        }
    }
}

/// Whether a `Via` chain already passed through `proxy_name`.
pub fn via_contains(via: &str, proxy_name: &str) -> bool {
    via.split(',').any(|hop| {
        let mut tokens = hop.split_whitespace();
        let _protocol = tokens.next();
        tokens.next() == Some(proxy_name)
    })
}

/// `Via` value with this proxy appended.
pub fn append_via(existing: Option<&str>, version: HttpVersion, proxy_name: &str) -> String {
    match existing {
        Some(via) if !via.trim().is_empty() => {
            format!("{}, {} {}", via.trim(), version.via_token(), proxy_name)
        }
        _ => format!("{} {}", version.via_token(), proxy_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn via_detection_matches_whole_names() {
        assert!(via_contains("1.1 cache1, 1.0 me (v1)", "me"));
        assert!(!via_contains("1.1 meme", "me"));
        assert!(!via_contains("", "me"));
    }

    #[test]
    fn via_is_appended() {
        assert_eq!(append_via(None, HttpVersion::Http11, "me"), "1.1 me");
        assert_eq!(
            append_via(Some("1.0 other"), HttpVersion::Http10, "me"),
            "1.0 other, 1.0 me"
        );
    }
}
