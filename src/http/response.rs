//! Reply head parsing.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use super::cache_control::{CacheControl, CacheFlags};
use super::HttpVersion;

/// Header lines accepted in one reply.
pub const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeadError {
    #[error("Incomplete server headers")]
    Incomplete,
    #[error("Unknown server HTTP version")]
    UnknownVersion,
    #[error("Couldn't parse server status line")]
    StatusLine,
    #[error("Couldn't parse server headers")]
    Headers,
    #[error("Too many server headers")]
    TooManyHeaders,
    #[error("Conflicting Content-Length headers")]
    ContentLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEncoding {
    Identity,
    Chunked,
    Unsupported(String),
}

/// `Content-Range` with an exclusive `to`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub full_length: Option<u64>,
}

impl ContentRange {
    pub fn is_present(&self) -> bool {
        self.from.is_some() || self.to.is_some() || self.full_length.is_some()
    }

    /// `bytes 0-499/1234`, `bytes 0-499/*` or `bytes */1234`.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, full) = rest.split_once('/')?;
        let full_length = match full.trim() {
            "*" => None,
            n => Some(n.parse().ok()?),
        };
        let (from, to) = match range.trim() {
            "*" => (None, None),
            r => {
                let (a, b) = r.split_once('-')?;
                let a: u64 = a.trim().parse().ok()?;
                let b: u64 = b.trim().parse().ok()?;
                if b < a {
                    return None;
                }
                (Some(a), Some(b + 1))
            }
        };
        Some(Self {
            from,
            to,
            full_length,
        })
    }
}

/// Everything the engine needs from a reply head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub code: u16,
    pub reason: String,
    /// Bytes up to and including the blank line.
    pub header_len: usize,
    pub content_length: Option<u64>,
    pub transfer_encoding: TransferEncoding,
    pub content_range: ContentRange,
    pub cache_control: CacheControl,
    pub date: Option<SystemTime>,
    pub last_modified: Option<SystemTime>,
    pub expires: Option<SystemTime>,
    /// `Age` in seconds.
    pub age: Option<u64>,
    /// Strong entity tag without quotes.
    pub etag: Option<String>,
    pub via: Option<String>,
    /// The connection may be reused after this reply.
    pub persistent: bool,
    /// End-to-end headers kept with the object.
    pub headers: String,
}

/// Offset just past the blank line ending the head, if buffered.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf.get(i + 1) == Some(&b'\n') {
                return Some(i + 2);
            }
            if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

/// Strong tags only; weak validators cannot be used for ranges.
fn parse_etag(value: &str) -> Option<String> {
    let value = value.trim();
    if value.starts_with("W/") {
        return None;
    }
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.to_string())
}

fn parse_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "proxy-authenticate"
    )
}

/// Headers turned into structured fields and regenerated on the way out.
fn is_structured(name: &str) -> bool {
    matches!(
        name,
        "content-length"
            | "content-range"
            | "date"
            | "last-modified"
            | "expires"
            | "age"
            | "etag"
            | "via"
    )
}

pub fn parse_response_head(buf: &[u8]) -> Result<ResponseHead, HeadError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut raw);
    let header_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Err(HeadError::Incomplete),
        Err(httparse::Error::Version) => return Err(HeadError::UnknownVersion),
        Err(httparse::Error::Status) | Err(httparse::Error::Token) => {
            return Err(HeadError::StatusLine)
        }
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooManyHeaders),
        Err(_) => return Err(HeadError::Headers),
    };
    let version = match response.version {
        Some(0) => HttpVersion::Http10,
        Some(1) => HttpVersion::Http11,
        _ => return Err(HeadError::UnknownVersion),
    };
    let code = response.code.ok_or(HeadError::StatusLine)?;

    let mut head = ResponseHead {
        version,
        code,
        reason: response.reason.unwrap_or("").to_string(),
        header_len,
        content_length: None,
        transfer_encoding: TransferEncoding::Identity,
        content_range: ContentRange::default(),
        cache_control: CacheControl::default(),
        date: None,
        last_modified: None,
        expires: None,
        age: None,
        etag: None,
        via: None,
        persistent: version == HttpVersion::Http11,
        headers: String::new(),
    };

    let mut saw_cache_control = false;
    let mut pragma_no_cache = false;
    let mut connection_tokens: Vec<String> = Vec::new();

    for header in response.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(header.value);
        let value = value.trim();
        match name.as_str() {
            "content-length" => {
                let n: u64 = value.parse().map_err(|_| HeadError::ContentLength)?;
                if head.content_length.map_or(false, |old| old != n) {
                    return Err(HeadError::ContentLength);
                }
                head.content_length = Some(n);
            }
            "transfer-encoding" => {
                let tokens: Vec<&str> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect();
                head.transfer_encoding = match tokens.as_slice() {
                    [] => TransferEncoding::Identity,
                    [t] if t.eq_ignore_ascii_case("identity") => TransferEncoding::Identity,
                    [t] if t.eq_ignore_ascii_case("chunked") => TransferEncoding::Chunked,
                    _ => TransferEncoding::Unsupported(value.to_string()),
                };
            }
            "content-range" => {
                // An unparseable range is as bad as a missing one.
                head.content_range = ContentRange::parse(value).unwrap_or_default();
            }
            "cache-control" => {
                saw_cache_control = true;
                head.cache_control.merge_header(value);
            }
            "pragma" => {
                if value.eq_ignore_ascii_case("no-cache") {
                    pragma_no_cache = true;
                }
            }
            "date" => head.date = parse_date(value),
            "last-modified" => head.last_modified = parse_date(value),
            // Invalid dates mean "already expired".
            "expires" => head.expires = Some(parse_date(value).unwrap_or(UNIX_EPOCH)),
            "age" => head.age = value.parse().ok(),
            "etag" => head.etag = parse_etag(value),
            "via" => {
                head.via = Some(match head.via.take() {
                    Some(prev) => format!("{}, {}", prev, value),
                    None => value.to_string(),
                });
            }
            "connection" => {
                for token in value.split(',') {
                    connection_tokens.push(token.trim().to_ascii_lowercase());
                }
            }
            "vary" => head.cache_control.flags.insert(CacheFlags::VARY),
            "set-cookie" | "set-cookie2" => head.cache_control.flags.insert(CacheFlags::COOKIE),
            _ => {}
        }
    }

    if pragma_no_cache && !saw_cache_control {
        head.cache_control.flags.insert(CacheFlags::NO);
    }

    for token in &connection_tokens {
        match token.as_str() {
            "close" => head.persistent = false,
            "keep-alive" if version == HttpVersion::Http10 => head.persistent = true,
            _ => {}
        }
    }

    for header in response.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        if is_hop_by_hop(&name)
            || is_structured(&name)
            || connection_tokens.iter().any(|t| *t == name)
        {
            continue;
        }
        head.headers.push_str(header.name);
        head.headers.push_str(": ");
        head.headers.push_str(String::from_utf8_lossy(header.value).trim());
        head.headers.push_str("\r\n");
    }

    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn finds_end_of_headers() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(19));
        assert_eq!(find_header_end(b"HTTP/1.0 200 OK\n\nbody"), Some(17));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\nA: b\r\n"), None);
    }

    #[test]
    fn parses_a_typical_reply() {
        let raw = b"HTTP/1.1 200 OK\r\n\
            Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
            Last-Modified: Sat, 05 Nov 1994 08:49:37 GMT\r\n\
            ETag: \"abc\"\r\n\
            Content-Length: 10\r\n\
            Cache-Control: max-age=60\r\n\
            Content-Type: text/plain\r\n\
            Age: 5\r\n\
            \r\n0123456789";
        let head = parse_response_head(raw).unwrap();
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.code, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.header_len, raw.len() - 10);
        assert_eq!(head.content_length, Some(10));
        assert_eq!(head.etag.as_deref(), Some("abc"));
        assert_eq!(head.age, Some(5));
        assert_eq!(head.cache_control.max_age, Some(60));
        assert_eq!(
            head.date,
            Some(UNIX_EPOCH + Duration::from_secs(784_111_777))
        );
        assert!(head.persistent);
        assert_eq!(
            head.headers,
            "Cache-Control: max-age=60\r\nContent-Type: text/plain\r\n"
        );
    }

    #[test]
    fn http10_needs_keep_alive_to_persist() {
        let head = parse_response_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert!(!head.persistent);
        let head =
            parse_response_head(b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(head.persistent);
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!head.persistent);
    }

    #[test]
    fn rejects_unknown_versions_and_garbage() {
        assert_eq!(
            parse_response_head(b"HTTP/2.0 200 OK\r\n\r\n"),
            Err(HeadError::UnknownVersion)
        );
        assert!(parse_response_head(b"HTTP/1.1 abc OK\r\n\r\n").is_err());
        assert_eq!(
            parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"),
            Err(HeadError::ContentLength)
        );
    }

    #[test]
    fn transfer_encodings() {
        let head =
            parse_response_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(head.transfer_encoding, TransferEncoding::Chunked);
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n")
            .unwrap();
        assert!(matches!(
            head.transfer_encoding,
            TransferEncoding::Unsupported(_)
        ));
    }

    #[test]
    fn content_ranges() {
        assert_eq!(
            ContentRange::parse("bytes 0-499/1234"),
            Some(ContentRange {
                from: Some(0),
                to: Some(500),
                full_length: Some(1234)
            })
        );
        assert_eq!(
            ContentRange::parse("bytes */1234"),
            Some(ContentRange {
                from: None,
                to: None,
                full_length: Some(1234)
            })
        );
        assert_eq!(ContentRange::parse("bytes 9-3/10"), None);
        assert_eq!(ContentRange::parse("items 0-1/2"), None);
    }

    #[test]
    fn validators_and_flags() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nETag: W/\"weak\"\r\nExpires: 0\r\nVary: Accept\r\nPragma: no-cache\r\nVia: 1.1 a\r\nVia: 1.0 b\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.etag, None);
        assert_eq!(head.expires, Some(UNIX_EPOCH));
        assert!(head.cache_control.flags.contains(CacheFlags::VARY));
        assert!(head.cache_control.flags.contains(CacheFlags::NO));
        assert_eq!(head.via.as_deref(), Some("1.1 a, 1.0 b"));
    }
}
