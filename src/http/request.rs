//! Request serialization.
//!
//! The caller decides the method, range and validators; this module only
//! formats them and enforces the size limit of the outgoing buffer.

use std::fmt::Write as _;
use std::time::SystemTime;

use bytes::BytesMut;
use thiserror::Error;
use url::{Position, Url};

use super::cache_control::CacheControl;
use super::{append_via, via_contains, HttpVersion, Method};

/// Largest request head, and largest pipelined batch, we write.
pub const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("Couldn't parse URL")]
    BadUrl,
    #[error("Request too large")]
    TooLarge,
    #[error("Proxy loop detected")]
    ProxyLoop,
    #[error("Requesting empty segment")]
    EmptyRange,
}

/// One request as it should appear on the wire.
#[derive(Debug, Clone)]
pub struct RequestSpec<'a> {
    pub method: Method,
    pub url: &'a Url,
    /// Absolute-form request target, for parent proxies.
    pub absolute_form: bool,
    pub from: u64,
    /// Exclusive end of the wanted range.
    pub to: Option<u64>,
    pub if_range: Option<&'a str>,
    pub if_modified_since: Option<SystemTime>,
    pub if_none_match: Option<&'a str>,
    pub body_len: Option<u64>,
    pub expect_continue: bool,
    pub cache_control: &'a CacheControl,
    /// Forwarded client headers, one `Name: value\r\n` line each.
    pub headers: Option<&'a str>,
    /// Sent only in absolute form.
    pub proxy_authorization: Option<&'a str>,
    pub via: Option<&'a str>,
    pub proxy_name: &'a str,
    pub persistent: bool,
}

/// Append `spec` to `out`. On error `out` is left as it was.
pub fn write_request(
    spec: &RequestSpec<'_>,
    out: &mut BytesMut,
    limit: usize,
) -> Result<usize, WriteError> {
    if spec.to == Some(spec.from) {
        return Err(WriteError::EmptyRange);
    }
    if let Some(via) = spec.via {
        if via_contains(via, spec.proxy_name) {
            return Err(WriteError::ProxyLoop);
        }
    }
    let host = spec.url.host_str().ok_or(WriteError::BadUrl)?;

    let mut head = String::with_capacity(256);
    let target = if spec.absolute_form {
        &spec.url[..Position::AfterQuery]
    } else {
        match &spec.url[Position::BeforePath..Position::AfterQuery] {
            "" => "/",
            t => t,
        }
    };
    let _ = write!(head, "{} {} HTTP/1.1\r\n", spec.method.as_str(), target);
    match spec.url.port() {
        Some(port) if port != 80 => {
            let _ = write!(head, "Host: {}:{}\r\n", host, port);
        }
        _ => {
            let _ = write!(head, "Host: {}\r\n", host);
        }
    }
    if spec.absolute_form {
        if let Some(auth) = spec.proxy_authorization {
            let _ = write!(head, "Proxy-Authorization: {}\r\n", auth);
        }
    }
    if let Some(len) = spec.body_len {
        let _ = write!(head, "Content-Length: {}\r\n", len);
    }
    if spec.expect_continue {
        head.push_str("Expect: 100-continue\r\n");
    }
    if spec.method != Method::Head && (spec.from > 0 || spec.to.is_some()) {
        match spec.to {
            Some(to) => {
                let _ = write!(head, "Range: bytes={}-{}\r\n", spec.from, to - 1);
            }
            None => {
                let _ = write!(head, "Range: bytes={}-\r\n", spec.from);
            }
        }
    }
    if let Some(etag) = spec.if_range {
        let _ = write!(head, "If-Range: \"{}\"\r\n", etag);
    }
    if spec.method == Method::ConditionalGet {
        if let Some(time) = spec.if_modified_since {
            let _ = write!(
                head,
                "If-Modified-Since: {}\r\n",
                httpdate::fmt_http_date(time)
            );
        }
        if let Some(etag) = spec.if_none_match {
            let _ = write!(head, "If-None-Match: \"{}\"\r\n", etag);
        }
    }

    let start = out.len();
    out.extend_from_slice(head.as_bytes());
    spec.cache_control.write_request_header(out);
    if let Some(headers) = spec.headers {
        out.extend_from_slice(headers.as_bytes());
    }
    let via = append_via(spec.via, HttpVersion::Http11, spec.proxy_name);
    out.extend_from_slice(b"Via: ");
    out.extend_from_slice(via.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(if spec.persistent {
        b"Connection: keep-alive\r\n\r\n".as_slice()
    } else {
        b"Connection: close\r\n\r\n".as_slice()
    });

    if out.len() > limit {
        out.truncate(start);
        return Err(WriteError::TooLarge);
    }
    Ok(out.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(url: &'a Url, cc: &'a CacheControl) -> RequestSpec<'a> {
        RequestSpec {
            method: Method::Get,
            url,
            absolute_form: false,
            from: 0,
            to: None,
            if_range: None,
            if_modified_since: None,
            if_none_match: None,
            body_len: None,
            expect_continue: false,
            cache_control: cc,
            headers: None,
            proxy_authorization: None,
            via: None,
            proxy_name: "me",
            persistent: true,
        }
    }

    fn written(spec: &RequestSpec<'_>) -> String {
        let mut out = BytesMut::new();
        write_request(spec, &mut out, MAX_REQUEST_BYTES).unwrap();
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn plain_get_in_origin_form() {
        let url = Url::parse("http://example.com/a/b?c=d#frag").unwrap();
        let cc = CacheControl::default();
        assert_eq!(
            written(&spec(&url, &cc)),
            "GET /a/b?c=d HTTP/1.1\r\nHost: example.com\r\n\
             Via: 1.1 me\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn absolute_form_with_port_and_auth() {
        let url = Url::parse("http://example.com:8080/").unwrap();
        let cc = CacheControl::default();
        let mut s = spec(&url, &cc);
        s.absolute_form = true;
        s.proxy_authorization = Some("Basic dTpw");
        s.persistent = false;
        let text = written(&s);
        assert!(text.starts_with("GET http://example.com:8080/ HTTP/1.1\r\nHost: example.com:8080\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn ranges_and_validators() {
        let url = Url::parse("http://example.com/").unwrap();
        let cc = CacheControl::default();
        let mut s = spec(&url, &cc);
        s.method = Method::ConditionalGet;
        s.from = 100;
        s.to = Some(200);
        s.if_none_match = Some("v1");
        s.if_modified_since = Some(std::time::UNIX_EPOCH);
        let text = written(&s);
        assert!(text.contains("Range: bytes=100-199\r\n"));
        assert!(text.contains("If-None-Match: \"v1\"\r\n"));
        assert!(text.contains("If-Modified-Since: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));

        s.method = Method::Head;
        assert!(!written(&s).contains("Range:"));
    }

    #[test]
    fn body_headers() {
        let url = Url::parse("http://example.com/form").unwrap();
        let cc = CacheControl::default();
        let mut s = spec(&url, &cc);
        s.method = Method::Post;
        s.body_len = Some(12);
        s.expect_continue = true;
        let text = written(&s);
        assert!(text.starts_with("POST /form HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 12\r\nExpect: 100-continue\r\n"));
    }

    #[test]
    fn rejects_loops_oversize_and_empty_ranges() {
        let url = Url::parse("http://example.com/").unwrap();
        let cc = CacheControl::default();
        let mut out = BytesMut::from(&b"previous"[..]);

        let mut s = spec(&url, &cc);
        s.via = Some("1.1 other, 1.1 me");
        assert_eq!(
            write_request(&s, &mut out, MAX_REQUEST_BYTES),
            Err(WriteError::ProxyLoop)
        );

        let big = "X-Big: ".to_string() + &"a".repeat(MAX_REQUEST_BYTES) + "\r\n";
        let mut s = spec(&url, &cc);
        s.headers = Some(&big);
        assert_eq!(
            write_request(&s, &mut out, MAX_REQUEST_BYTES),
            Err(WriteError::TooLarge)
        );
        assert_eq!(&out[..], b"previous");

        let mut s = spec(&url, &cc);
        s.from = 10;
        s.to = Some(10);
        assert_eq!(
            write_request(&s, &mut out, MAX_REQUEST_BYTES),
            Err(WriteError::EmptyRange)
        );
    }

    #[test]
    fn incoming_via_is_extended() {
        let url = Url::parse("http://example.com/").unwrap();
        let cc = CacheControl::default();
        let mut s = spec(&url, &cc);
        s.via = Some("1.0 downstream");
        assert!(written(&s).contains("Via: 1.0 downstream, 1.1 me\r\n"));
    }
}
