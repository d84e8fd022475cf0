//! Server-side requests: admission, pairing with requestors, abort and
//! release.
//!
//! # Responsibilities
//! - Admit a fetch, or answer it at once (rejected, already satisfied)
//! - Keep each requestor paired with at most one live request
//! - Abort requests on error or client reset
//!
//! A request whose requestor has gone stays where it is until the
//! scheduler sweeps its origin queue, or until its reply has been read.

use bytes::BytesMut;
use http::StatusCode;
use tokio::time::Instant;
use url::Url;

use super::{ConnId, OriginId, OriginKey, RequestId, RequestorEvent, RequestorId, Upstream};
use crate::error::UpstreamError;
use crate::http::{CacheControl, HttpVersion, Method};
use crate::observability::metrics;
use crate::store::{ObjectFlags, ObjectId, ObjectStore, CHUNK_SIZE};

/// Longest host name accepted.
const MAX_HOST_LEN: usize = 131;

/// A fetch as submitted by a requestor.
#[derive(Debug, Clone)]
pub struct Fetch {
    pub object: ObjectId,
    pub method: Method,
    pub from: u64,
    /// Exclusive end.
    pub to: Option<u64>,
    pub requestor: RequestorId,
    /// The requestor itself asked for a byte range.
    pub client_wants_range: bool,
    pub cache_control: CacheControl,
    /// Client headers to forward, one `Name: value\r\n` line each.
    pub headers: Option<String>,
    pub via: Option<String>,
    /// The client sent `Expect: 100-continue`.
    pub expect_continue: bool,
    /// Body length for POST/PUT.
    pub body_len: Option<u64>,
    /// The client request carried `Authorization`.
    pub authorized: bool,
}

impl Fetch {
    pub fn new(object: ObjectId, method: Method, requestor: RequestorId) -> Self {
        Self {
            object,
            method,
            from: 0,
            to: None,
            requestor,
            client_wants_range: false,
            cache_control: CacheControl::default(),
            headers: None,
            via: None,
            expect_continue: false,
            body_len: None,
            authorized: false,
        }
    }

    pub fn range(mut self, from: u64, to: Option<u64>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn body(mut self, len: u64) -> Self {
        self.body_len = Some(len);
        self
    }

    pub fn expect_continue(mut self, expect: bool) -> Self {
        self.expect_continue = expect;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Queued(RequestId),
    /// Nothing to do: the object is already being fetched, or this
    /// requestor already has its request.
    AlreadySatisfied,
    Rejected(UpstreamError),
}

/// Where a request currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    Origin(OriginId),
    Connection(ConnId),
}

/// Request body held for the side relay.
#[derive(Debug, Default)]
pub(crate) struct SideBody {
    pub(crate) len: u64,
    pub(crate) buffered: BytesMut,
    pub(crate) eof: bool,
}

/// A request to an origin on behalf of at most one requestor.
pub(crate) struct UpstreamRequest {
    pub(crate) object: ObjectId,
    pub(crate) method: Method,
    /// Byte range asked for; `to` is exclusive.
    pub(crate) from: u64,
    pub(crate) to: Option<u64>,
    pub(crate) persistent: bool,
    /// `None` once the requestor detached or was answered.
    pub(crate) requestor: Option<RequestorId>,
    pub(crate) client_wants_range: bool,
    pub(crate) cache_control: CacheControl,
    pub(crate) headers: Option<String>,
    pub(crate) via: Option<String>,
    pub(crate) authorized: bool,
    pub(crate) dispatched_at: Option<Instant>,
    pub(crate) headers_at: Option<Instant>,
    pub(crate) wait_continue: bool,
    pub(crate) location: Location,
    pub(crate) body: Option<SideBody>,
}

impl UpstreamRequest {
    pub(crate) fn is_side(&self) -> bool {
        self.body.is_some()
    }
}

impl<S: ObjectStore> Upstream<S> {
    /// Submit a fetch for `fetch.object`.
    pub fn enqueue_fetch(&mut self, fetch: Fetch) -> FetchOutcome {
        let object = fetch.object;
        if self.store.flags(object).contains(ObjectFlags::INPROGRESS) {
            return FetchOutcome::AlreadySatisfied;
        }
        if self.requested.contains(&fetch.requestor) {
            return FetchOutcome::AlreadySatisfied;
        }
        if self.config.proxy.offline {
            return FetchOutcome::Rejected(UpstreamError::rejected(
                StatusCode::SERVICE_UNAVAILABLE,
                "Proxy is offline",
            ));
        }

        let url = Url::parse(self.store.key(object)).ok().filter(|u| u.scheme() == "http");
        let host = url
            .as_ref()
            .and_then(|u| u.host_str())
            .filter(|h| !h.is_empty() && h.len() <= MAX_HOST_LEN)
            .map(str::to_string);
        let (Some(url), Some(host)) = (url, host) else {
            let err = UpstreamError::rejected(StatusCode::BAD_REQUEST, "Couldn't parse URL");
            self.reject_object(object, &err);
            return FetchOutcome::Rejected(err);
        };
        let port = url.port_or_known_default().unwrap_or(80);
        if !self.config.proxy.port_allowed(port) {
            let err = UpstreamError::rejected(StatusCode::FORBIDDEN, "Forbidden port");
            self.reject_object(object, &err);
            return FetchOutcome::Rejected(err);
        }

        self.requested.insert(fetch.requestor);
        let id = self.make_server_request(host, port, fetch);
        FetchOutcome::Queued(id)
    }

    fn reject_object(&mut self, object: ObjectId, err: &UpstreamError) {
        tracing::warn!(object = %self.store.key(object), status = %err.status(), "{}", err);
        self.store.abort(object, err.status().as_u16(), err.message());
        self.store.notify(object);
    }

    fn make_server_request(&mut self, host: String, port: u16, fetch: Fetch) -> RequestId {
        let key = match &self.config.parent.host {
            Some(parent) => OriginKey::proxy(parent.clone(), self.config.parent.port),
            None => OriginKey::direct(host, port),
        };
        let origin = self.get_origin(key);
        let object = fetch.object;

        self.store.set_flags(object, ObjectFlags::INPROGRESS);
        let mut from = fetch.from;
        if from % CHUNK_SIZE as u64 != 0 {
            let aligned = from - from % CHUNK_SIZE as u64;
            self.store.fill_from_disk(object, aligned);
            if self.store.hole_size(object, from - 1) != Some(0) {
                from = aligned;
            }
        }
        self.store.retain(object);

        let lies = self.origins[origin].lies;
        let method = if fetch.method == Method::ConditionalGet && lies > 0 {
            Method::Head
        } else {
            fetch.method
        };
        let wait_continue = self.config.side.expect_continue > 0 && fetch.expect_continue;
        let body = fetch
            .body_len
            .filter(|_| method.has_body())
            .map(|len| SideBody {
                len,
                ..Default::default()
            });

        let id = RequestId(self.next_id());
        self.requests.insert(
            id,
            UpstreamRequest {
                object,
                method,
                from,
                to: fetch.to,
                persistent: true,
                requestor: Some(fetch.requestor),
                client_wants_range: fetch.client_wants_range,
                cache_control: fetch.cache_control,
                headers: fetch.headers,
                via: fetch.via,
                authorized: fetch.authorized,
                dispatched_at: None,
                headers_at: None,
                wait_continue,
                location: Location::Origin(origin),
                body,
            },
        );
        self.paired.insert(fetch.requestor, id);
        self.origins[origin].queue.push_back(id);
        metrics::request_queued();
        tracing::debug!(
            request = %id,
            origin = %self.origins[origin].key,
            method = %method,
            from,
            "Queued server request"
        );

        let version = self.origins[origin].version;
        if wait_continue {
            if version == Some(HttpVersion::Http10) {
                self.drop_request(
                    id,
                    true,
                    &UpstreamError::rejected(StatusCode::EXPECTATION_FAILED, "Expectation failed"),
                );
            }
        } else if self.config.side.expect_continue >= 2
            && version == Some(HttpVersion::Http11)
            && method.has_body()
        {
            self.requests[id].wait_continue = true;
        }

        self.schedule(origin);
        id
    }

    /// Mark the object failed; an object never filled is aborted outright.
    pub(crate) fn fail_object(&mut self, object: ObjectId, err: &UpstreamError) {
        self.store.set_flags(object, ObjectFlags::FAILED);
        if self.store.flags(object).contains(ObjectFlags::INITIAL) {
            self.store.abort(object, err.status().as_u16(), err.message());
        }
        self.store.notify(object);
    }

    /// Abort one request. The head of a connection takes the connection
    /// down with it; anything else is detached and discarded when its
    /// origin is next scheduled, which happens here.
    pub fn abort_request(&mut self, request: RequestId, fail: bool, err: UpstreamError) {
        let Some(req) = self.requests.get(request) else { return };
        let origin = match req.location {
            Location::Connection(conn) => {
                if self.conns[conn].chain.front() == Some(&request) {
                    metrics::request_aborted(&err);
                    self.abort_connection(conn, fail, err);
                    return;
                }
                self.conns[conn].origin
            }
            Location::Origin(origin) => origin,
        };
        self.drop_request(request, fail, &err);
        self.schedule(origin);
    }

    /// Answer the requestor of a request that is not at the head of a
    /// connection and detach it. Callers already inside the scheduler
    /// rely on it to sweep the request up.
    pub(crate) fn drop_request(&mut self, request: RequestId, fail: bool, err: &UpstreamError) {
        let Some(req) = self.requests.get(request) else { return };
        metrics::request_aborted(err);
        let object = req.object;
        if let Some(requestor) = self.unpair(request) {
            self.notify_requestor(
                requestor,
                RequestorEvent::Error {
                    status: err.status(),
                    message: err.message().to_string(),
                },
            );
        }
        if fail {
            self.fail_object(object, err);
        }
    }

    /// Abort on behalf of a client that reset its connection.
    pub fn client_reset(&mut self, request: RequestId) {
        let Some(req) = self.requests.get(request) else { return };
        match req.location {
            Location::Connection(conn) if self.conns[conn].chain.front() == Some(&request) => {
                self.io_failed(conn, super::IoFault::ClientReset);
            }
            _ => self.abort_request(
                request,
                false,
                UpstreamError::transport(StatusCode::BAD_GATEWAY, "Connection reset by client"),
            ),
        }
    }

    /// Put the successors of `request` back on the origin queue and stop
    /// reusing its connection.
    pub fn unpipeline(&mut self, request: RequestId) {
        let Some(req) = self.requests.get_mut(request) else { return };
        let Location::Connection(conn) = req.location else { return };
        req.persistent = false;
        let chain = &mut self.conns[conn].chain;
        let Some(pos) = chain.iter().position(|&q| q == request) else { return };
        let successors: Vec<RequestId> = chain.drain(pos + 1..).collect();
        if successors.is_empty() {
            return;
        }
        tracing::debug!(request = %request, count = successors.len(), "Unpipelining");
        let origin = self.conns[conn].origin;
        self.requeue_front(origin, successors);
    }

    /// Break the pairing between a requestor and its request, and forget
    /// that the requestor fetched.
    pub fn detach_requestor(&mut self, requestor: RequestorId) {
        if let Some(request) = self.paired.remove(&requestor) {
            if let Some(req) = self.requests.get_mut(request) {
                req.requestor = None;
            }
        }
        self.requested.remove(&requestor);
    }

    pub(crate) fn unpair(&mut self, request: RequestId) -> Option<RequestorId> {
        let requestor = self.requests.get_mut(request)?.requestor.take()?;
        self.paired.remove(&requestor);
        Some(requestor)
    }

    /// Put `requests` at the front of the origin queue, in order.
    pub(crate) fn requeue_front(&mut self, origin: OriginId, requests: Vec<RequestId>) {
        for &q in requests.iter().rev() {
            self.requests[q].location = Location::Origin(origin);
            self.origins[origin].queue.push_front(q);
        }
    }

    /// Drop requests at the head of the queue nobody waits for.
    pub(crate) fn discard_detached(&mut self, origin: OriginId) {
        while let Some(&head) = self.origins[origin].queue.front() {
            if self.requests[head].requestor.is_some() {
                break;
            }
            self.origins[origin].queue.pop_front();
            let object = self.requests[head].object;
            tracing::debug!(request = %head, "Discarding detached request");
            self.store
                .clear_flags(object, ObjectFlags::INPROGRESS | ObjectFlags::VALIDATING);
            self.destroy_request(head);
        }
    }

    /// Final exit of every request: the object reference goes here.
    pub(crate) fn destroy_request(&mut self, request: RequestId) {
        self.unpair(request);
        if let Some(req) = self.requests.remove(request) {
            self.store.release(req.object);
            self.store.notify(req.object);
            metrics::request_destroyed();
        }
    }

    /// Time elapsed since the request was written, as wall clock.
    pub(crate) fn dispatch_wall_time(&self, request: RequestId) -> std::time::SystemTime {
        let now = std::time::SystemTime::now();
        match self.requests.get(request).and_then(|r| r.dispatched_at) {
            Some(at) => now.checked_sub(at.elapsed()).unwrap_or(now),
            None => now,
        }
    }
}
