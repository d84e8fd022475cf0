//! Reply heads: reading, validating, and reconciling them with the
//! object being fetched.

use http::StatusCode;
use tokio::time::Instant;

use super::connection::ReadMode;
use super::finish::FinishMode;
use super::reconcile::{self, Verdict};
use super::{Action, ConnId, IoFault, ReadOutcome, RequestorEvent, Upstream};
use crate::error::UpstreamError;
use crate::http::{
    find_header_end, parse_response_head, via_contains, CacheFlags, ChunkedDecoder, Method,
    ResponseHead, TransferEncoding,
};
use crate::observability::metrics;
use crate::store::{ObjectFlags, ObjectStore, CHUNK_SIZE};

impl<S: ObjectStore> Upstream<S> {
    /// Start reading the reply to the head request of `conn`. With
    /// `immediate`, bytes already buffered are processed right away.
    pub(crate) fn reply(&mut self, conn: ConnId, immediate: bool) {
        let c = &self.conns[conn];
        let Some(&head) = c.chain.front() else { return };
        if self.requests[head].requestor.is_none() {
            tracing::warn!(
                conn = %conn,
                origin = %self.origins[c.origin].key,
                "Aborting pipeline"
            );
            self.finish(conn, FinishMode::Close, 0);
            return;
        }
        tracing::trace!(
            conn = %conn,
            request = %head,
            object = %self.store.key(self.requests[head].object),
            "Awaiting reply"
        );

        let c = &mut self.conns[conn];
        if c.len == 0 {
            c.buf = None;
        }
        c.read = ReadMode::Headers;
        if immediate && c.len > 0 {
            self.on_received(conn, ReadOutcome::Data(0));
        } else {
            self.await_read(conn);
        }
    }

    /// Arm the read timeout and ask the substrate for bytes.
    pub(crate) fn await_read(&mut self, conn: ConnId) {
        self.set_timeout(conn, self.config.timeouts.read());
        self.push(Action::Receive { conn });
    }

    /// A read completed while waiting for a reply head.
    pub(crate) fn header_read(&mut self, conn: ConnId, outcome: ReadOutcome) {
        let eof = match outcome {
            ReadOutcome::Error(fault) => {
                self.header_read_failed(conn, fault);
                return;
            }
            ReadOutcome::Data(n) => {
                self.conns[conn].len += n;
                false
            }
            ReadOutcome::Eof => true,
        };

        let c = &self.conns[conn];
        let buf = &c.buf.as_deref().unwrap_or_default()[..c.len];
        if find_header_end(buf).is_some() {
            if let Some(&head) = c.chain.front() {
                self.requests[head].headers_at = Some(Instant::now());
            }
            self.handle_headers(conn, eof);
            return;
        }
        if c.len >= CHUNK_SIZE {
            tracing::error!(conn = %conn, "Couldn't find end of server's headers");
            self.abort_connection(
                conn,
                true,
                UpstreamError::protocol("Couldn't find end of server's headers"),
            );
            return;
        }
        if eof {
            if c.serviced >= 1 {
                self.restart(conn);
            } else {
                self.abort_connection(
                    conn,
                    true,
                    UpstreamError::transport(StatusCode::BAD_GATEWAY, "Server dropped connection"),
                );
            }
            return;
        }
        self.await_read(conn);
    }

    fn header_read_failed(&mut self, conn: ConnId, fault: IoFault) {
        let reset = fault == IoFault::ClientReset;
        if self.conns[conn].serviced >= 1 && !fault.is_local() {
            self.restart(conn);
            return;
        }
        if !reset {
            tracing::error!(conn = %conn, error = %fault, "Read from server failed");
        }
        self.abort_connection(
            conn,
            !reset,
            UpstreamError::transport(
                StatusCode::BAD_GATEWAY,
                format!("Read from server failed: {}", fault),
            ),
        );
    }

    fn handle_headers(&mut self, conn: ConnId, eof: bool) {
        let Some(&request) = self.conns[conn].chain.front() else { return };
        let origin = self.conns[conn].origin;
        self.cancel_timeout(conn);
        self.requests[request].wait_continue = false;

        let parsed = {
            let c = &self.conns[conn];
            parse_response_head(&c.buf.as_deref().unwrap_or_default()[..c.len])
        };
        let mut head = match parsed {
            Ok(head) => head,
            Err(e) => {
                tracing::error!(conn = %conn, origin = %self.origins[origin].key, "{}", e);
                self.abort_connection(conn, true, e.into());
                return;
            }
        };
        tracing::debug!(
            conn = %conn,
            request = %request,
            status = head.code,
            version = %head.version,
            "Server status"
        );

        self.conns[conn].version = Some(head.version);
        self.origins[origin].version = Some(head.version);
        let req = &mut self.requests[request];
        req.persistent = req.persistent && head.persistent;

        if head.code == 100 {
            let object = req.object;
            self.store.notify(object);
            let continued = self.conns[conn]
                .side
                .as_mut()
                .map_or(false, |s| std::mem::replace(&mut s.awaiting_continue, false));
            if continued {
                self.do_side(conn);
            }
            self.finish(conn, FinishMode::KeepCurrent, head.header_len);
            return;
        }
        if self.conns[conn].side.map_or(false, |s| s.awaiting_continue) {
            // Final reply while the body was withheld; the origin's view
            // of the stream is unknown.
            self.requests[request].persistent = false;
        }

        if let Err(err) = self.validate_head(conn, request, &head) {
            tracing::error!(conn = %conn, origin = %self.origins[origin].key, status = head.code, "{}", err);
            self.abort_connection(conn, true, err);
            return;
        }
        let full_len = match head.code {
            206 | 304 | 412 => head.content_range.full_length,
            _ => head.content_length,
        };

        if self.requests[request].authorized {
            head.cache_control.flags |= CacheFlags::AUTHORIZATION;
        }
        let old = self.requests[request].object;
        let shared = self.config.proxy.cache_is_shared;
        if reconcile::is_uncacheable(self.store.meta(old), &head, shared) {
            tracing::info!(object = %self.store.key(old), flags = ?head.cache_control.flags, "Uncacheable object");
        }
        let age = {
            let dispatched = self.dispatch_wall_time(request);
            let secs = std::time::Duration::from_secs(head.age.unwrap_or(0));
            dispatched.checked_sub(secs).unwrap_or(dispatched)
        };
        let method = self.requests[request].method;
        let chunked = head.transfer_encoding == TransferEncoding::Chunked;
        let expect_body = reconcile::expects_body(method, &head, chunked);
        {
            let c = &mut self.conns[conn];
            c.chunked = chunked;
            c.decoder = ChunkedDecoder::new();
        }

        self.origins[origin].lies -= 1;
        let judgement = reconcile::judge(
            self.store.meta(old),
            self.store.flags(old),
            &head,
            full_len,
            method,
        );
        if judgement.lied {
            tracing::warn!(origin = %self.origins[origin].key, "Server ignored conditional request");
            self.origins[origin].lies += 10;
        }

        let supersede = match judgement.verdict {
            Verdict::RangeNotSatisfiable => {
                tracing::error!(object = %self.store.key(old), "Unexpected \"range not satisfiable\" reply");
                let message = "Unexpected \"range not satisfiable\" reply";
                self.abort_connection(conn, true, UpstreamError::protocol(message));
                self.store.abort(old, StatusCode::BAD_GATEWAY.as_u16(), message);
                return;
            }
            Verdict::Supersede { dynamic } => {
                if dynamic {
                    tracing::error!(object = %self.store.key(old), status = head.code, "Inconsistent reply to conditional request");
                    self.store.set_flags(old, ObjectFlags::DYNAMIC);
                }
                true
            }
            Verdict::Accept => false,
        };

        let new = if supersede {
            let key = self.store.key(old).to_string();
            let meta = self.store.meta(old);
            tracing::info!(
                object = %key,
                old_length = ?meta.length,
                old_etag = ?meta.etag,
                status = head.code,
                new_length = ?full_len,
                new_etag = ?head.etag,
                "Superseding object"
            );
            self.store.privatise(old);
            match self.store.make_object(&key) {
                Ok(new) => new,
                Err(e) => {
                    tracing::error!(object = %key, error = %e, "Couldn't allocate object");
                    self.abort_connection(conn, true, UpstreamError::consistency("Couldn't allocate object"));
                    return;
                }
            }
        } else {
            old
        };

        let dynamic = reconcile::suspect_dynamic(self.store.meta(old), &head, supersede, shared);
        if dynamic || (supersede && self.store.flags(old).contains(ObjectFlags::DYNAMIC)) {
            self.store.set_flags(new, ObjectFlags::DYNAMIC);
        } else if !supersede {
            self.store.clear_flags(new, ObjectFlags::DYNAMIC);
        }
        self.store.clear_flags(new, ObjectFlags::FAILED);

        let initial = self.store.flags(new).contains(ObjectFlags::INITIAL);
        let linear = reconcile::merge_metadata(
            self.store.meta_mut(new),
            &head,
            initial,
            age,
            &self.config.proxy.proxy_name,
        );
        if linear {
            self.store.set_flags(new, ObjectFlags::LINEAR);
        }
        if initial {
            self.store
                .set_partial(new, full_len, Some(std::mem::take(&mut head.headers)));
        } else if self.store.meta(new).length.is_none() {
            self.store.meta_mut(new).length = full_len;
        }

        if supersede {
            self.store.supersede(old);
            metrics::superseded();
        }

        if new != old {
            if self.store.flags(new).contains(ObjectFlags::INPROGRESS) {
                tracing::debug!(object = %self.store.key(new), "Superseding object already in progress");
                self.store.release(new);
                self.finish(conn, FinishMode::Close, 0);
                return;
            }
            self.store.clear_flags(old, ObjectFlags::VALIDATING);
            self.store
                .set_flags(new, ObjectFlags::INPROGRESS | ObjectFlags::MUTATING);
            let moved = self.store.rebind(old, new);
            if let Some(requestor) = self.requests[request].requestor {
                self.notify_requestor(requestor, RequestorEvent::Rebound { object: new });
            }
            tracing::debug!(old = %old, new = %new, readers = moved, "Rebound readers");
            self.store.clear_flags(new, ObjectFlags::MUTATING);
            self.store.clear_flags(old, ObjectFlags::INPROGRESS);
            self.requests[request].object = new;
            self.store.release(old);
            self.store.notify(old);
        } else {
            self.store.metadata_changed(new);
        }

        let object = new;
        if self.store.flags(object).contains(ObjectFlags::VALIDATING) {
            self.store.clear_flags(object, ObjectFlags::VALIDATING);
            self.store.notify(object);
        }

        if !expect_body {
            self.finish(conn, FinishMode::Keep, head.header_len);
            return;
        }
        if self.requests[request].requestor.is_none() || head.code == 412 {
            self.finish(conn, FinishMode::Close, 0);
            return;
        }

        let req = &mut self.requests[request];
        if req.persistent && method != Method::Head && !chunked && head.content_length.is_none() {
            tracing::warn!(conn = %conn, "Persistent reply with no Content-Length");
            req.persistent = false;
        }
        if let Some(to) = head.content_range.to {
            req.to = Some(to);
        }
        self.conns[conn].offset = head.content_range.from.unwrap_or(0);
        tracing::trace!(conn = %conn, object = %object, offset = self.conns[conn].offset, "Body starts");

        if self.conns[conn].len > head.header_len {
            match self.add_buffered_data(conn, head.header_len) {
                Err(err) => {
                    tracing::error!(conn = %conn, "{}", err);
                    self.abort_connection(conn, true, err);
                    return;
                }
                Ok(true) => {
                    if head.code != 206 && !self.settle_length(object) {
                        self.abort_connection(
                            conn,
                            true,
                            UpstreamError::consistency("Inconsistent object size"),
                        );
                        return;
                    }
                    self.finish(conn, FinishMode::Keep, 0);
                    return;
                }
                Ok(false) => {}
            }
        } else {
            self.conns[conn].len = 0;
        }

        if eof {
            let short = self
                .store
                .meta(object)
                .length
                .map_or(false, |l| self.conns[conn].offset < l);
            if chunked || short {
                tracing::error!(conn = %conn, "Server closed connection");
                self.abort_connection(
                    conn,
                    true,
                    UpstreamError::transport(StatusCode::BAD_GATEWAY, "Server closed connection"),
                );
                return;
            }
            if head.code != 206 && self.store.meta(object).length.is_none() {
                let size = self.store.size(object);
                self.store.meta_mut(object).length = Some(size);
                self.store.metadata_changed(object);
            }
            self.finish(conn, FinishMode::Close, 0);
            return;
        }
        self.read_data(conn);
    }

    /// Checks that make a reply unusable whatever the object holds.
    fn validate_head(
        &self,
        conn: ConnId,
        request: super::RequestId,
        head: &ResponseHead,
    ) -> Result<(), UpstreamError> {
        if head.code == 101 {
            return Err(UpstreamError::protocol_with(
                StatusCode::NOT_IMPLEMENTED,
                "Upgrade not implemented",
            ));
        }
        if let Some(via) = head.via.as_deref() {
            if via_contains(via, &self.config.proxy.proxy_name) {
                return Err(UpstreamError::protocol_with(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Proxy loop detected",
                ));
            }
        }
        let range = head.content_range;
        if head.code == 206 {
            let (Some(from), Some(to)) = (range.from, range.to) else {
                return Err(UpstreamError::protocol("Partial content without range"));
            };
            if head.content_length.map_or(false, |len| len != to - from) {
                return Err(UpstreamError::protocol("Inconsistent partial content"));
            }
        } else if head.code < 400 && range.is_present() {
            return Err(UpstreamError::protocol("Range without partial content"));
        }
        if let TransferEncoding::Unsupported(te) = &head.transfer_encoding {
            tracing::debug!(conn = %conn, encoding = %te, "Unsupported transfer-encoding");
            return Err(UpstreamError::protocol("Unsupported transfer-encoding"));
        }
        let method = self.requests[request].method;
        match head.code {
            304 if method != Method::ConditionalGet => Err(UpstreamError::protocol(
                "Unexpected \"not changed\" reply from server",
            )),
            412 if method != Method::ConditionalGet => Err(UpstreamError::protocol(
                "Unexpected \"precondition failed\" reply from server",
            )),
            304 => {
                let object = self.requests[request].object;
                if self.store.meta(object).etag.is_some() && head.etag.is_none() {
                    tracing::warn!(object = %self.store.key(object), "\"Not changed\" reply with no ETag");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// A reply ran to completion: record the length if it was unknown.
    /// Returns false when a known length disagrees with what arrived.
    pub(crate) fn settle_length(&mut self, object: crate::store::ObjectId) -> bool {
        let size = self.store.size(object);
        match self.store.meta(object).length {
            None => {
                self.store.meta_mut(object).length = Some(size);
                self.store.metadata_changed(object);
                true
            }
            Some(length) if length == size => true,
            Some(_) => {
                self.store.meta_mut(object).length = None;
                false
            }
        }
    }
}
