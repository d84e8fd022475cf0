//! Pipeline scheduler: moves queued requests onto connections.
//!
//! Each trigger round picks a connection (idle, or busy but carrying a
//! small pipeline), writes as many requests as the origin's pipeline
//! state allows in one batch, and starts reading replies if the
//! connection was idle. Connections left without work are armed with an
//! idle watcher.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::time::Instant;
use url::Url;

use super::connection::{Outgoing, WriteKind};
use super::request::Location;
use super::{Action, ConnId, IoFault, OriginId, RequestId, Upstream};
use crate::config::AdditionalRequests;
use crate::error::UpstreamError;
use crate::http::{write_request, HttpVersion, Method, RequestSpec, WriteError, MAX_REQUEST_BYTES};
use crate::observability::metrics;
use crate::store::{ObjectFlags, ObjectStore, CHUNK_SIZE};

const CHUNK: u64 = CHUNK_SIZE as u64;

impl<S: ObjectStore> Upstream<S> {
    /// Run the scheduler for `origin`. An allocation failure costs the
    /// oldest queued request, after which the round is retried once.
    pub(crate) fn schedule(&mut self, origin: OriginId) {
        if !self.origins.contains(origin) {
            return;
        }
        let Err(err) = self.trigger(origin) else { return };
        tracing::warn!(origin = %self.origins[origin].key, error = %err, "Couldn't trigger server");
        if let Some(&head) = self.origins[origin].queue.front() {
            self.drop_request(
                head,
                true,
                &UpstreamError::resource("Couldn't trigger server"),
            );
        }
        if let Err(err) = self.trigger(origin) {
            tracing::error!(origin = %self.origins[origin].key, error = %err, "Couldn't trigger server, giving up");
        }
    }

    fn trigger(&mut self, origin: OriginId) -> Result<(), UpstreamError> {
        let max_train = self.config.pipeline.max_pipeline_train;
        loop {
            self.discard_detached(origin);
            let Some(&head) = self.origins[origin].queue.front() else { break };

            if self.requests[head].is_side() {
                if self.side_request(origin)? {
                    continue;
                }
                break;
            }

            let Some(conn) = self.acquire_connection(origin)? else { break };
            let o = &self.origins[origin];
            let n = o
                .pipeline
                .train_length(o.version, self.conns[conn].chain.len(), max_train);
            let idle = self.conns[conn].chain.is_empty();
            let mut written = 0;
            let mut rejected = false;

            while self.conns[conn].chain.len() < n {
                self.discard_detached(origin);
                let Some(&q) = self.origins[origin].queue.front() else { break };
                if self.requests[q].is_side() {
                    break;
                }
                if let Err(e) = self.prepare_and_write(conn, q, None) {
                    if written == 0 {
                        tracing::error!(request = %q, error = %e, "Couldn't write request");
                        self.drop_request(q, true, &UpstreamError::from(e));
                        rejected = true;
                    }
                    break;
                }
                if self.conns[conn].chain.is_empty() {
                    self.requests[q].dispatched_at = Some(Instant::now());
                }
                written += 1;
                self.origins[origin].queue.pop_front();
                self.conns[conn].chain.push_back(q);
                self.requests[q].location = Location::Connection(conn);
                metrics::request_written();
                tracing::debug!(
                    request = %q,
                    conn = %conn,
                    method = %self.requests[q].method,
                    object = %self.store.key(self.requests[q].object),
                    "Request written"
                );
            }

            let o = &mut self.origins[origin];
            if o.persistence > 0 && written >= 2 {
                o.pipeline = o.pipeline.trial_sent();
            }
            if written > 0 {
                self.send_request(conn);
            }
            if idle && !self.conns[conn].chain.is_empty() {
                self.reply(conn, false);
            }
            if written == 0 && !rejected {
                break;
            }
        }

        self.arm_idle(origin);
        Ok(())
    }

    /// Every connection left without work gets an idle watcher.
    fn arm_idle(&mut self, origin: OriginId) {
        let Some(o) = self.origins.get(origin) else { return };
        let idle: Vec<(usize, ConnId)> = o
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.conn.map(|c| (i, c)))
            .filter(|&(_, c)| self.conns[c].is_idle())
            .collect();
        for (slot, conn) in idle {
            let c = &mut self.conns[conn];
            // A connection never used right away counts as used, so the
            // side relay and the restart logic treat it as reused.
            c.serviced = c.serviced.max(1);
            if c.timeout.is_none() {
                self.set_timeout(conn, self.config.timeouts.idle());
            }
            let entry = &mut self.origins[origin].slots[slot];
            if !entry.idle_watch {
                entry.idle_watch = true;
                self.push(Action::WatchIdle { conn });
            }
        }
    }

    /// An idle connection, a busy one that can take more, or nothing
    /// (possibly after starting a new connection).
    fn acquire_connection(&mut self, origin: OriginId) -> Result<Option<ConnId>, UpstreamError> {
        let o = &self.origins[origin];
        let mut connecting = 0;
        let mut empty = 0;
        let mut found = None;
        for (i, slot) in o.slots[..o.num_slots].iter().enumerate() {
            match slot.conn {
                Some(c) if self.conns[c].is_connecting() => connecting += 1,
                Some(c) if self.conns[c].chain.is_empty() => {
                    found = Some((i, c));
                    break;
                }
                Some(_) => {}
                None => empty += 1,
            }
        }
        if let Some((slot, conn)) = found {
            self.unwatch_idle(origin, slot);
            return Ok(Some(conn));
        }

        let o = &self.origins[origin];
        if empty > 0
            && (connecting == 0
                || (o.persistence <= 0 && connecting <= 1)
                || connecting < o.queue.len())
        {
            self.open_connection(origin)?;
        }

        let o = &self.origins[origin];
        if o.version == Some(HttpVersion::Http11) && o.pipeline.is_enabled() {
            let limit = self.config.pool.server_slots.min(o.slots.len());
            let busy = (0..limit).find_map(|i| {
                let c = o.slots[i].conn?;
                (!self.conns[c].is_connecting() && self.pipeline_is_small(c)).then_some((i, c))
            });
            if let Some((slot, conn)) = busy {
                self.unwatch_idle(origin, slot);
                return Ok(Some(conn));
            }
        }
        Ok(None)
    }

    /// Whether more requests may be pipelined behind what `conn` carries.
    fn pipeline_is_small(&self, conn: ConnId) -> bool {
        let c = &self.conns[conn];
        let Some(&head) = c.chain.front() else {
            return !matches!(self.config.pipeline.pipeline_additional_requests, AdditionalRequests::Never);
        };
        let req = &self.requests[head];
        if req.is_side() {
            return false;
        }
        match self.config.pipeline.pipeline_additional_requests {
            AdditionalRequests::Never => false,
            AdditionalRequests::Always => true,
            AdditionalRequests::Maybe => {
                if c.chain.len() > 1 || !req.persistent {
                    return false;
                }
                if matches!(req.method, Method::Head | Method::ConditionalGet) {
                    return true;
                }
                match (req.to, self.origins[c.origin].rate) {
                    (Some(to), Some(rate)) if rate > 0 => {
                        to.saturating_sub(req.from)
                            < rate.saturating_mul(self.config.pipeline.small_request_secs)
                    }
                    _ => false,
                }
            }
        }
    }

    /// Serialize request `q` onto `conn`'s outgoing batch.
    ///
    /// The range actually asked for is narrowed to the object's first hole
    /// and, when segmenting, to one segment; the request itself keeps the
    /// range its requestor wants.
    pub(crate) fn prepare_and_write(
        &mut self,
        conn: ConnId,
        q: RequestId,
        body_len: Option<u64>,
    ) -> Result<usize, WriteError> {
        let origin = self.conns[conn].origin;
        let object = self.requests[q].object;
        let mut from = self.requests[q].from;
        let mut to = self.requests[q].to;
        let method = self.requests[q].method;
        let pmm = self.config.pipeline.pmm_size > 0 && self.origins[origin].pipeline.is_enabled();

        if matches!(method, Method::Get | Method::ConditionalGet) {
            if to == Some(from) {
                return Err(WriteError::EmptyRange);
            }
            if self.store.flags(object).contains(ObjectFlags::DYNAMIC) {
                from = 0;
                to = None;
            } else {
                self.store.fill_from_disk(object, from - from % CHUNK);
                if let Some(hole) = self.store.hole_size(object, from).filter(|&l| l > 0) {
                    if to.map_or(true, |t| t > from + hole) {
                        to = Some(from + hole);
                    }
                }
                if pmm {
                    let cap = if from == 0 {
                        self.config.pipeline.pmm_first_size
                    } else {
                        from + self.config.pipeline.pmm_size
                    };
                    to = Some(to.map_or(cap, |t| t.min(cap)));
                }
                if from % CHUNK != 0 && self.store.hole_size(object, from - 1) != Some(0) {
                    from -= from % CHUNK;
                }
            }
        }

        let meta = self.store.meta(object);
        if method == Method::ConditionalGet && meta.last_modified.is_none() && meta.etag.is_none() {
            self.requests[q].method = Method::Get;
        }

        let url = Url::parse(self.store.key(object)).map_err(|_| WriteError::BadUrl)?;
        let req = &self.requests[q];
        let meta = self.store.meta(object);
        let is_proxy = self.origins[origin].key.is_proxy;
        let if_range = meta.etag.as_deref().filter(|_| {
            req.method == Method::Get
                && (from > 0 || to.is_some())
                && req.requestor.is_some()
                && !req.client_wants_range
                && self.config.pipeline.pmm_size == 0
                && self.config.pipeline.pmm_first_size == 0
        });
        let proxy_authorization = self
            .config
            .parent
            .auth_credentials
            .as_deref()
            .filter(|_| is_proxy)
            .map(|creds| format!("Basic {}", STANDARD.encode(creds)));

        let spec = RequestSpec {
            method: req.method,
            url: &url,
            absolute_form: is_proxy,
            from,
            to,
            if_range,
            if_modified_since: meta.last_modified,
            if_none_match: meta.etag.as_deref(),
            body_len,
            expect_continue: req.wait_continue,
            cache_control: &req.cache_control,
            headers: req.headers.as_deref(),
            proxy_authorization: proxy_authorization.as_deref(),
            via: req.via.as_deref(),
            proxy_name: &self.config.proxy.proxy_name,
            persistent: req.persistent,
        };
        tracing::trace!(request = %q, conn = %conn, from, to = ?to, "Serializing request");
        write_request(&spec, &mut self.conns[conn].reqbuf, MAX_REQUEST_BYTES)
    }

    /// Hand the staged batch to the substrate.
    pub(crate) fn send_request(&mut self, conn: ConnId) {
        let c = &mut self.conns[conn];
        let batch = c.reqbuf.split();
        match &mut c.out {
            Some(out) if out.kind == WriteKind::Requests => out.bytes.extend_from_slice(&batch),
            Some(_) => {
                // A side write is in flight; requests never share it.
                tracing::warn!(conn = %conn, "Dropping batch behind side write");
                return;
            }
            None => {
                c.out = Some(Outgoing {
                    bytes: batch,
                    written: 0,
                    kind: WriteKind::Requests,
                });
            }
        }
        self.set_timeout(conn, self.config.timeouts.read());
        self.push(Action::Send { conn });
    }

    /// Answer to `Action::Send`: bytes written, or why writing failed.
    pub fn on_sent(&mut self, conn: ConnId, result: Result<usize, IoFault>) {
        let Some(c) = self.conns.get_mut(conn) else { return };
        let Some(out) = c.out.as_mut() else {
            if let Err(fault) = result {
                self.write_failed(conn, fault);
            }
            return;
        };
        let kind = out.kind;
        match result {
            Ok(n) => {
                out.written += n;
                if out.written < out.bytes.len() {
                    self.push(Action::Send { conn });
                    return;
                }
                c.out = None;
                match kind {
                    WriteKind::Requests => {}
                    WriteKind::SideHeaders { body } | WriteKind::SideBody { body } => {
                        self.side_written(conn, body)
                    }
                }
            }
            Err(fault) => {
                c.out = None;
                match kind {
                    WriteKind::Requests => self.write_failed(conn, fault),
                    WriteKind::SideHeaders { .. } | WriteKind::SideBody { .. } => {
                        self.side_write_failed(conn, fault)
                    }
                }
            }
        }
    }

    /// Bytes still to be written on `conn`.
    pub fn pending_output(&self, conn: ConnId) -> Option<&[u8]> {
        let out = self.conns.get(conn)?.out.as_ref()?;
        (out.written < out.bytes.len()).then(|| &out.bytes[out.written..])
    }
}
