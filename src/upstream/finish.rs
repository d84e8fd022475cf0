//! End of a reply: statistics, keep-alive or close, requeueing.
//!
//! Once connected, a connection only ends a reply or goes down through
//! `finish`, which also triggers its origin again.

use http::StatusCode;
use tokio::time::Instant;

use super::connection::ReadMode;
use super::stats::{fold, Sample};
use super::{Action, ConnId, IoFault, RequestorEvent, Upstream};
use crate::error::UpstreamError;
use crate::http::HttpVersion;
use crate::observability::metrics;
use crate::store::{ObjectFlags, ObjectStore};

/// How a connection leaves `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishMode {
    /// The head request is done; reuse the connection if it allows.
    Keep,
    /// The head request is done; drop the connection.
    Close,
    /// Interim reply: the head request stays and its reply is read next.
    KeepCurrent,
}

impl<S: ObjectStore> Upstream<S> {
    /// Complete the head request of `conn` and decide the connection's
    /// fate. `offset` is how much of the read buffer the reply used.
    pub(crate) fn finish(&mut self, conn: ConnId, mode: FinishMode, offset: usize) {
        let Some(c) = self.conns.get(conn) else { return };
        let origin = c.origin;
        let head = c.chain.front().copied();
        let mut close = match mode {
            FinishMode::Close => true,
            FinishMode::Keep => head.map_or(true, |h| !self.requests[h].persistent),
            FinishMode::KeepCurrent => false,
        };
        self.release_direct(conn);

        if self.conns[conn].out.is_some() && mode != FinishMode::KeepCurrent {
            tracing::debug!(conn = %conn, "Reply arrived before the request was written");
            self.conns[conn].out = None;
            close = true;
        }

        if let (Some(head), false) = (head, mode == FinishMode::KeepCurrent) {
            self.record_stats(conn, head);
            let c = &mut self.conns[conn];
            c.chain.pop_front();
            c.side = None;
            let object = self.requests[head].object;
            self.store
                .clear_flags(object, ObjectFlags::INPROGRESS | ObjectFlags::VALIDATING);
            if let Some(requestor) = self.unpair(head) {
                self.notify_requestor(requestor, RequestorEvent::Finished { object });
            }
            self.destroy_request(head);
        }

        tracing::debug!(
            conn = %conn,
            origin = %self.origins[origin].key,
            close,
            "Done with server connection"
        );

        let c = &mut self.conns[conn];
        c.read = ReadMode::Idle;
        if !close {
            if offset < c.len {
                if c.chain.is_empty() {
                    tracing::warn!(
                        origin = %self.origins[origin].key,
                        bytes = c.len - offset,
                        "Closing connection: stray bytes of data"
                    );
                    close = true;
                } else if let Some(buf) = c.buf.as_mut() {
                    buf.copy_within(offset..c.len, 0);
                    c.len -= offset;
                }
            } else {
                c.len = 0;
            }
        }
        c.serviced += 1;
        self.origins[origin].last_active = Instant::now();

        if close {
            self.close_connection(conn);
        } else {
            self.keep_connection(conn, mode);
        }
        self.schedule(origin);
    }

    fn close_connection(&mut self, conn: ConnId) {
        let c = &self.conns[conn];
        let (origin, slot) = (c.origin, c.slot);
        self.unwatch_idle(origin, slot);
        self.cancel_timeout(conn);
        self.push(Action::Close { conn });

        let leftovers: Vec<_> = self.conns[conn].chain.drain(..).collect();
        let threshold = self.config.pool.broken_origin_threshold;
        let o = &mut self.origins[origin];
        o.persistence -= 1;
        if o.persistence < -threshold {
            o.num_slots = o.slots.len();
        }
        if !leftovers.is_empty() {
            tracing::debug!(origin = %o.key, count = leftovers.len(), "Restarting pipeline");
            o.pipeline = o.pipeline.after_abnormal_close();
            self.requeue_front(origin, leftovers);
        }
        let o = &mut self.origins[origin];
        o.pipeline = o.pipeline.settle();
        o.slots[slot].conn = None;
        self.conns.remove(conn);
        metrics::connection_closed();
    }

    fn keep_connection(&mut self, conn: ConnId, mode: FinishMode) {
        let origin = self.conns[conn].origin;
        let server_slots = self.config.pool.server_slots;
        let still_pipelined = !self.conns[conn].chain.is_empty();
        let o = &mut self.origins[origin];
        o.persistence += 1;
        if o.persistence > 0 {
            o.num_slots = o.slots.len().min(server_slots);
        }
        o.pipeline = o
            .pipeline
            .after_clean_completion(still_pipelined, o.version == Some(HttpVersion::Http11));
        self.set_timeout(conn, self.config.timeouts.idle());

        if mode == FinishMode::KeepCurrent || still_pipelined {
            self.reply(conn, true);
        } else {
            let c = &mut self.conns[conn];
            c.buf = None;
            c.len = 0;
        }
    }

    fn record_stats(&mut self, conn: ConnId, head: super::RequestId) {
        let c = &self.conns[conn];
        let req = &self.requests[head];
        let size = (c.offset > 0 && c.offset >= req.from).then(|| c.offset - req.from);
        let sample = Sample {
            dispatched: req.dispatched_at,
            headers: req.headers_at,
            finished: Instant::now(),
            size,
        };
        let rate = sample.rate(&self.config.stats);
        let o = &mut self.origins[c.origin];
        if let Some(rtt) = sample.rtt_us() {
            o.rtt_us = Some(fold(o.rtt_us, rtt));
        }
        if let Some(rate) = rate {
            o.rate = Some(fold(o.rate, rate));
        }
    }

    /// Release the chunk locks of an outstanding direct read.
    pub(crate) fn release_direct(&mut self, conn: ConnId) {
        let c = &mut self.conns[conn];
        if let ReadMode::Direct { object, chunk, two, .. } = c.read {
            c.read = ReadMode::Idle;
            self.store.unlock_chunk(object, chunk);
            if two {
                self.store.unlock_chunk(object, chunk + 1);
            }
        }
    }

    /// Reissue everything written on `conn` on a fresh connection.
    pub(crate) fn restart(&mut self, conn: ConnId) {
        let c = &mut self.conns[conn];
        let chain: Vec<_> = c.chain.drain(..).collect();
        let origin = c.origin;
        if chain.len() > 1 {
            tracing::warn!(origin = %self.origins[origin].key, count = chain.len(), "Restarting pipeline");
        }
        metrics::restart();
        self.requeue_front(origin, chain);
        self.finish(conn, FinishMode::Close, 0);
    }

    /// Fail the head request of `conn` and drop the connection.
    pub(crate) fn abort_connection(&mut self, conn: ConnId, fail: bool, err: UpstreamError) {
        let Some(c) = self.conns.get(conn) else { return };
        let connecting = c.is_connecting();
        if let Some(&head) = c.chain.front() {
            let object = self.requests[head].object;
            tracing::warn!(
                conn = %conn,
                request = %head,
                status = %err.status(),
                "{}",
                err
            );
            if let Some(requestor) = self.unpair(head) {
                self.notify_requestor(
                    requestor,
                    RequestorEvent::Error {
                        status: err.status(),
                        message: err.message().to_string(),
                    },
                );
            }
            if fail {
                self.fail_object(object, &err);
            }
        }
        if !connecting {
            self.finish(conn, FinishMode::Close, 0);
        }
    }

    /// A write on `conn` failed.
    pub(crate) fn write_failed(&mut self, conn: ConnId, fault: IoFault) {
        self.conns[conn].out = None;
        if self.conns[conn].serviced >= 1 && !fault.is_local() {
            self.restart(conn);
            return;
        }
        let fail = fault != IoFault::ClientReset;
        self.abort_connection(
            conn,
            fail,
            UpstreamError::transport(
                StatusCode::BAD_GATEWAY,
                format!("Couldn't send request to server: {}", fault),
            ),
        );
    }
}
