//! Request bodies (POST, PUT).
//!
//! A request with a body gets a connection of its own that has never
//! served a request, and is never pipelined. Body bytes supplied by the
//! requestor are forwarded as they arrive while the reply is read
//! concurrently.

use bytes::Buf;
use tokio::time::Instant;

use super::connection::{Outgoing, SideProgress, WriteKind};
use super::finish::FinishMode;
use super::request::Location;
use super::{Action, ConnId, IoFault, OriginId, RequestId, RequestorEvent, RequestorId, Upstream};
use crate::error::UpstreamError;
use crate::observability::metrics;
use crate::store::{ObjectFlags, ObjectStore};

impl<S: ObjectStore> Upstream<S> {
    /// Try to start the side request at the head of `origin`'s queue.
    /// Returns whether the scheduler should look at the queue again.
    pub(crate) fn side_request(&mut self, origin: OriginId) -> Result<bool, UpstreamError> {
        let o = &self.origins[origin];
        let Some(&q) = o.queue.front() else { return Ok(false) };

        let mut fresh = None;
        let mut free = false;
        let mut idle = Vec::new();
        for (i, slot) in o.slots[..o.num_slots].iter().enumerate() {
            match slot.conn {
                None => free = true,
                Some(c) if self.conns[c].is_idle() => {
                    if self.conns[c].serviced == 0 {
                        fresh = Some((i, c));
                        break;
                    }
                    idle.push(c);
                }
                Some(_) => {}
            }
        }

        let Some((slot, conn)) = fresh else {
            if free {
                self.open_connection(origin)?;
            } else if !idle.is_empty() {
                // Free a slot; the fresh connection comes on a later round.
                let victim = idle[fastrand::usize(..idle.len())];
                tracing::debug!(conn = %victim, "Closing idle connection for a side request");
                self.finish(victim, FinishMode::Close, 0);
            }
            return Ok(false);
        };
        self.unwatch_idle(origin, slot);

        let body_len = self.requests[q].body.as_ref().map_or(0, |b| b.len);
        if let Err(e) = self.prepare_and_write(conn, q, Some(body_len)) {
            tracing::error!(request = %q, error = %e, "Couldn't write POST or PUT request");
            self.drop_request(q, true, &UpstreamError::from(e));
            return Ok(true);
        }

        self.origins[origin].queue.pop_front();
        let c = &mut self.conns[conn];
        c.chain.push_back(q);
        c.side = Some(SideProgress {
            body_len,
            sent: 0,
            awaiting_continue: false,
        });
        let req = &mut self.requests[q];
        req.location = Location::Connection(conn);
        req.dispatched_at = Some(Instant::now());
        metrics::request_written();
        tracing::debug!(request = %q, conn = %conn, body_len, "Side request written");
        self.do_side(conn);
        Ok(true)
    }

    /// Advance the body relay on `conn` by one step.
    pub(crate) fn do_side(&mut self, conn: ConnId) {
        let Some(c) = self.conns.get(conn) else { return };
        let (Some(&q), Some(progress)) = (c.chain.front(), c.side) else { return };
        if c.out.is_some() {
            return;
        }
        let Some(body) = self.requests[q].body.as_ref() else { return };
        let object = self.requests[q].object;
        let wait_continue = self.requests[q].wait_continue;
        let avail = (body.buffered.len() as u64).min(progress.body_len - progress.sent) as usize;
        let side = &self.config.side;
        let doflush = avail > 0
            && (!side.batching
                || avail >= side.flush_threshold
                || progress.sent + avail as u64 >= progress.body_len);
        let done = progress.sent >= progress.body_len;

        self.set_timeout(conn, self.config.timeouts.read());

        if !self.conns[conn].reqbuf.is_empty() {
            let c = &mut self.conns[conn];
            let mut bytes = c.reqbuf.split();
            let body = if wait_continue { 0 } else { avail };
            if let Some(b) = self.requests[q].body.as_ref() {
                bytes.extend_from_slice(&b.buffered[..body]);
            }
            c.out = Some(Outgoing {
                bytes,
                written: 0,
                kind: WriteKind::SideHeaders { body },
            });
            self.push(Action::Send { conn });
            self.reply(conn, false);
        } else if self.store.flags(object).contains(ObjectFlags::ABORTED) {
            tracing::debug!(conn = %conn, request = %q, "Object aborted, draining request body");
            if let Some(requestor) = self.requests[q].requestor {
                self.notify_requestor(requestor, RequestorEvent::DrainBody);
            }
            self.io_failed(conn, IoFault::Shutdown);
        } else if !wait_continue && doflush {
            let c = &mut self.conns[conn];
            let mut bytes = bytes::BytesMut::with_capacity(avail);
            if let Some(b) = self.requests[q].body.as_ref() {
                bytes.extend_from_slice(&b.buffered[..avail]);
            }
            c.out = Some(Outgoing {
                bytes,
                written: 0,
                kind: WriteKind::SideBody { body: avail },
            });
            self.push(Action::Send { conn });
        } else if wait_continue {
            tracing::debug!(conn = %conn, "Waiting for 100-continue");
            if let Some(side) = self.conns[conn].side.as_mut() {
                side.awaiting_continue = true;
            }
        } else if !done {
            if let Some(requestor) = self.requests[q].requestor {
                self.notify_requestor(requestor, RequestorEvent::WantBody);
            }
        }
    }

    /// A side write finished; `body` bytes of request body went out.
    pub(crate) fn side_written(&mut self, conn: ConnId, body: usize) {
        let Some(&q) = self.conns[conn].chain.front() else { return };
        if let Some(b) = self.requests[q].body.as_mut() {
            b.buffered.advance(body.min(b.buffered.len()));
        }
        if let Some(side) = self.conns[conn].side.as_mut() {
            side.sent += body as u64;
        }
        self.do_side(conn);
    }

    /// A side write failed: the object is aborted and the read side
    /// reports the error.
    pub(crate) fn side_write_failed(&mut self, conn: ConnId, fault: IoFault) {
        let Some(&q) = self.conns[conn].chain.front() else { return };
        tracing::error!(conn = %conn, error = %fault, "Couldn't write to server");
        let object = self.requests[q].object;
        self.store.abort(object, 503, "Couldn't write to server");
        self.store.notify(object);
        self.do_side(conn);
    }

    /// Request body from the requestor. `eof` marks the last bytes.
    pub fn push_client_body(&mut self, requestor: RequestorId, data: &[u8], eof: bool) {
        let Some(&q) = self.paired.get(&requestor) else { return };
        let Some(body) = self.requests[q].body.as_mut() else { return };
        body.buffered.extend_from_slice(data);
        body.eof |= eof;
        if let Location::Connection(conn) = self.requests[q].location {
            let waiting = self.conns[conn].side.map_or(false, |s| s.awaiting_continue);
            if !waiting {
                self.do_side(conn);
            }
        }
    }

    /// Bytes of request body the relay still expects from `request`.
    pub fn body_remaining(&self, request: RequestId) -> Option<u64> {
        let req = self.requests.get(request)?;
        let body = req.body.as_ref()?;
        let sent = match req.location {
            Location::Connection(conn) => self.conns[conn].side.map_or(0, |s| s.sent),
            Location::Origin(_) => 0,
        };
        Some(body.len.saturating_sub(sent + body.buffered.len() as u64))
    }
}
