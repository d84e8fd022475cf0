//! Connection pool: opening connections, DNS/connect results, idle
//! watching and timeouts.
//!
//! # Responsibilities
//! - Claim an idle connection or open one in a free slot
//! - Follow DNS answers (CNAME chains are bounded) and connect results
//! - Watch idle connections for an unsolicited close
//! - Arm and fire per-connection timeouts

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use http::StatusCode;

use super::{Action, ConnId, IoFault, OriginId, ReadOutcome, RequestId, ResolveOutcome, Upstream};
use crate::error::UpstreamError;
use crate::http::{ChunkedDecoder, HttpVersion};
use crate::observability::metrics;
use crate::store::{ObjectId, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    Resolving { depth: u32 },
    Connecting,
    /// Connected, or failed and about to be torn down.
    Ready,
}

/// What the next read is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    Idle,
    Headers,
    /// Into the scratch buffer, up to `limit` bytes held.
    Indirect { limit: usize },
    /// Into locked chunk `chunk` (and `chunk + 1` when `two`), up to
    /// object offset `end`, spilling at most `spill` bytes into scratch.
    Direct {
        object: ObjectId,
        chunk: usize,
        two: bool,
        end: u64,
        spill: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Requests,
    /// Request head followed by `body` bytes of request body.
    SideHeaders { body: usize },
    SideBody { body: usize },
}

#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) bytes: BytesMut,
    pub(crate) written: usize,
    pub(crate) kind: WriteKind,
}

/// Progress of a request body through the side relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SideProgress {
    pub(crate) body_len: u64,
    pub(crate) sent: u64,
    /// Body withheld until a `100 Continue` arrives.
    pub(crate) awaiting_continue: bool,
}

/// One transport connection to an origin. It lives in `slot` of its
/// origin until finished.
pub(crate) struct Connection {
    pub(crate) origin: OriginId,
    pub(crate) slot: usize,
    pub(crate) phase: ConnPhase,
    /// Requests written, in reply order.
    pub(crate) chain: VecDeque<RequestId>,
    /// Request bytes staged but not yet handed to the substrate.
    pub(crate) reqbuf: BytesMut,
    /// Write handed to the substrate and not yet acknowledged.
    pub(crate) out: Option<Outgoing>,
    /// Scratch buffer, one chunk large; dropped when empty.
    pub(crate) buf: Option<Box<[u8]>>,
    pub(crate) len: usize,
    pub(crate) read: ReadMode,
    /// Object offset of the next body byte.
    pub(crate) offset: u64,
    pub(crate) chunked: bool,
    pub(crate) decoder: ChunkedDecoder,
    /// Replies completed on this connection.
    pub(crate) serviced: u32,
    pub(crate) version: Option<HttpVersion>,
    pub(crate) timeout: Option<u64>,
    pub(crate) side: Option<SideProgress>,
    pub(crate) connected: bool,
}

impl Connection {
    fn new(origin: OriginId, slot: usize) -> Self {
        Self {
            origin,
            slot,
            phase: ConnPhase::Resolving { depth: 0 },
            chain: VecDeque::new(),
            reqbuf: BytesMut::new(),
            out: None,
            buf: None,
            len: 0,
            read: ReadMode::Idle,
            offset: 0,
            chunked: false,
            decoder: ChunkedDecoder::new(),
            serviced: 0,
            version: None,
            timeout: None,
            side: None,
            connected: false,
        }
    }

    pub(crate) fn is_connecting(&self) -> bool {
        !matches!(self.phase, ConnPhase::Ready)
    }

    pub(crate) fn is_idle(&self) -> bool {
        !self.is_connecting() && self.chain.is_empty()
    }
}

impl<S: ObjectStore> Upstream<S> {
    /// Start a connection in the first free slot of `origin`.
    pub(crate) fn open_connection(&mut self, origin: OriginId) -> Result<ConnId, UpstreamError> {
        let budget = self.config.pool.max_total_connections;
        if budget > 0 && self.conns.len() >= budget {
            return Err(UpstreamError::resource("Connection budget exhausted"));
        }
        let Some(slot) = self.origins[origin].free_slot() else {
            return Err(UpstreamError::resource("No free connection slot"));
        };
        let id = ConnId(self.next_id());
        self.conns.insert(id, Connection::new(origin, slot));
        self.origins[origin].slots[slot].conn = Some(id);
        metrics::connection_opened();

        let key = &self.origins[origin].key;
        tracing::debug!(conn = %id, origin = %key.name, port = key.port, slot, "Connecting");
        let (name, port) = (key.name.clone(), key.port);
        self.set_timeout(id, self.config.timeouts.connect());
        self.push(Action::Resolve {
            conn: id,
            name,
            port,
            depth: 0,
        });
        Ok(id)
    }

    pub(crate) fn set_timeout(&mut self, conn: ConnId, after: Duration) {
        let token = self.next_id();
        self.conns[conn].timeout = Some(token);
        self.push(Action::SetTimeout { conn, token, after });
    }

    pub(crate) fn cancel_timeout(&mut self, conn: ConnId) {
        if self.conns[conn].timeout.take().is_some() {
            self.push(Action::CancelTimeout { conn });
        }
    }

    /// Answer to `Action::Resolve`.
    pub fn on_resolved(&mut self, conn: ConnId, outcome: ResolveOutcome) {
        let Some(c) = self.conns.get(conn) else { return };
        let ConnPhase::Resolving { depth } = c.phase else { return };
        let origin = c.origin;
        self.cancel_timeout(conn);
        let name = self.origins[origin].key.name.clone();
        match outcome {
            ResolveOutcome::Addresses(addrs) if !addrs.is_empty() => {
                self.conns[conn].phase = ConnPhase::Connecting;
                self.set_timeout(conn, self.config.timeouts.connect());
                let start = self.origins[origin].addr_index % addrs.len();
                self.push(Action::Connect { conn, addrs, start });
            }
            ResolveOutcome::Addresses(_) => {
                self.connect_failed(conn, format!("Host {} lookup failed: no addresses", name));
            }
            ResolveOutcome::Alias(target) => {
                if depth >= self.config.timeouts.cname_max_depth {
                    self.connect_failed(conn, "DNS CNAME loop".to_string());
                    return;
                }
                tracing::debug!(conn = %conn, origin = %name, alias = %target, "Following CNAME");
                self.conns[conn].phase = ConnPhase::Resolving { depth: depth + 1 };
                self.set_timeout(conn, self.config.timeouts.connect());
                let port = self.origins[origin].key.port;
                self.push(Action::Resolve {
                    conn,
                    name: target,
                    port,
                    depth: depth + 1,
                });
            }
            ResolveOutcome::Failed(e) => {
                self.connect_failed(conn, format!("Host {} lookup failed: {}", name, e));
            }
        }
    }

    /// Answer to `Action::Connect`: index of the address that worked.
    pub fn on_connected(&mut self, conn: ConnId, result: Result<usize, IoFault>) {
        let Some(c) = self.conns.get(conn) else { return };
        if c.phase != ConnPhase::Connecting {
            return;
        }
        let origin = c.origin;
        self.cancel_timeout(conn);
        match result {
            Ok(index) => {
                let c = &mut self.conns[conn];
                c.phase = ConnPhase::Ready;
                c.connected = true;
                self.origins[origin].addr_index = index;
                tracing::debug!(conn = %conn, origin = %self.origins[origin].key, "Connected");
                self.schedule(origin);
            }
            Err(fault) => {
                let key = &self.origins[origin].key;
                let message = format!("Connect to {}:{} failed: {}", key.name, key.port, fault);
                self.connect_failed(conn, message);
            }
        }
    }

    /// DNS or connect failure: fail the oldest queued request and drop
    /// the connection.
    fn connect_failed(&mut self, conn: ConnId, message: String) {
        let origin = self.conns[conn].origin;
        tracing::error!(conn = %conn, origin = %self.origins[origin].key, "{}", message);
        self.conns[conn].phase = ConnPhase::Ready;
        if let Some(&head) = self.origins[origin].queue.front() {
            self.drop_request(
                head,
                true,
                &UpstreamError::transport(StatusCode::GATEWAY_TIMEOUT, message.clone()),
            );
        }
        self.abort_connection(
            conn,
            true,
            UpstreamError::transport(StatusCode::BAD_GATEWAY, message),
        );
    }

    /// An idle connection became readable: the origin closed it or sent
    /// garbage. Either way it is done.
    pub fn on_idle_readable(&mut self, conn: ConnId) {
        let Some(c) = self.conns.get(conn) else { return };
        if !c.is_idle() {
            return;
        }
        let (origin, slot) = (c.origin, c.slot);
        if !self.origins[origin].slots[slot].idle_watch {
            return;
        }
        self.origins[origin].slots[slot].idle_watch = false;
        tracing::debug!(conn = %conn, origin = %self.origins[origin].key, "Idle connection closed by origin");
        self.abort_connection(
            conn,
            true,
            UpstreamError::transport(StatusCode::GATEWAY_TIMEOUT, "Timeout"),
        );
    }

    /// A timer armed with `SetTimeout` fired.
    pub fn on_timeout(&mut self, conn: ConnId, token: u64) {
        let Some(c) = self.conns.get_mut(conn) else { return };
        if c.timeout != Some(token) {
            return;
        }
        c.timeout = None;
        match c.phase {
            ConnPhase::Resolving { .. } | ConnPhase::Connecting => {
                self.connect_failed(conn, "Timeout".to_string());
            }
            ConnPhase::Ready => {
                if c.chain.is_empty() && c.out.is_none() {
                    tracing::debug!(conn = %conn, "Idle timeout");
                    self.finish(conn, super::finish::FinishMode::Close, 0);
                } else {
                    self.io_failed(conn, IoFault::TimedOut);
                }
            }
        }
    }

    /// Route an I/O failure to whichever side of the connection is waiting.
    pub(crate) fn io_failed(&mut self, conn: ConnId, fault: IoFault) {
        let Some(c) = self.conns.get(conn) else { return };
        if c.read == ReadMode::Idle {
            self.on_sent(conn, Err(fault));
        } else {
            self.on_received(conn, ReadOutcome::Error(fault));
        }
    }
}
