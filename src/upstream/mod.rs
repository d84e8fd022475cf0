//! Upstream fetch engine.
//!
//! # Data Flow
//! ```text
//! enqueue_fetch (request.rs)
//!     → origin queue (origin.rs)
//!     → trigger: pick or open a connection, write a train (scheduler.rs)
//!     → reply head parsed, object reconciled (reply.rs, reconcile.rs)
//!     → body read directly into chunks or through scratch (body.rs)
//!     → finish: stats, keep or close, requeue leftovers, trigger again (finish.rs)
//!
//! POST/PUT bypass pipelining through side.rs.
//! ```
//!
//! # Design Decisions
//! - Sans-IO: the engine never touches sockets or timers. It emits
//!   `Action`s and is fed results through the `on_*` methods. The tokio
//!   driver in `runtime` is one such substrate, the tests are another.
//! - Origins, connections and requests live in arenas keyed by handles;
//!   relations are handles, never references
//! - Every exit path of a request goes through `destroy_request`, the only
//!   place its object reference is released
//! - Timeouts carry a token; a stale token is ignored

mod body;
mod connection;
mod finish;
mod listing;
mod origin;
mod reconcile;
mod reply;
mod request;
mod scheduler;
mod side;
mod stats;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::config::UpstreamConfig;
use crate::store::{ObjectId, ObjectStore};

pub use body::RecvTarget;
pub use listing::{render_listing, OriginSummary};
pub use origin::{OriginKey, PipelineState};
pub use request::{Fetch, FetchOutcome};

use connection::Connection;
use origin::Origin;
use request::{Location, UpstreamRequest};

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

handle!(
    /// Handle on a known origin.
    OriginId,
    "origin"
);
handle!(
    /// Handle on an upstream connection.
    ConnId,
    "conn"
);
handle!(
    /// Handle on a server-side request.
    RequestId,
    "req"
);

/// Identity of the client-side party waiting on a request. Chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestorId(pub u64);

impl fmt::Display for RequestorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Handle-keyed storage. Indexing with a stale handle is a bug and panics.
pub(crate) struct Arena<K, T> {
    items: HashMap<K, T>,
}

impl<K: Copy + Eq + Hash + fmt::Display, T> Arena<K, T> {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K, value: T) {
        self.items.insert(key, value);
    }

    fn remove(&mut self, key: K) -> Option<T> {
        self.items.remove(&key)
    }

    fn get(&self, key: K) -> Option<&T> {
        self.items.get(&key)
    }

    fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.items.get_mut(&key)
    }

    fn contains(&self, key: K) -> bool {
        self.items.contains_key(&key)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn keys(&self) -> Vec<K> {
        self.items.keys().copied().collect()
    }

    fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.items.iter().map(|(k, v)| (*k, v))
    }
}

impl<K: Copy + Eq + Hash + fmt::Display, T> Index<K> for Arena<K, T> {
    type Output = T;

    fn index(&self, key: K) -> &T {
        match self.items.get(&key) {
            Some(v) => v,
            None => panic!("stale handle {}", key),
        }
    }
}

impl<K: Copy + Eq + Hash + fmt::Display, T> IndexMut<K> for Arena<K, T> {
    fn index_mut(&mut self, key: K) -> &mut T {
        match self.items.get_mut(&key) {
            Some(v) => v,
            None => panic!("stale handle {}", key),
        }
    }
}

/// Something the I/O substrate must do on the engine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Resolve `name`; answer with `on_resolved`.
    Resolve {
        conn: ConnId,
        name: String,
        port: u16,
        depth: u32,
    },
    /// Connect to one of `addrs`, trying `start` first; answer with `on_connected`.
    Connect {
        conn: ConnId,
        addrs: Vec<SocketAddr>,
        start: usize,
    },
    /// Write `pending_output`; report progress with `on_sent`.
    Send { conn: ConnId },
    /// Read into `recv_target` once readable; report with `on_received`.
    Receive { conn: ConnId },
    /// Report unsolicited readability of an idle connection with `on_idle_readable`.
    WatchIdle { conn: ConnId },
    UnwatchIdle { conn: ConnId },
    /// Call `on_timeout(conn, token)` after `after`.
    SetTimeout {
        conn: ConnId,
        token: u64,
        after: Duration,
    },
    CancelTimeout { conn: ConnId },
    /// Drop the socket.
    Close { conn: ConnId },
    /// Tell a requestor what happened to its request.
    Notify {
        requestor: RequestorId,
        event: RequestorEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestorEvent {
    /// The request failed.
    Error { status: StatusCode, message: String },
    /// The request completed; the object holds the result.
    Finished { object: ObjectId },
    /// The object was superseded; follow `object` from now on.
    Rebound { object: ObjectId },
    /// The side relay wants more request body.
    WantBody,
    /// The object was aborted; discard remaining request body.
    DrainBody,
}

/// Answer to `Action::Resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Addresses(Vec<SocketAddr>),
    /// CNAME target to resolve next.
    Alias(String),
    Failed(String),
}

/// Why an I/O operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoFault {
    Io(String),
    TimedOut,
    /// The requestor reset its side; the object is not marked failed.
    ClientReset,
    /// Shut down locally.
    Shutdown,
}

impl IoFault {
    /// Raised on this side rather than by the origin; never worth a retry.
    pub fn is_local(&self) -> bool {
        matches!(self, IoFault::ClientReset | IoFault::Shutdown)
    }
}

impl fmt::Display for IoFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoFault::Io(e) => write!(f, "{}", e),
            IoFault::TimedOut => write!(f, "Timeout"),
            IoFault::ClientReset => write!(f, "Connection reset by client"),
            IoFault::Shutdown => write!(f, "Connection shut down"),
        }
    }
}

impl From<std::io::Error> for IoFault {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => IoFault::TimedOut,
            _ => IoFault::Io(e.to_string()),
        }
    }
}

/// Answer to `Action::Receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes placed into the receive target. `Data(0)` processes what is
    /// already buffered without a read.
    Data(usize),
    Eof,
    Error(IoFault),
}

/// The fetch engine.
pub struct Upstream<S: ObjectStore> {
    config: Arc<UpstreamConfig>,
    store: S,
    origins: Arena<OriginId, Origin>,
    origin_index: HashMap<OriginKey, OriginId>,
    conns: Arena<ConnId, Connection>,
    requests: Arena<RequestId, UpstreamRequest>,
    /// Requestor → its in-flight request.
    paired: HashMap<RequestorId, RequestId>,
    /// Requestors that already issued their fetch.
    requested: HashSet<RequestorId>,
    actions: VecDeque<Action>,
    next_id: u64,
}

impl<S: ObjectStore> Upstream<S> {
    pub fn new(config: Arc<UpstreamConfig>, store: S) -> Self {
        Self {
            config,
            store,
            origins: Arena::new(),
            origin_index: HashMap::new(),
            conns: Arena::new(),
            requests: Arena::new(),
            paired: HashMap::new(),
            requested: HashSet::new(),
            actions: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn push(&mut self, action: Action) {
        self.actions.push_back(action);
    }

    fn notify_requestor(&mut self, requestor: RequestorId, event: RequestorEvent) {
        self.push(Action::Notify { requestor, event });
    }

    /// Next action for the substrate.
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    pub fn has_connection(&self, conn: ConnId) -> bool {
        self.conns.contains(conn)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    pub fn origin_id(&self, key: &OriginKey) -> Option<OriginId> {
        self.origin_index.get(key).copied()
    }

    /// Requests queued on `origin` and not yet written.
    pub fn queued(&self, origin: OriginId) -> Vec<RequestId> {
        self.origins
            .get(origin)
            .map(|o| o.queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Connections of `origin`, by slot.
    pub fn connections_of(&self, origin: OriginId) -> Vec<ConnId> {
        self.origins
            .get(origin)
            .map(|o| o.slots.iter().filter_map(|s| s.conn).collect())
            .unwrap_or_default()
    }

    /// Requests written on `conn`, oldest first.
    pub fn chain(&self, conn: ConnId) -> Vec<RequestId> {
        self.conns
            .get(conn)
            .map(|c| c.chain.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn serviced(&self, conn: ConnId) -> Option<u32> {
        self.conns.get(conn).map(|c| c.serviced)
    }

    pub fn pipeline_state(&self, origin: OriginId) -> Option<PipelineState> {
        self.origins.get(origin).map(|o| o.pipeline)
    }

    pub fn persistence(&self, origin: OriginId) -> Option<i32> {
        self.origins.get(origin).map(|o| o.persistence)
    }

    pub fn lies(&self, origin: OriginId) -> Option<i32> {
        self.origins.get(origin).map(|o| o.lies)
    }

    pub fn slot_count(&self, origin: OriginId) -> Option<usize> {
        self.origins.get(origin).map(|o| o.num_slots)
    }

    /// Round-trip time and transfer rate estimates.
    pub fn estimates(&self, origin: OriginId) -> Option<(Option<Duration>, Option<u64>)> {
        self.origins
            .get(origin)
            .map(|o| (o.rtt_us.map(Duration::from_micros), o.rate))
    }

    pub fn request_object(&self, request: RequestId) -> Option<ObjectId> {
        self.requests.get(request).map(|r| r.object)
    }

    pub fn request_of(&self, requestor: RequestorId) -> Option<RequestId> {
        self.paired.get(&requestor).copied()
    }

    /// Check the cross-references between origins, connections and requests.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen: HashMap<RequestId, usize> = HashMap::new();
        for (oid, origin) in self.origins.iter() {
            for &q in &origin.queue {
                *seen.entry(q).or_default() += 1;
                match self.requests.get(q).map(|r| r.location) {
                    Some(Location::Origin(o)) if o == oid => {}
                    other => return Err(format!("{} queued on {} but at {:?}", q, oid, other)),
                }
            }
            for (i, slot) in origin.slots.iter().enumerate() {
                if let Some(c) = slot.conn {
                    match self.conns.get(c) {
                        Some(conn) if conn.origin == oid && conn.slot == i => {}
                        _ => return Err(format!("{} slot {} holds stray {}", oid, i, c)),
                    }
                }
            }
        }
        for (cid, conn) in self.conns.iter() {
            if self.origins.get(conn.origin).and_then(|o| o.slots.get(conn.slot)).and_then(|s| s.conn)
                != Some(cid)
            {
                return Err(format!("{} missing from its slot", cid));
            }
            for &q in &conn.chain {
                *seen.entry(q).or_default() += 1;
                match self.requests.get(q).map(|r| r.location) {
                    Some(Location::Connection(c)) if c == cid => {}
                    other => return Err(format!("{} chained on {} but at {:?}", q, cid, other)),
                }
            }
        }
        for (q, _) in self.requests.iter() {
            match seen.get(&q) {
                Some(1) => {}
                Some(n) => return Err(format!("{} reachable {} times", q, n)),
                None => return Err(format!("{} unreachable", q)),
            }
        }
        for (&r, &q) in &self.paired {
            if self.requests.get(q).and_then(|req| req.requestor) != Some(r) {
                return Err(format!("{} paired with {} one way only", r, q));
            }
        }
        for (q, req) in self.requests.iter() {
            if let Some(r) = req.requestor {
                if self.paired.get(&r) != Some(&q) {
                    return Err(format!("{} points at {} one way only", q, r));
                }
            }
        }
        Ok(())
    }
}
