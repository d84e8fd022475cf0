//! Random substrate and requestor behaviour against the engine's
//! bookkeeping: cross-references stay consistent, object references are
//! balanced, and every requestor hears back exactly once.

mod common;

use std::collections::HashSet;

use proptest::prelude::*;

use common::{chunked_reply, ok_reply, Harness};
use proxy_upstream::error::UpstreamError;
use proxy_upstream::http::Method;
use proxy_upstream::store::ObjectId;
use proxy_upstream::upstream::{
    ConnId, Fetch, FetchOutcome, IoFault, OriginKey, RequestId, RequestorEvent, RequestorId,
};

const HOSTS: [&str; 2] = ["a.example", "b.example"];

#[derive(Debug, Clone, Copy)]
enum ReplyKind {
    Ok,
    Chunked,
    Short,
    CloseDelimited,
    Eof,
    ReadError,
    NotModified,
}

#[derive(Debug, Clone)]
enum Op {
    Fetch(usize),
    Resolve(bool),
    Connect(bool),
    Flush(usize),
    FailWrite(usize),
    Reply(usize, ReplyKind),
    Timeout(usize),
    IdleReadable(usize),
    Abort(usize),
    ClientReset(usize),
    Detach(usize),
    Unpipeline(usize),
}

fn reply_kind() -> impl Strategy<Value = ReplyKind> {
    prop_oneof![
        4 => Just(ReplyKind::Ok),
        2 => Just(ReplyKind::Chunked),
        1 => Just(ReplyKind::Short),
        1 => Just(ReplyKind::CloseDelimited),
        1 => Just(ReplyKind::Eof),
        1 => Just(ReplyKind::ReadError),
        1 => Just(ReplyKind::NotModified),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..2usize).prop_map(Op::Fetch),
        3 => any::<bool>().prop_map(|ok| Op::Resolve(ok)),
        3 => prop_oneof![4 => Just(true), 1 => Just(false)].prop_map(Op::Connect),
        4 => any::<usize>().prop_map(Op::Flush),
        1 => any::<usize>().prop_map(Op::FailWrite),
        5 => (any::<usize>(), reply_kind()).prop_map(|(i, k)| Op::Reply(i, k)),
        1 => any::<usize>().prop_map(Op::Timeout),
        1 => any::<usize>().prop_map(Op::IdleReadable),
        1 => any::<usize>().prop_map(Op::Abort),
        1 => any::<usize>().prop_map(Op::ClientReset),
        1 => any::<usize>().prop_map(Op::Detach),
        1 => any::<usize>().prop_map(Op::Unpipeline),
    ]
}

struct Model {
    h: Harness,
    fetched: Vec<(RequestorId, ObjectId)>,
    detached: HashSet<RequestorId>,
    serial: usize,
}

fn pick<T: Copy>(items: &[T], i: usize) -> Option<T> {
    (!items.is_empty()).then(|| items[i % items.len()])
}

impl Model {
    fn new() -> Self {
        Self {
            h: Harness::new(),
            fetched: Vec::new(),
            detached: HashSet::new(),
            serial: 0,
        }
    }

    fn connections(&self) -> Vec<ConnId> {
        let mut conns: Vec<ConnId> = HOSTS
            .iter()
            .filter_map(|host| self.h.engine.origin_id(&OriginKey::direct(*host, 80)))
            .flat_map(|origin| self.h.engine.connections_of(origin))
            .collect();
        conns.sort();
        conns
    }

    fn live_requests(&self) -> Vec<RequestId> {
        let mut live = Vec::new();
        for host in HOSTS {
            let Some(origin) = self.h.engine.origin_id(&OriginKey::direct(host, 80)) else {
                continue;
            };
            live.extend(self.h.engine.queued(origin));
            for conn in self.h.engine.connections_of(origin) {
                live.extend(self.h.engine.chain(conn));
            }
        }
        live
    }

    fn writing(&self) -> Vec<ConnId> {
        self.connections()
            .into_iter()
            .filter(|&c| self.h.engine.pending_output(c).is_some())
            .collect()
    }

    /// Connections waiting for the head of a reply.
    fn awaiting_reply(&mut self) -> Vec<ConnId> {
        let mut ready = Vec::new();
        for conn in self.connections() {
            if self.h.engine.pending_output(conn).is_none()
                && !self.h.engine.chain(conn).is_empty()
                && self.h.wants_read(conn)
            {
                ready.push(conn);
            }
        }
        ready
    }

    fn fetch(&mut self, host: usize) {
        self.serial += 1;
        let url = format!("http://{}/{}", HOSTS[host % HOSTS.len()], self.serial);
        let requestor = self.h.requestor();
        let object = self.h.store_mut().make_private(&url);
        match self.h.enqueue(Fetch::new(object, Method::Get, requestor)) {
            FetchOutcome::Queued(_) => self.fetched.push((requestor, object)),
            other => panic!("fetch of {} not queued: {:?}", url, other),
        }
    }

    fn reply(&mut self, conn: ConnId, kind: ReplyKind) {
        match kind {
            ReplyKind::Ok => {
                self.h.feed(conn, ok_reply("body").as_bytes());
            }
            ReplyKind::Chunked => {
                self.h.feed(conn, chunked_reply(&["ab", "cd"]).as_bytes());
            }
            ReplyKind::Short => {
                self.h
                    .feed(conn, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
                self.h.eof(conn);
            }
            ReplyKind::CloseDelimited => {
                self.h
                    .feed(conn, b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nabc");
                self.h.eof(conn);
            }
            ReplyKind::Eof => self.h.eof(conn),
            ReplyKind::ReadError => self
                .h
                .read_error(conn, IoFault::Io("Connection reset by peer".to_string())),
            ReplyKind::NotModified => {
                self.h.feed(conn, b"HTTP/1.1 304 Not Modified\r\n\r\n");
            }
        }
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Fetch(host) => self.fetch(host),
            Op::Resolve(ok) => {
                if let Some(conn) = self.h.resolving().first().copied() {
                    self.h.resolve(conn, ok);
                }
            }
            Op::Connect(ok) => {
                if let Some(conn) = self.h.connecting().first().copied() {
                    self.h.connect(conn, ok);
                }
            }
            Op::Flush(i) => {
                if let Some(conn) = pick(&self.writing(), i) {
                    self.h.flush(conn);
                }
            }
            Op::FailWrite(i) => {
                if let Some(conn) = pick(&self.writing(), i) {
                    self.h
                        .fail_write(conn, IoFault::Io("Broken pipe".to_string()));
                }
            }
            Op::Reply(i, kind) => {
                let ready = self.awaiting_reply();
                if let Some(conn) = pick(&ready, i) {
                    self.reply(conn, kind);
                }
            }
            Op::Timeout(i) => {
                if let Some(conn) = pick(&self.connections(), i) {
                    self.h.fire_timeout(conn);
                }
            }
            Op::IdleReadable(i) => {
                if let Some(conn) = pick(&self.connections(), i) {
                    self.h.engine.on_idle_readable(conn);
                    self.h.pump();
                }
            }
            Op::Abort(i) => {
                if let Some(q) = pick(&self.live_requests(), i) {
                    self.h
                        .engine
                        .abort_request(q, true, UpstreamError::protocol("Aborted by test"));
                    self.h.pump();
                }
            }
            Op::ClientReset(i) => {
                if let Some(q) = pick(&self.live_requests(), i) {
                    self.h.engine.client_reset(q);
                    self.h.pump();
                }
            }
            Op::Detach(i) => {
                let attached: Vec<RequestorId> = self
                    .fetched
                    .iter()
                    .map(|&(r, _)| r)
                    .filter(|r| !self.detached.contains(r))
                    .collect();
                if let Some(requestor) = pick(&attached, i) {
                    self.h.engine.detach_requestor(requestor);
                    self.h.pump();
                    self.detached.insert(requestor);
                }
            }
            Op::Unpipeline(i) => {
                if let Some(q) = pick(&self.live_requests(), i) {
                    self.h.engine.unpipeline(q);
                    self.h.pump();
                }
            }
        }
    }

    fn check(&self) -> Result<(), TestCaseError> {
        if let Err(e) = self.h.engine.check_invariants() {
            return Err(TestCaseError::fail(e));
        }
        for &(requestor, _) in &self.fetched {
            prop_assert!(self.h.terminal_events(requestor) <= 1, "{} answered twice", requestor);
        }
        let rebound = self
            .h
            .events
            .iter()
            .any(|(_, e)| matches!(e, RequestorEvent::Rebound { .. }));
        if !rebound {
            let live = self.live_requests();
            for &(_, object) in &self.fetched {
                let users = live
                    .iter()
                    .filter(|&&q| self.h.engine.request_object(q) == Some(object))
                    .count();
                prop_assert_eq!(self.h.store().refcount(object), 1 + users);
            }
        }
        Ok(())
    }

    /// Serve everything still outstanding, then let idle connections time out.
    fn drain(&mut self) -> Result<(), TestCaseError> {
        // A fresh fetch per origin also sweeps detached leftovers off the queues.
        for host in 0..HOSTS.len() {
            self.fetch(host);
        }
        for _ in 0..5_000 {
            if let Some(conn) = self.h.resolving().first().copied() {
                self.h.resolve(conn, true);
                continue;
            }
            if let Some(conn) = self.h.connecting().first().copied() {
                self.h.connect(conn, true);
                continue;
            }
            if let Some(conn) = self.writing().first().copied() {
                self.h.flush(conn);
                continue;
            }
            if let Some(conn) = self.awaiting_reply().first().copied() {
                self.h.feed(conn, ok_reply("body").as_bytes());
                continue;
            }
            break;
        }
        prop_assert_eq!(self.h.engine.request_count(), 0);

        for conn in self.connections() {
            self.h.fire_timeout(conn);
            if self.h.engine.has_connection(conn) {
                self.h.engine.on_idle_readable(conn);
                self.h.pump();
            }
        }
        prop_assert_eq!(self.h.engine.connection_count(), 0);
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_engine_bookkeeping_survives_random_traffic(ops in prop::collection::vec(op(), 1..60)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op);
            model.check()?;
        }
        model.drain()?;
        model.check()?;

        for &(requestor, object) in &model.fetched {
            if !model.detached.contains(&requestor) {
                prop_assert_eq!(model.h.terminal_events(requestor), 1, "{} never answered", requestor);
            }
            prop_assert_eq!(model.h.store().refcount(object), 1);
            prop_assert_eq!(model.h.store().chunk_locks(object, 0), 0);
        }
    }
}
