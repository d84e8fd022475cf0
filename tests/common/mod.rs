//! Shared utilities for the engine and driver tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use proxy_upstream::config::UpstreamConfig;
use proxy_upstream::http::Method;
use proxy_upstream::store::{MemoryStore, ObjectId, ObjectStore};
use proxy_upstream::upstream::{
    Action, ConnId, Fetch, FetchOutcome, IoFault, ReadOutcome, RequestId, RequestorEvent,
    RequestorId, ResolveOutcome, Upstream,
};

pub fn test_config() -> UpstreamConfig {
    UpstreamConfig::default().normalize()
}

/// Drives a sans-IO engine by hand, playing both the substrate and the
/// requestors.
pub struct Harness {
    pub engine: Upstream<MemoryStore>,
    /// Every action the engine emitted, in order.
    pub log: Vec<Action>,
    pub events: Vec<(RequestorId, RequestorEvent)>,
    timers: HashMap<ConnId, u64>,
    resolving: Vec<ConnId>,
    connecting: Vec<ConnId>,
    next_requestor: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: UpstreamConfig) -> Self {
        Self {
            engine: Upstream::new(Arc::new(config), MemoryStore::new()),
            log: Vec::new(),
            events: Vec::new(),
            timers: HashMap::new(),
            resolving: Vec::new(),
            connecting: Vec::new(),
            next_requestor: 0,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        self.engine.store()
    }

    pub fn store_mut(&mut self) -> &mut MemoryStore {
        self.engine.store_mut()
    }

    /// Collect whatever the engine emitted since the last call.
    pub fn pump(&mut self) {
        for action in self.engine.drain_actions() {
            match &action {
                Action::Resolve { conn, .. } => self.resolving.push(*conn),
                Action::Connect { conn, .. } => self.connecting.push(*conn),
                Action::SetTimeout { conn, token, .. } => {
                    self.timers.insert(*conn, *token);
                }
                Action::CancelTimeout { conn } => {
                    self.timers.remove(conn);
                }
                Action::Close { conn } => {
                    self.timers.remove(conn);
                    self.resolving.retain(|c| c != conn);
                    self.connecting.retain(|c| c != conn);
                }
                Action::Notify { requestor, event } => {
                    self.events.push((*requestor, event.clone()));
                }
                _ => {}
            }
            self.log.push(action);
        }
    }

    pub fn requestor(&mut self) -> RequestorId {
        self.next_requestor += 1;
        RequestorId(self.next_requestor)
    }

    pub fn enqueue(&mut self, fetch: Fetch) -> FetchOutcome {
        let outcome = self.engine.enqueue_fetch(fetch);
        self.pump();
        outcome
    }

    /// Queue a fetch of a fresh object for `url`.
    pub fn fetch(&mut self, url: &str, method: Method) -> (RequestorId, ObjectId, RequestId) {
        let requestor = self.requestor();
        let object = self.store_mut().make_private(url);
        match self.enqueue(Fetch::new(object, method, requestor)) {
            FetchOutcome::Queued(request) => (requestor, object, request),
            other => panic!("fetch of {} not queued: {:?}", url, other),
        }
    }

    pub fn resolving(&self) -> Vec<ConnId> {
        self.resolving.clone()
    }

    pub fn connecting(&self) -> Vec<ConnId> {
        self.connecting.clone()
    }

    pub fn resolve(&mut self, conn: ConnId, ok: bool) {
        self.resolving.retain(|c| *c != conn);
        let outcome = if ok {
            ResolveOutcome::Addresses(vec![SocketAddr::from(([127, 0, 0, 1], 80))])
        } else {
            ResolveOutcome::Failed("Name or service not known".to_string())
        };
        self.engine.on_resolved(conn, outcome);
        self.pump();
    }

    pub fn connect(&mut self, conn: ConnId, ok: bool) {
        self.connecting.retain(|c| *c != conn);
        let result = if ok {
            Ok(0)
        } else {
            Err(IoFault::Io("Connection refused".to_string()))
        };
        self.engine.on_connected(conn, result);
        self.pump();
    }

    /// Resolve and connect everything in progress. Returns the connections.
    pub fn establish(&mut self) -> Vec<ConnId> {
        let mut done = Vec::new();
        while let Some(&conn) = self.resolving.first().or(self.connecting.first()) {
            if self.resolving.contains(&conn) {
                self.resolve(conn, true);
            } else {
                self.connect(conn, true);
                done.push(conn);
            }
        }
        done
    }

    /// Let the substrate write everything pending on `conn`.
    pub fn flush(&mut self, conn: ConnId) -> String {
        let mut written = Vec::new();
        while let Some(bytes) = self.engine.pending_output(conn) {
            let bytes = bytes.to_vec();
            written.extend_from_slice(&bytes);
            self.engine.on_sent(conn, Ok(bytes.len()));
            self.pump();
        }
        String::from_utf8_lossy(&written).into_owned()
    }

    pub fn fail_write(&mut self, conn: ConnId, fault: IoFault) {
        self.engine.on_sent(conn, Err(fault));
        self.pump();
    }

    pub fn wants_read(&mut self, conn: ConnId) -> bool {
        self.engine.recv_target(conn).is_some()
    }

    /// Deliver `data` as reads, each as large as the engine's receive
    /// target allows. Returns how much the engine took.
    pub fn feed(&mut self, conn: ConnId, data: &[u8]) -> usize {
        let mut done = 0;
        while done < data.len() {
            let n = match self.engine.recv_target(conn) {
                Some(mut target) => target.fill(&data[done..]),
                None => break,
            };
            if n == 0 {
                break;
            }
            done += n;
            self.engine.on_received(conn, ReadOutcome::Data(n));
            self.pump();
        }
        done
    }

    /// Deliver `data` split at `cuts`, one read per piece.
    pub fn feed_split(&mut self, conn: ConnId, data: &[u8], cuts: &[usize]) -> usize {
        let mut points: Vec<usize> = cuts.iter().map(|&c| c.min(data.len())).collect();
        points.push(data.len());
        points.sort_unstable();
        let mut start = 0;
        let mut taken = 0;
        for end in points {
            if end > start {
                taken += self.feed(conn, &data[start..end]);
                start = end;
            }
        }
        taken
    }

    pub fn eof(&mut self, conn: ConnId) {
        self.engine.on_received(conn, ReadOutcome::Eof);
        self.pump();
    }

    pub fn read_error(&mut self, conn: ConnId, fault: IoFault) {
        self.engine.on_received(conn, ReadOutcome::Error(fault));
        self.pump();
    }

    /// Fire the armed timer of `conn`, if any.
    pub fn fire_timeout(&mut self, conn: ConnId) -> bool {
        let Some(token) = self.timers.remove(&conn) else { return false };
        self.engine.on_timeout(conn, token);
        self.pump();
        true
    }

    pub fn events_for(&self, requestor: RequestorId) -> Vec<RequestorEvent> {
        self.events
            .iter()
            .filter(|(r, _)| *r == requestor)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Finished and Error events delivered to `requestor`.
    pub fn terminal_events(&self, requestor: RequestorId) -> usize {
        self.events_for(requestor)
            .iter()
            .filter(|e| matches!(e, RequestorEvent::Finished { .. } | RequestorEvent::Error { .. }))
            .count()
    }

    pub fn closed(&self, conn: ConnId) -> bool {
        self.log
            .iter()
            .any(|a| matches!(a, Action::Close { conn: c } if *c == conn))
    }

    pub fn watched_idle(&self, conn: ConnId) -> bool {
        let last = self.log.iter().rev().find_map(|a| match a {
            Action::WatchIdle { conn: c } if *c == conn => Some(true),
            Action::UnwatchIdle { conn: c } if *c == conn => Some(false),
            _ => None,
        });
        last.unwrap_or(false)
    }

    pub fn body(&self, object: ObjectId) -> Vec<u8> {
        let size = self.store().size(object) as usize;
        self.store().read(object, 0, size).to_vec()
    }
}

pub fn ok_reply(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"v1\"\r\nLast-Modified: Mon, 01 Jan 2024 00:00:00 GMT\r\n\r\n{}",
        body.len(),
        body
    )
}

pub fn chunked_reply(chunks: &[&str]) -> String {
    let mut out = String::from("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
    for chunk in chunks {
        out.push_str(&format!("{:x}\r\n{}\r\n", chunk.len(), chunk));
    }
    out.push_str("0\r\n\r\n");
    out
}

/// Origin server answering each request with whatever `respond` builds
/// from the request head and body. Keeps connections open unless the
/// reply says `Connection: close`.
pub struct MockOrigin {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockOrigin {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

pub async fn start_mock_origin<F>(respond: F) -> MockOrigin
where
    F: Fn(&str, &[u8]) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let (count, log) = (accepted.clone(), requests.clone());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            let respond = respond.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                loop {
                    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                        match socket.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                        continue;
                    };
                    let head = String::from_utf8_lossy(&buf[..end + 4]).into_owned();
                    let body_len: usize = header_value(&head, "content-length")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    while buf.len() < end + 4 + body_len {
                        match socket.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                    let body: Vec<u8> = buf[end + 4..end + 4 + body_len].to_vec();
                    buf.drain(..end + 4 + body_len);
                    log.lock().unwrap().push(head.clone());

                    let reply = respond(&head, &body);
                    if socket.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                    if reply.to_ascii_lowercase().contains("connection: close") {
                        let _ = socket.shutdown().await;
                        return;
                    }
                }
            });
        }
    });

    MockOrigin {
        addr,
        accepted,
        requests,
    }
}
