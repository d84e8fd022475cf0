//! The driver actor: owns the engine and the sockets, performs the
//! engine's actions and feeds the results back.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::resolver;
use super::{Command, DriverError, FetchHandle, FetchReport};
use crate::config::UpstreamConfig;
use crate::http::Method;
use crate::store::{MemoryStore, ObjectId, ObjectStore};
use crate::upstream::{
    Action, ConnId, Fetch, FetchOutcome, IoFault, ReadOutcome, RequestorEvent, RequestorId,
    ResolveOutcome, Upstream,
};

const COMMAND_QUEUE: usize = 64;

/// Outcome of a spawned wait, delivered to the actor.
#[derive(Debug)]
enum Event {
    Resolved {
        conn: ConnId,
        outcome: ResolveOutcome,
    },
    Connected {
        conn: ConnId,
        result: Result<(usize, TcpStream), IoFault>,
    },
    Writable {
        conn: ConnId,
        result: io::Result<()>,
    },
    Readable {
        conn: ConnId,
        result: io::Result<()>,
    },
    IdleReadable {
        conn: ConnId,
    },
    Timeout {
        conn: ConnId,
        token: u64,
    },
}

/// Socket and the tasks waiting on it. Dropping it aborts the tasks.
#[derive(Default)]
struct Socket {
    stream: Option<Arc<TcpStream>>,
    dial: Option<JoinHandle<()>>,
    read: Option<JoinHandle<()>>,
    write: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

fn replace_task(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
    if let Some(old) = slot.replace(task) {
        old.abort();
    }
}

fn abort_task(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        for slot in [
            &mut self.dial,
            &mut self.read,
            &mut self.write,
            &mut self.idle,
            &mut self.timer,
        ] {
            abort_task(slot);
        }
    }
}

struct PendingFetch {
    url: String,
    method: Method,
    object: ObjectId,
    reply: oneshot::Sender<Result<FetchReport, DriverError>>,
}

pub struct Driver {
    engine: Upstream<MemoryStore>,
    sockets: HashMap<ConnId, Socket>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
    pending: HashMap<RequestorId, PendingFetch>,
    next_requestor: u64,
}

impl Driver {
    pub fn new(config: Arc<UpstreamConfig>) -> (Self, FetchHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        let driver = Self {
            engine: Upstream::new(config, MemoryStore::new()),
            sockets: HashMap::new(),
            events_tx,
            events,
            commands,
            pending: HashMap::new(),
            next_requestor: 0,
        };
        (driver, FetchHandle::new(tx))
    }

    /// Run until shutdown, or until every handle is dropped and no fetch
    /// is outstanding.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.engine.config().pool.sweep_interval();
        let mut sweep = time::interval_at(Instant::now() + period, period);
        let mut accepting = true;

        tracing::info!(sweep_secs = period.as_secs(), "Upstream driver starting");
        loop {
            tokio::select! {
                cmd = self.commands.recv(), if accepting => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => accepting = false,
                },
                Some(event) = self.events.recv() => self.on_event(event),
                _ = sweep.tick() => {
                    let expired = self.engine.expire_origins(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "Expired idle origins");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Upstream driver received shutdown signal");
                    break;
                }
            }
            self.perform_actions();
            if !accepting && self.pending.is_empty() {
                break;
            }
        }

        for (_, fetch) in self.pending.drain() {
            let _ = fetch.reply.send(Err(DriverError::Stopped));
        }
        self.sockets.clear();
        tracing::info!("Upstream driver stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Fetch {
                url,
                method,
                body,
                reply,
            } => self.start_fetch(url, method, body, reply),
            Command::Listing { reply } => {
                let _ = reply.send(self.engine.listing());
            }
        }
    }

    fn start_fetch(
        &mut self,
        url: String,
        method: Method,
        body: Option<Bytes>,
        reply: oneshot::Sender<Result<FetchReport, DriverError>>,
    ) {
        self.next_requestor += 1;
        let requestor = RequestorId(self.next_requestor);
        let object = self.engine.store_mut().make_private(&url);
        let mut fetch = Fetch::new(object, method, requestor);
        if let Some(body) = &body {
            fetch = fetch.body(body.len() as u64);
        }

        match self.engine.enqueue_fetch(fetch) {
            FetchOutcome::Queued(request) => {
                tracing::debug!(url = %url, request = %request, requestor = %requestor, "Fetch queued");
                self.pending.insert(
                    requestor,
                    PendingFetch {
                        url,
                        method,
                        object,
                        reply,
                    },
                );
                if let Some(body) = body {
                    self.engine.push_client_body(requestor, &body, true);
                }
            }
            FetchOutcome::AlreadySatisfied => {
                let report = self.report(&url, method, object);
                self.engine.store_mut().release(object);
                let _ = reply.send(Ok(report));
            }
            FetchOutcome::Rejected(err) => {
                tracing::warn!(url = %url, error = %err, "Fetch rejected");
                self.engine.store_mut().release(object);
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Resolved { conn, outcome } => self.engine.on_resolved(conn, outcome),
            Event::Connected { conn, result } => match result {
                Ok((index, stream)) => {
                    let Some(socket) = self.sockets.get_mut(&conn) else { return };
                    socket.stream = Some(Arc::new(stream));
                    self.engine.on_connected(conn, Ok(index));
                }
                Err(fault) => self.engine.on_connected(conn, Err(fault)),
            },
            Event::Writable { conn, result } => match result {
                Ok(()) => self.send(conn),
                Err(e) => self.engine.on_sent(conn, Err(e.into())),
            },
            Event::Readable { conn, result } => match result {
                Ok(()) => self.receive(conn),
                Err(e) => self.engine.on_received(conn, ReadOutcome::Error(e.into())),
            },
            Event::IdleReadable { conn } => self.engine.on_idle_readable(conn),
            Event::Timeout { conn, token } => self.engine.on_timeout(conn, token),
        }
    }

    fn perform_actions(&mut self) {
        while let Some(action) = self.engine.poll_action() {
            tracing::trace!(action = ?action, "Performing");
            match action {
                Action::Resolve {
                    conn, name, port, ..
                } => {
                    let tx = self.events_tx.clone();
                    let task = tokio::spawn(async move {
                        let outcome = resolver::resolve(&name, port).await;
                        let _ = tx.send(Event::Resolved { conn, outcome });
                    });
                    replace_task(&mut self.sockets.entry(conn).or_default().dial, task);
                }
                Action::Connect { conn, addrs, start } => {
                    let tx = self.events_tx.clone();
                    let task = tokio::spawn(async move {
                        let result = resolver::connect(&addrs, start).await;
                        let _ = tx.send(Event::Connected { conn, result });
                    });
                    replace_task(&mut self.sockets.entry(conn).or_default().dial, task);
                }
                Action::Send { conn } => self.send(conn),
                Action::Receive { conn } => self.await_readable(conn),
                Action::WatchIdle { conn } => self.watch_idle(conn),
                Action::UnwatchIdle { conn } => {
                    if let Some(socket) = self.sockets.get_mut(&conn) {
                        abort_task(&mut socket.idle);
                    }
                }
                Action::SetTimeout { conn, token, after } => {
                    let tx = self.events_tx.clone();
                    let task = tokio::spawn(async move {
                        time::sleep(after).await;
                        let _ = tx.send(Event::Timeout { conn, token });
                    });
                    replace_task(&mut self.sockets.entry(conn).or_default().timer, task);
                }
                Action::CancelTimeout { conn } => {
                    if let Some(socket) = self.sockets.get_mut(&conn) {
                        abort_task(&mut socket.timer);
                    }
                }
                Action::Close { conn } => {
                    tracing::trace!(conn = %conn, "Dropping socket");
                    self.sockets.remove(&conn);
                }
                Action::Notify { requestor, event } => self.deliver(requestor, event),
            }
        }
    }

    fn stream(&self, conn: ConnId) -> Option<Arc<TcpStream>> {
        self.sockets.get(&conn).and_then(|s| s.stream.clone())
    }

    /// Write as much pending output as the socket takes now.
    fn send(&mut self, conn: ConnId) {
        let Some(stream) = self.stream(conn) else {
            self.engine.on_sent(conn, Err(IoFault::Shutdown));
            return;
        };
        let Some(bytes) = self.engine.pending_output(conn) else { return };
        match stream.try_write(bytes) {
            Ok(n) => self.engine.on_sent(conn, Ok(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let tx = self.events_tx.clone();
                let task = tokio::spawn(async move {
                    let result = stream.writable().await;
                    let _ = tx.send(Event::Writable { conn, result });
                });
                if let Some(socket) = self.sockets.get_mut(&conn) {
                    replace_task(&mut socket.write, task);
                }
            }
            Err(e) => self.engine.on_sent(conn, Err(e.into())),
        }
    }

    fn await_readable(&mut self, conn: ConnId) {
        let Some(stream) = self.stream(conn) else {
            self.engine.on_received(conn, ReadOutcome::Error(IoFault::Shutdown));
            return;
        };
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = stream.readable().await;
            let _ = tx.send(Event::Readable { conn, result });
        });
        if let Some(socket) = self.sockets.get_mut(&conn) {
            replace_task(&mut socket.read, task);
        }
    }

    /// Read straight into the engine's receive target.
    fn receive(&mut self, conn: ConnId) {
        let Some(stream) = self.stream(conn) else { return };
        let result = {
            let Some(mut target) = self.engine.recv_target(conn) else { return };
            if target.capacity() == 0 {
                Ok(None)
            } else {
                let mut slices = target.io_slices();
                stream.try_read_vectored(&mut slices).map(Some)
            }
        };
        let outcome = match result {
            Ok(None) => ReadOutcome::Data(0),
            Ok(Some(0)) => ReadOutcome::Eof,
            Ok(Some(n)) => ReadOutcome::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.await_readable(conn);
                return;
            }
            Err(e) => ReadOutcome::Error(e.into()),
        };
        self.engine.on_received(conn, outcome);
    }

    fn watch_idle(&mut self, conn: ConnId) {
        let Some(stream) = self.stream(conn) else { return };
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            // Data or EOF on an idle connection both end it.
            let _ = stream.peek(&mut byte).await;
            let _ = tx.send(Event::IdleReadable { conn });
        });
        if let Some(socket) = self.sockets.get_mut(&conn) {
            replace_task(&mut socket.idle, task);
        }
    }

    fn deliver(&mut self, requestor: RequestorId, event: RequestorEvent) {
        match event {
            RequestorEvent::Rebound { object } => {
                let Some(fetch) = self.pending.get_mut(&requestor) else { return };
                let store = self.engine.store_mut();
                store.retain(object);
                let old = std::mem::replace(&mut fetch.object, object);
                store.release(old);
            }
            RequestorEvent::Finished { object } => {
                let Some(fetch) = self.pending.remove(&requestor) else { return };
                debug_assert_eq!(fetch.object, object);
                let report = self.report(&fetch.url, fetch.method, fetch.object);
                tracing::info!(url = %fetch.url, status = report.status, length = ?report.length, "Fetch finished");
                self.close_fetch(requestor, fetch.object);
                let _ = fetch.reply.send(Ok(report));
            }
            RequestorEvent::Error { status, message } => {
                let Some(fetch) = self.pending.remove(&requestor) else { return };
                tracing::warn!(url = %fetch.url, status = %status, "Fetch failed: {}", message);
                self.close_fetch(requestor, fetch.object);
                let _ = fetch.reply.send(Err(DriverError::Upstream { status, message }));
            }
            RequestorEvent::WantBody | RequestorEvent::DrainBody => {
                // Bodies are handed over whole when the fetch is queued.
                tracing::trace!(requestor = %requestor, event = ?event, "Body event");
            }
        }
    }

    fn close_fetch(&mut self, requestor: RequestorId, object: ObjectId) {
        self.engine.detach_requestor(requestor);
        self.engine.store_mut().release(object);
    }

    fn report(&self, url: &str, method: Method, object: ObjectId) -> FetchReport {
        let store = self.engine.store();
        let meta = store.meta(object);
        let mut body = BytesMut::new();
        if method != Method::Head {
            loop {
                let part = store.read(object, body.len() as u64, usize::MAX);
                if part.is_empty() {
                    break;
                }
                body.extend_from_slice(&part);
            }
        }
        FetchReport {
            url: url.to_string(),
            status: meta.code,
            message: meta.message.clone(),
            length: meta.length,
            etag: meta.etag.clone(),
            body: body.freeze(),
        }
    }
}
