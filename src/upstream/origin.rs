//! Origin registry and per-origin learned behaviour.

use std::collections::VecDeque;
use std::fmt;

use tokio::time::Instant;

use super::{Action, ConnId, OriginId, Upstream};
use crate::http::HttpVersion;
use crate::observability::metrics;
use crate::store::ObjectStore;

/// Identity of an upstream target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub name: String,
    pub port: u16,
    /// Reached as a parent proxy: requests use absolute form.
    pub is_proxy: bool,
}

impl OriginKey {
    pub fn direct(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            is_proxy: false,
        }
    }

    pub fn proxy(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            is_proxy: true,
        }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)?;
        if self.is_proxy {
            write!(f, " (proxy)")?;
        }
        Ok(())
    }
}

/// What we believe about the origin's pipelining support.
///
/// Backed by a signed score: `<= 0` disabled, `1` ready to try,
/// `2..=3` trial in flight, `>= 4` enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Score at or below zero.
    Disabled(i32),
    ReadyToTry,
    /// A two-request trial was written (stage 2) and its first reply
    /// completed cleanly (stage 3).
    Trying { stage: u8 },
    /// Score of four or more.
    Enabled(i32),
}

impl Default for PipelineState {
    fn default() -> Self {
        PipelineState::Disabled(0)
    }
}

impl PipelineState {
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s <= 0 => PipelineState::Disabled(s),
            1 => PipelineState::ReadyToTry,
            2 => PipelineState::Trying { stage: 2 },
            3 => PipelineState::Trying { stage: 3 },
            s => PipelineState::Enabled(s),
        }
    }

    pub fn score(self) -> i32 {
        match self {
            PipelineState::Disabled(s) | PipelineState::Enabled(s) => s,
            PipelineState::ReadyToTry => 1,
            PipelineState::Trying { stage } => stage as i32,
        }
    }

    pub fn is_enabled(self) -> bool {
        matches!(self, PipelineState::Enabled(_))
    }

    /// Requests that may be written in one round on a connection that
    /// already carries `pipelined` requests.
    pub fn train_length(self, version: Option<HttpVersion>, pipelined: usize, max_train: usize) -> usize {
        let fresh = pipelined == 0;
        if version != Some(HttpVersion::Http11) {
            return usize::from(fresh);
        }
        match self {
            PipelineState::Disabled(_) | PipelineState::Trying { .. } => usize::from(fresh),
            PipelineState::ReadyToTry => {
                if fresh {
                    max_train.min(2)
                } else {
                    0
                }
            }
            PipelineState::Enabled(_) => max_train,
        }
    }

    /// Two or more requests went out together on a persistent origin.
    pub(crate) fn trial_sent(self) -> Self {
        match self {
            PipelineState::ReadyToTry => PipelineState::Trying { stage: 2 },
            other => other,
        }
    }

    pub(crate) fn after_clean_completion(self, still_pipelined: bool, http11: bool) -> Self {
        let score = self.score();
        if still_pipelined || (http11 && score <= 0) || score == 3 {
            PipelineState::from_score(score + 1)
        } else {
            self
        }
    }

    /// The connection closed with requests still written on it.
    pub(crate) fn after_abnormal_close(self) -> Self {
        let score = self.score();
        PipelineState::from_score(if score == 2 { score - 20 } else { score - 5 })
    }

    /// After any close, a trial can no longer be in flight.
    pub(crate) fn settle(self) -> Self {
        match self {
            PipelineState::Trying { .. } => PipelineState::ReadyToTry,
            other => other,
        }
    }

    pub fn label(self, version: Option<HttpVersion>, persistence: i32) -> &'static str {
        if version != Some(HttpVersion::Http11) || persistence <= 0 {
            return "";
        }
        match self.score() {
            s if s < 0 => "no",
            0 | 1 => "unknown",
            2 | 3 => "trying",
            _ => "yes",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub(crate) conn: Option<ConnId>,
    /// An idle watcher is registered for the connection.
    pub(crate) idle_watch: bool,
}

/// Everything learned about one origin, plus its queue of requests not
/// yet on a connection.
pub(crate) struct Origin {
    pub(crate) key: OriginKey,
    pub(crate) slots: Vec<Slot>,
    /// Slots currently usable; at most `slots.len()`.
    pub(crate) num_slots: usize,
    pub(crate) queue: VecDeque<super::RequestId>,
    pub(crate) version: Option<HttpVersion>,
    /// Goes up on each kept-alive reply, down on each forced close.
    pub(crate) persistence: i32,
    pub(crate) pipeline: PipelineState,
    pub(crate) rtt_us: Option<u64>,
    /// Bytes per second.
    pub(crate) rate: Option<u64>,
    /// Rises by 10 per conditional request answered as if unconditional,
    /// decays by one per reply.
    pub(crate) lies: i32,
    pub(crate) last_active: Instant,
    /// Resolved address that last connected.
    pub(crate) addr_index: usize,
}

impl Origin {
    fn new(key: OriginKey, server_slots: usize, max_slots: usize) -> Self {
        Self {
            key,
            slots: (0..max_slots).map(|_| Slot::default()).collect(),
            num_slots: server_slots.min(max_slots),
            queue: VecDeque::new(),
            version: None,
            persistence: 0,
            pipeline: PipelineState::default(),
            rtt_us: None,
            rate: None,
            lies: 0,
            last_active: Instant::now(),
            addr_index: 0,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.slots.iter().all(|s| s.conn.is_none())
    }

    pub(crate) fn free_slot(&self) -> Option<usize> {
        self.slots[..self.num_slots]
            .iter()
            .position(|s| s.conn.is_none())
    }
}

impl<S: ObjectStore> Upstream<S> {
    /// Origin for `key`, created on first use.
    pub(crate) fn get_origin(&mut self, key: OriginKey) -> OriginId {
        let now = Instant::now();
        if let Some(&id) = self.origin_index.get(&key) {
            let origin = &self.origins[id];
            if origin.is_idle() && now.duration_since(origin.last_active) > self.config.pool.server_expire() {
                self.discard_origin(id);
            } else {
                self.origins[id].last_active = now;
                return id;
            }
        }
        let id = OriginId(self.next_id());
        let pool = &self.config.pool;
        let origin = Origin::new(key.clone(), pool.server_slots, pool.server_max_slots);
        tracing::debug!(origin = %key, id = %id, "New origin");
        self.origins.insert(id, origin);
        self.origin_index.insert(key, id);
        metrics::set_origins(self.origins.len());
        id
    }

    fn discard_origin(&mut self, id: OriginId) {
        if let Some(origin) = self.origins.remove(id) {
            tracing::debug!(origin = %origin.key, "Discarding idle origin");
            if self.origin_index.get(&origin.key) == Some(&id) {
                self.origin_index.remove(&origin.key);
            }
            metrics::set_origins(self.origins.len());
        }
    }

    /// Forget idle origins whose expiry has passed. Returns how many went.
    pub fn expire_origins(&mut self, now: Instant) -> usize {
        let ttl = self.config.pool.server_expire();
        let expired: Vec<OriginId> = self
            .origins
            .iter()
            .filter(|(_, o)| o.is_idle() && now.saturating_duration_since(o.last_active) > ttl)
            .map(|(id, _)| id)
            .collect();
        for &id in &expired {
            self.discard_origin(id);
        }
        expired.len()
    }

    pub(crate) fn unwatch_idle(&mut self, origin: OriginId, slot: usize) {
        let entry = &mut self.origins[origin].slots[slot];
        if entry.idle_watch {
            entry.idle_watch = false;
            if let Some(conn) = entry.conn {
                self.push(Action::UnwatchIdle { conn });
            }
        }
    }
}
