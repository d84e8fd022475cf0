//! Reply bodies.
//!
//! A body is read straight into the object's chunks when the scratch
//! buffer is empty and the next bytes are known to be payload (direct);
//! otherwise it goes through the scratch buffer and is copied out,
//! de-chunking on the way (indirect).

use std::io::IoSliceMut;

use http::StatusCode;

use super::connection::ReadMode;
use super::finish::FinishMode;
use super::{ConnId, IoFault, ReadOutcome, Upstream};
use crate::error::UpstreamError;
use crate::observability::metrics;
use crate::store::{DirectSlices, ObjectId, ObjectStore, CHUNK_SIZE};

const CHUNK: u64 = CHUNK_SIZE as u64;

/// Scratch reads of chunked bodies stay small so a chunk header is
/// usually followed by a direct read.
const CHUNKED_SCRATCH: usize = 2048;

fn scratch_buffer() -> Box<[u8]> {
    vec![0u8; CHUNK_SIZE].into_boxed_slice()
}

/// Memory the next read should land in, in order.
pub struct RecvTarget<'a> {
    slices: Vec<&'a mut [u8]>,
}

impl RecvTarget<'_> {
    pub fn io_slices(&mut self) -> Vec<IoSliceMut<'_>> {
        self.slices
            .iter_mut()
            .map(|s| IoSliceMut::new(&mut s[..]))
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    /// Copy `data` in as a read would. Returns how much fit.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let mut done = 0;
        for slice in self.slices.iter_mut() {
            if done == data.len() {
                break;
            }
            let n = slice.len().min(data.len() - done);
            slice[..n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        done
    }
}

impl<S: ObjectStore> Upstream<S> {
    /// Where the bytes answering `Action::Receive` for `conn` go.
    pub fn recv_target(&mut self, conn: ConnId) -> Option<RecvTarget<'_>> {
        let Self { store, conns, .. } = self;
        let c = conns.get_mut(conn)?;
        let len = c.len;
        match c.read {
            ReadMode::Idle => None,
            ReadMode::Headers => {
                let buf = c.buf.get_or_insert_with(scratch_buffer);
                Some(RecvTarget {
                    slices: vec![&mut buf[len..]],
                })
            }
            ReadMode::Indirect { limit } => {
                let buf = c.buf.get_or_insert_with(scratch_buffer);
                Some(RecvTarget {
                    slices: vec![&mut buf[len..limit]],
                })
            }
            ReadMode::Direct {
                object, end, spill, ..
            } => {
                let DirectSlices { first, second } = store.direct_slices(object, c.offset, end)?;
                let mut slices = vec![first];
                slices.extend(second);
                if spill > 0 {
                    let buf = c.buf.get_or_insert_with(scratch_buffer);
                    slices.push(&mut buf[..spill]);
                }
                Some(RecvTarget { slices })
            }
        }
    }

    /// Answer to `Action::Receive`.
    pub fn on_received(&mut self, conn: ConnId, outcome: ReadOutcome) {
        let Some(c) = self.conns.get(conn) else { return };
        let mode = c.read;
        if c.chain.is_empty() {
            return;
        }
        self.cancel_timeout(conn);
        match mode {
            ReadMode::Idle => {
                tracing::debug!(conn = %conn, outcome = ?outcome, "Read outcome with no read pending");
            }
            ReadMode::Headers => self.header_read(conn, outcome),
            ReadMode::Indirect { .. } => match outcome {
                ReadOutcome::Error(fault) => self.body_read_failed(conn, fault),
                ReadOutcome::Data(n) => {
                    self.conns[conn].len += n;
                    metrics::bytes_indirect(n);
                    self.indirect_common(conn, false);
                }
                ReadOutcome::Eof => self.indirect_common(conn, true),
            },
            ReadMode::Direct {
                object, end, spill, ..
            } => match outcome {
                ReadOutcome::Error(fault) => {
                    self.release_direct(conn);
                    self.body_read_failed(conn, fault);
                }
                ReadOutcome::Data(n) => {
                    let c = &mut self.conns[conn];
                    let offset = c.offset;
                    let stored = n.min((end - offset) as usize);
                    self.store.commit_direct(object, offset, offset + stored as u64);
                    if c.chunked {
                        c.decoder.consume_direct(stored as u64);
                    }
                    c.offset += stored as u64;
                    metrics::bytes_direct(stored);
                    self.release_direct(conn);
                    if n > stored {
                        debug_assert!(n - stored <= spill);
                        self.conns[conn].len = n - stored;
                        metrics::bytes_indirect(n - stored);
                        self.indirect_common(conn, false);
                    } else {
                        self.store.notify(object);
                        self.read_data(conn);
                    }
                }
                ReadOutcome::Eof => {
                    self.release_direct(conn);
                    self.indirect_common(conn, true);
                }
            },
        }
    }

    fn body_read_failed(&mut self, conn: ConnId, fault: IoFault) {
        let reset = fault == IoFault::ClientReset;
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

    /// Consume what the scratch buffer holds, then either complete the
    /// reply or read more.
    fn indirect_common(&mut self, conn: ConnId, eof: bool) {
        let Some(&request) = self.conns[conn].chain.front() else { return };
        let object = self.requests[request].object;

        if self.conns[conn].len > 0 {
            match self.add_buffered_data(conn, 0) {
                Err(err) => {
                    tracing::error!(conn = %conn, "{}", err);
                    self.abort_connection(conn, true, err);
                    return;
                }
                Ok(true) => {
                    if self.requests[request].to.is_none() && !self.settle_length(object) {
                        self.abort_connection(
                            conn,
                            true,
                            UpstreamError::protocol("Inconsistent object size"),
                        );
                        return;
                    }
                    self.finish(conn, FinishMode::Keep, 0);
                    return;
                }
                Ok(false) => {}
            }
        }

        if !eof {
            self.read_data(conn);
            return;
        }
        let c = &self.conns[conn];
        let to = self.requests[request].to;
        let expected = to.or(self.store.meta(object).length);
        if c.len > 0 || c.chunked || expected.map_or(false, |t| c.offset < t) {
            tracing::error!(conn = %conn, offset = c.offset, expected = ?expected, "Server dropped connection");
            self.abort_connection(
                conn,
                true,
                UpstreamError::transport(StatusCode::BAD_GATEWAY, "Server dropped connection"),
            );
            return;
        }
        let size = self.store.size(object);
        if self.store.meta(object).length.is_none() && to.map_or(true, |t| t > size) {
            self.store.meta_mut(object).length = Some(size);
            self.store.metadata_changed(object);
        }
        self.finish(conn, FinishMode::Close, 0);
    }

    /// Schedule the next body read on `conn`.
    pub(crate) fn read_data(&mut self, conn: ConnId) {
        let c = &self.conns[conn];
        let Some(&request) = c.chain.front() else { return };
        let req = &self.requests[request];
        if req.requestor.is_none() {
            self.finish(conn, FinishMode::Close, 0);
            return;
        }
        let object = req.object;
        let to = req.to.or(self.store.meta(object).length);
        let offset = c.offset;
        if to == Some(offset) {
            self.finish(conn, FinishMode::Keep, 0);
            return;
        }

        if c.len == 0 {
            let remaining = if c.chunked {
                Some(c.decoder.remaining()).filter(|&r| r > 0)
            } else {
                to.filter(|&t| t > offset).map(|t| t - offset)
            };
            if let Some(len) = remaining {
                if self.start_direct(conn, object, len) {
                    return;
                }
            }
            self.conns[conn].buf = None;
        }

        let c = &mut self.conns[conn];
        let limit = if c.chunked { CHUNKED_SCRATCH } else { CHUNK_SIZE };
        if c.len >= limit {
            tracing::error!(conn = %conn, buffered = c.len, "Scratch buffer full");
            self.abort_connection(
                conn,
                true,
                UpstreamError::protocol("Couldn't parse server data"),
            );
            return;
        }
        c.read = ReadMode::Indirect { limit };
        self.await_read(conn);
    }

    /// Lock the chunks under the next `len` body bytes and read into them.
    fn start_direct(&mut self, conn: ConnId, object: ObjectId, len: u64) -> bool {
        let c = &self.conns[conn];
        let offset = c.offset;
        let i = (offset / CHUNK) as usize;
        let j = offset % CHUNK;
        // Extra scratch room for whatever follows the payload.
        let more = if c.chunked {
            if len >= 2000 {
                20
            } else {
                (2048 - len as usize).min(CHUNK_SIZE)
            }
        } else if c.chain.len() > 1 {
            CHUNK_SIZE
        } else {
            0
        };
        let two = len + j > CHUNK;
        let span = if two { 2 * CHUNK } else { CHUNK };
        let end = (offset + len).min(i as u64 * CHUNK + span);
        let spill = if more > 0 && len + j <= span { more } else { 0 };

        self.store.lock_chunk(object, i);
        if two {
            self.store.lock_chunk(object, i + 1);
        }
        if self.store.direct_slices(object, offset, end).is_none() {
            self.store.unlock_chunk(object, i);
            if two {
                self.store.unlock_chunk(object, i + 1);
            }
            return false;
        }

        let c = &mut self.conns[conn];
        if spill == 0 {
            c.buf = None;
        }
        c.read = ReadMode::Direct {
            object,
            chunk: i,
            two,
            end,
            spill,
        };
        tracing::trace!(conn = %conn, offset, end, spill, "Direct read");
        self.await_read(conn);
        true
    }

    /// Move payload from the scratch buffer (past `skip` bytes) into the
    /// object. Returns whether the body is complete.
    pub(crate) fn add_buffered_data(&mut self, conn: ConnId, skip: usize) -> Result<bool, UpstreamError> {
        let Some(&request) = self.conns[conn].chain.front() else { return Ok(false) };
        let object = self.requests[request].object;
        let to = self.requests[request].to;
        let length = self.store.meta(object).length;
        let c = &mut self.conns[conn];

        if !c.chunked {
            let mut n = (c.len - skip) as u64;
            if let Some(l) = length {
                n = n.min(l.saturating_sub(c.offset));
            }
            if let Some(t) = to {
                n = n.min(t.saturating_sub(c.offset));
            }
            let n = n as usize;
            let buf = c.buf.as_deref_mut().unwrap_or_default();
            if n > 0 {
                self.store.add_data(object, c.offset, &buf[skip..skip + n])?;
                c.offset += n as u64;
                tracing::trace!(conn = %conn, offset = c.offset, "Body data");
            }
            let used = skip + n;
            buf.copy_within(used..c.len, 0);
            c.len -= used;

            let done = length.map_or(false, |l| l <= c.offset) || to.map_or(false, |t| t <= c.offset);
            if done || n > 0 {
                self.store.notify(object);
            }
            return Ok(done);
        }

        let mut ranges = Vec::new();
        let buf = c.buf.as_deref_mut().unwrap_or_default();
        let decoded = c.decoder.decode(&buf[skip..c.len], &mut ranges)?;
        for range in &ranges {
            let data = &buf[skip + range.start..skip + range.end];
            self.store.add_data(object, c.offset, data)?;
            c.offset += data.len() as u64;
        }
        let used = skip + decoded.consumed;
        buf.copy_within(used..c.len, 0);
        c.len -= used;
        if !ranges.is_empty() || decoded.done {
            self.store.notify(object);
        }
        Ok(decoded.done)
    }
}
