//! In-memory object store.
//!
//! Backs the driver and the engine tests. Objects live in a map keyed by
//! handle; public objects are also indexed by key and survive with no
//! outstanding references, private ones are dropped on last release.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use super::{
    DirectSlices, ObjectFlags, ObjectId, ObjectMeta, ObjectStore, StoreError, CHUNK_SIZE,
};

const CHUNK: u64 = CHUNK_SIZE as u64;

#[derive(Default)]
struct Chunk {
    data: Option<Box<[u8]>>,
    /// Valid bytes from the start of the chunk.
    size: usize,
    locks: u32,
}

fn new_chunk() -> Box<[u8]> {
    vec![0u8; CHUNK_SIZE].into_boxed_slice()
}

struct Entry {
    key: String,
    flags: ObjectFlags,
    meta: ObjectMeta,
    refcount: usize,
    public: bool,
    chunks: Vec<Chunk>,
    size: u64,
    readers: usize,
    notifications: u64,
    notifier: Arc<Notify>,
}

impl Entry {
    fn new(key: &str, public: bool) -> Self {
        Self {
            key: key.to_string(),
            flags: ObjectFlags::INITIAL,
            meta: ObjectMeta::default(),
            refcount: 1,
            public,
            chunks: Vec::new(),
            size: 0,
            readers: 0,
            notifications: 0,
            notifier: Arc::new(Notify::new()),
        }
    }

    fn ensure_chunks(&mut self, count: usize) {
        while self.chunks.len() < count {
            self.chunks.push(Chunk::default());
        }
    }

    fn stored_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }

    fn notify(&mut self) {
        self.notifications += 1;
        self.notifier.notify_waiters();
    }
}

/// Object store holding everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    objects: HashMap<ObjectId, Entry>,
    index: HashMap<String, ObjectId>,
    next_id: u64,
    /// Byte budget; `None` is unlimited.
    capacity: Option<u64>,
    used: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that fails writes once `bytes` are held.
    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::default()
        }
    }

    fn entry(&self, id: ObjectId) -> &Entry {
        match self.objects.get(&id) {
            Some(entry) => entry,
            None => panic!("{} used after release", id),
        }
    }

    fn entry_mut(&mut self, id: ObjectId) -> &mut Entry {
        match self.objects.get_mut(&id) {
            Some(entry) => entry,
            None => panic!("{} used after release", id),
        }
    }

    fn allocate(&mut self, key: &str, public: bool) -> ObjectId {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.objects.insert(id, Entry::new(key, public));
        if public {
            self.index.insert(key.to_string(), id);
        }
        id
    }

    fn maybe_drop(&mut self, id: ObjectId) {
        let drop = self
            .objects
            .get(&id)
            .map_or(false, |e| e.refcount == 0 && !e.public);
        if drop {
            if let Some(entry) = self.objects.remove(&id) {
                self.used = self.used.saturating_sub(entry.stored_bytes());
            }
        }
    }

    /// Private object that is never shared through the key index.
    pub fn make_private(&mut self, key: &str) -> ObjectId {
        self.allocate(key, false)
    }

    pub fn lookup(&self, key: &str) -> Option<ObjectId> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn refcount(&self, id: ObjectId) -> usize {
        self.objects.get(&id).map_or(0, |e| e.refcount)
    }

    /// Number of `notify` calls seen by the object.
    pub fn notifications(&self, id: ObjectId) -> u64 {
        self.entry(id).notifications
    }

    pub fn chunk_locks(&self, id: ObjectId, index: usize) -> u32 {
        self.entry(id).chunks.get(index).map_or(0, |c| c.locks)
    }

    /// Register a reader; the returned handle fires on every notification.
    pub fn subscribe(&mut self, id: ObjectId) -> Arc<Notify> {
        let entry = self.entry_mut(id);
        entry.readers += 1;
        entry.notifier.clone()
    }

    pub fn unsubscribe(&mut self, id: ObjectId) {
        let entry = self.entry_mut(id);
        entry.readers = entry.readers.saturating_sub(1);
    }

    pub fn readers(&self, id: ObjectId) -> usize {
        self.entry(id).readers
    }

    /// Contiguous bytes starting at `offset`, at most `max` of them.
    pub fn read(&self, id: ObjectId, offset: u64, max: usize) -> Bytes {
        let entry = self.entry(id);
        let mut out = BytesMut::new();
        let mut pos = offset;
        while out.len() < max {
            let i = (pos / CHUNK) as usize;
            let j = (pos % CHUNK) as usize;
            let Some(chunk) = entry.chunks.get(i) else { break };
            let Some(data) = chunk.data.as_ref() else { break };
            if chunk.size <= j {
                break;
            }
            let n = (chunk.size - j).min(max - out.len());
            out.extend_from_slice(&data[j..j + n]);
            pos += n as u64;
            if j + n < CHUNK_SIZE {
                break;
            }
        }
        out.freeze()
    }

    /// Drop the data of every unlocked chunk. Returns how many were dropped.
    pub fn evict_unlocked(&mut self, id: ObjectId) -> usize {
        let entry = self.entry_mut(id);
        let mut freed = 0u64;
        let mut dropped = 0;
        for chunk in entry.chunks.iter_mut() {
            if chunk.locks == 0 && chunk.data.is_some() {
                freed += chunk.size as u64;
                chunk.data = None;
                chunk.size = 0;
                dropped += 1;
            }
        }
        self.used = self.used.saturating_sub(freed);
        dropped
    }
}

impl ObjectStore for MemoryStore {
    fn key(&self, id: ObjectId) -> &str {
        &self.entry(id).key
    }

    fn flags(&self, id: ObjectId) -> ObjectFlags {
        self.entry(id).flags
    }

    fn set_flags(&mut self, id: ObjectId, flags: ObjectFlags) {
        self.entry_mut(id).flags.insert(flags);
    }

    fn clear_flags(&mut self, id: ObjectId, flags: ObjectFlags) {
        self.entry_mut(id).flags.remove(flags);
    }

    fn meta(&self, id: ObjectId) -> &ObjectMeta {
        &self.entry(id).meta
    }

    fn meta_mut(&mut self, id: ObjectId) -> &mut ObjectMeta {
        &mut self.entry_mut(id).meta
    }

    fn size(&self, id: ObjectId) -> u64 {
        self.entry(id).size
    }

    fn retain(&mut self, id: ObjectId) {
        self.entry_mut(id).refcount += 1;
    }

    fn release(&mut self, id: ObjectId) {
        let entry = self.entry_mut(id);
        debug_assert!(entry.refcount > 0, "{} released too often", id);
        entry.refcount = entry.refcount.saturating_sub(1);
        self.maybe_drop(id);
    }

    fn notify(&mut self, id: ObjectId) {
        self.entry_mut(id).notify();
    }

    fn make_object(&mut self, key: &str) -> Result<ObjectId, StoreError> {
        if let Some(&id) = self.index.get(key) {
            self.retain(id);
            return Ok(id);
        }
        if self.capacity.map_or(false, |cap| self.used >= cap) {
            return Err(StoreError::Exhausted);
        }
        Ok(self.allocate(key, true))
    }

    fn privatise(&mut self, id: ObjectId) {
        let entry = self.entry_mut(id);
        entry.public = false;
        let key = entry.key.clone();
        if self.index.get(&key) == Some(&id) {
            self.index.remove(&key);
        }
        self.maybe_drop(id);
    }

    fn supersede(&mut self, id: ObjectId) {
        self.entry_mut(id).flags.insert(ObjectFlags::SUPERSEDED);
        self.privatise(id);
    }

    fn abort(&mut self, id: ObjectId, status: u16, message: &str) {
        let entry = self.entry_mut(id);
        entry.flags.remove(ObjectFlags::INITIAL | ObjectFlags::VALIDATING);
        entry.flags.insert(ObjectFlags::ABORTED);
        entry.meta = ObjectMeta {
            code: status,
            message: message.to_string(),
            ..ObjectMeta::default()
        };
        entry.size = 0;
        entry.notify();
        self.evict_unlocked(id);
        self.privatise(id);
    }

    fn fill_from_disk(&mut self, _id: ObjectId, _offset: u64) {}

    fn hole_size(&self, id: ObjectId, offset: u64) -> Option<u64> {
        let chunks = &self.entry(id).chunks;
        let mut i = (offset / CHUNK) as usize;
        let j = (offset % CHUNK) as usize;
        let chunk = chunks.get(i)?;
        let mut size = 0u64;
        if j != 0 {
            if chunk.size > j {
                return Some(0);
            }
            size = (CHUNK_SIZE - j) as u64;
            i += 1;
        }
        while let Some(chunk) = chunks.get(i) {
            if chunk.size > 0 {
                return Some(size);
            }
            size += CHUNK;
            i += 1;
        }
        None
    }

    fn add_data(&mut self, id: ObjectId, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(cap) = self.capacity {
            if self.used + data.len() as u64 > cap {
                return Err(StoreError::Exhausted);
            }
        }
        let entry = self.entry_mut(id);
        if let Some(length) = entry.meta.length {
            if offset + data.len() as u64 > length {
                return Err(StoreError::PastEnd { offset });
            }
        }
        let mut pos = offset;
        let mut rest = data;
        let mut added = 0u64;
        while !rest.is_empty() {
            let i = (pos / CHUNK) as usize;
            let j = (pos % CHUNK) as usize;
            entry.ensure_chunks(i + 1);
            let chunk = &mut entry.chunks[i];
            if chunk.size < j {
                return Err(StoreError::Gap { offset: pos });
            }
            let n = (CHUNK_SIZE - j).min(rest.len());
            let buf = chunk.data.get_or_insert_with(new_chunk);
            buf[j..j + n].copy_from_slice(&rest[..n]);
            if chunk.size < j + n {
                added += (j + n - chunk.size) as u64;
                chunk.size = j + n;
            }
            pos += n as u64;
            rest = &rest[n..];
        }
        entry.size = entry.size.max(pos);
        self.used += added;
        Ok(())
    }

    fn lock_chunk(&mut self, id: ObjectId, index: usize) {
        let entry = self.entry_mut(id);
        entry.ensure_chunks(index + 1);
        entry.chunks[index].locks += 1;
    }

    fn unlock_chunk(&mut self, id: ObjectId, index: usize) {
        if let Some(chunk) = self.entry_mut(id).chunks.get_mut(index) {
            chunk.locks = chunk.locks.saturating_sub(1);
        }
    }

    fn direct_slices(&mut self, id: ObjectId, offset: u64, end: u64) -> Option<DirectSlices<'_>> {
        if end <= offset {
            return None;
        }
        if let Some(cap) = self.capacity {
            if self.used + (end - offset) > cap {
                return None;
            }
        }
        let entry = self.entry_mut(id);
        let i = (offset / CHUNK) as usize;
        let j = (offset % CHUNK) as usize;
        let base = i as u64 * CHUNK;
        let spans_two = end > base + CHUNK;
        entry.ensure_chunks(if spans_two { i + 2 } else { i + 1 });
        if entry.chunks[i].size < j {
            return None;
        }
        let first_end = (end - base).min(CHUNK) as usize;
        let (head, tail) = entry.chunks.split_at_mut(i + 1);
        let first = &mut head[i].data.get_or_insert_with(new_chunk)[j..first_end];
        let second = if spans_two {
            let len = (end - base - CHUNK).min(CHUNK) as usize;
            Some(&mut tail[0].data.get_or_insert_with(new_chunk)[..len])
        } else {
            None
        };
        Some(DirectSlices { first, second })
    }

    fn commit_direct(&mut self, id: ObjectId, offset: u64, end: u64) {
        if end <= offset {
            return;
        }
        let entry = self.entry_mut(id);
        let i = (offset / CHUNK) as usize;
        let base = i as u64 * CHUNK;
        let mut added = 0u64;
        let first = (end - base).min(CHUNK) as usize;
        if let Some(chunk) = entry.chunks.get_mut(i) {
            if chunk.size < first {
                added += (first - chunk.size) as u64;
                chunk.size = first;
            }
        }
        if end > base + CHUNK {
            let second = (end - base - CHUNK).min(CHUNK) as usize;
            if let Some(chunk) = entry.chunks.get_mut(i + 1) {
                if chunk.size < second {
                    added += (second - chunk.size) as u64;
                    chunk.size = second;
                }
            }
        }
        entry.size = entry.size.max(end);
        self.used += added;
    }

    fn metadata_changed(&mut self, id: ObjectId) {
        self.entry_mut(id).notify();
    }

    fn set_partial(&mut self, id: ObjectId, length: Option<u64>, headers: Option<String>) {
        let entry = self.entry_mut(id);
        entry.meta.length = length;
        entry.meta.headers = headers;
        entry.flags.remove(ObjectFlags::INITIAL);
        if let Some(length) = length {
            entry.size = entry.size.min(length);
        }
        entry.notify();
    }

    fn rebind(&mut self, old: ObjectId, new: ObjectId) -> usize {
        let moved = std::mem::take(&mut self.entry_mut(old).readers);
        let target = self.entry_mut(new);
        target.readers += moved;
        target.notify();
        self.entry_mut(old).notify();
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_objects_are_shared_by_key() {
        let mut store = MemoryStore::new();
        let a = store.make_object("http://a/").unwrap();
        let b = store.make_object("http://a/").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.refcount(a), 2);
        store.release(a);
        store.release(a);
        // Public objects stay cached without references.
        assert!(store.contains(a));
        store.privatise(a);
        assert!(!store.contains(a));
    }

    #[test]
    fn private_objects_drop_on_last_release() {
        let mut store = MemoryStore::new();
        let id = store.make_private("http://a/");
        store.retain(id);
        store.release(id);
        assert!(store.contains(id));
        store.release(id);
        assert!(!store.contains(id));
    }

    #[test]
    fn add_data_spans_chunks_and_reads_back() {
        let mut store = MemoryStore::new();
        let id = store.make_object("k").unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| i as u8).collect();
        store.add_data(id, 0, &data).unwrap();
        assert_eq!(store.size(id), 6000);
        assert_eq!(store.read(id, 0, 10_000), Bytes::from(data.clone()));
        assert_eq!(store.read(id, 4090, 10), Bytes::from(data[4090..4100].to_vec()));
    }

    #[test]
    fn add_data_refuses_gaps_and_overruns() {
        let mut store = MemoryStore::new();
        let id = store.make_object("k").unwrap();
        assert_eq!(
            store.add_data(id, 10, b"x"),
            Err(StoreError::Gap { offset: 10 })
        );
        store.meta_mut(id).length = Some(4);
        assert_eq!(
            store.add_data(id, 0, b"hello"),
            Err(StoreError::PastEnd { offset: 0 })
        );
    }

    #[test]
    fn hole_size_reports_missing_ranges() {
        let mut store = MemoryStore::new();
        let id = store.make_object("k").unwrap();
        assert_eq!(store.hole_size(id, 0), None);
        store.add_data(id, 0, &[1u8; 100]).unwrap();
        assert_eq!(store.hole_size(id, 50), Some(0));
        assert_eq!(store.hole_size(id, 100), None);
        // Chunk 1 stays empty.
        store.add_data(id, 2 * CHUNK, &[1u8; 10]).unwrap();
        assert_eq!(store.hole_size(id, 100), Some(2 * CHUNK - 100));
        assert_eq!(store.hole_size(id, CHUNK), Some(CHUNK));
    }

    #[test]
    fn direct_slices_cover_two_chunks() {
        let mut store = MemoryStore::new();
        let id = store.make_object("k").unwrap();
        store.add_data(id, 0, &[0u8; 4000]).unwrap();
        let slices = store.direct_slices(id, 4000, 4000 + 200).unwrap();
        assert_eq!(slices.first.len(), 96);
        assert_eq!(slices.second.as_ref().map(|s| s.len()), Some(104));
        slices.first.fill(7);
        if let Some(second) = slices.second {
            second.fill(8);
        }
        store.commit_direct(id, 4000, 4200);
        assert_eq!(store.size(id), 4200);
        let tail = store.read(id, 4000, 200);
        assert_eq!(&tail[..96], &[7u8; 96][..]);
        assert_eq!(&tail[96..], &[8u8; 104][..]);
    }

    #[test]
    fn direct_slices_refuse_gap_in_chunk() {
        let mut store = MemoryStore::new();
        let id = store.make_object("k").unwrap();
        store.add_data(id, 0, &[0u8; 10]).unwrap();
        assert!(store.direct_slices(id, 20, 30).is_none());
    }

    #[test]
    fn locked_chunks_survive_eviction() {
        let mut store = MemoryStore::new();
        let id = store.make_object("k").unwrap();
        store.add_data(id, 0, &[1u8; 2 * CHUNK_SIZE]).unwrap();
        store.lock_chunk(id, 1);
        assert_eq!(store.evict_unlocked(id), 1);
        assert_eq!(store.chunk_locks(id, 1), 1);
        assert_eq!(store.read(id, CHUNK, 4).len(), 4);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut store = MemoryStore::with_capacity(8);
        let id = store.make_object("k").unwrap();
        store.add_data(id, 0, b"12345678").unwrap();
        assert_eq!(store.add_data(id, 8, b"9"), Err(StoreError::Exhausted));
    }

    #[test]
    fn rebind_moves_readers_and_notifies() {
        let mut store = MemoryStore::new();
        let old = store.make_object("k").unwrap();
        store.subscribe(old);
        store.subscribe(old);
        store.privatise(old);
        let new = store.make_object("k").unwrap();
        assert_ne!(old, new);
        assert_eq!(store.rebind(old, new), 2);
        assert_eq!(store.readers(new), 2);
        assert_eq!(store.readers(old), 0);
        assert_eq!(store.notifications(new), 1);
    }

    #[test]
    fn abort_records_status_and_drops_data() {
        let mut store = MemoryStore::new();
        let id = store.make_object("k").unwrap();
        store.add_data(id, 0, b"abc").unwrap();
        store.abort(id, 502, "Server dropped connection");
        let flags = store.flags(id);
        assert!(flags.contains(ObjectFlags::ABORTED));
        assert!(!flags.contains(ObjectFlags::INITIAL));
        assert_eq!(store.meta(id).code, 502);
        assert_eq!(store.size(id), 0);
        assert_eq!(store.lookup("k"), None);
    }
}
