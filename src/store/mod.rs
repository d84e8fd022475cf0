//! Cache object store seam.
//!
//! # Data Flow
//! ```text
//! upstream engine
//!     → ObjectStore (retain/release, metadata, flags)
//!     → add_data (indirect: bytes copied from a scratch buffer)
//!     → lock_chunk + direct_slices + commit_direct (direct: socket reads land in chunks)
//!     → notify (fans out to readers waiting on the object)
//! ```
//!
//! # Design Decisions
//! - Objects are addressed by `ObjectId` handles; the engine owns one
//!   reference per in-flight request and releases it exactly once
//! - Accessors panic on a released handle, like slice indexing; the engine
//!   only touches objects it holds a reference to
//! - Supersession hand-off is an explicit `rebind(old, new)` call

pub mod memory;

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

use crate::http::cache_control::CacheFlags;

pub use memory::MemoryStore;

/// Size of one storage chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Handle on a cache object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u64);

impl ObjectId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Object state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ObjectFlags(u16);

impl ObjectFlags {
    pub const NONE: Self = Self(0);
    /// Never fetched: no metadata yet.
    pub const INITIAL: Self = Self(1 << 0);
    /// A fetch is in flight.
    pub const INPROGRESS: Self = Self(1 << 1);
    /// The in-flight fetch is a revalidation.
    pub const VALIDATING: Self = Self(1 << 2);
    /// Content changes too often to be worth caching.
    pub const DYNAMIC: Self = Self(1 << 3);
    /// Being handed off to a superseding object.
    pub const MUTATING: Self = Self(1 << 4);
    /// Last fetch failed.
    pub const FAILED: Self = Self(1 << 5);
    /// Aborted; metadata holds the error status.
    pub const ABORTED: Self = Self(1 << 6);
    /// Must be read front to back.
    pub const LINEAR: Self = Self(1 << 7);
    /// Served locally, never fetched.
    pub const LOCAL: Self = Self(1 << 8);
    /// Replaced by a newer object under the same key.
    pub const SUPERSEDED: Self = Self(1 << 9);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for ObjectFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Reply metadata kept with an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub code: u16,
    pub message: String,
    /// Full entity length, when known.
    pub length: Option<u64>,
    pub date: Option<SystemTime>,
    pub last_modified: Option<SystemTime>,
    pub expires: Option<SystemTime>,
    /// Time the representation was generated (dispatch time minus `Age`).
    pub age: Option<SystemTime>,
    pub etag: Option<String>,
    pub cache_control: CacheFlags,
    pub max_age: Option<u32>,
    pub s_maxage: Option<u32>,
    /// `Via` value to hand to clients.
    pub via: Option<String>,
    /// End-to-end headers, one `Name: value\r\n` line each.
    pub headers: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("object store exhausted")]
    Exhausted,
    #[error("write at {offset} would leave a gap")]
    Gap { offset: u64 },
    #[error("write past end of object at {offset}")]
    PastEnd { offset: u64 },
}

/// Chunk memory a direct read lands in: the tail of chunk `i` and
/// optionally the head of chunk `i + 1`.
pub struct DirectSlices<'a> {
    pub first: &'a mut [u8],
    pub second: Option<&'a mut [u8]>,
}

impl DirectSlices<'_> {
    pub fn len(&self) -> usize {
        self.first.len() + self.second.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Operations the engine consumes from the cache.
pub trait ObjectStore {
    fn key(&self, id: ObjectId) -> &str;
    fn flags(&self, id: ObjectId) -> ObjectFlags;
    fn set_flags(&mut self, id: ObjectId, flags: ObjectFlags);
    fn clear_flags(&mut self, id: ObjectId, flags: ObjectFlags);
    fn meta(&self, id: ObjectId) -> &ObjectMeta;
    fn meta_mut(&mut self, id: ObjectId) -> &mut ObjectMeta;
    /// Highest byte offset stored so far.
    fn size(&self, id: ObjectId) -> u64;

    fn retain(&mut self, id: ObjectId);
    fn release(&mut self, id: ObjectId);
    /// Wake readers waiting on new data or metadata.
    fn notify(&mut self, id: ObjectId);

    /// Public object for `key`, created if absent. The caller owns one reference.
    fn make_object(&mut self, key: &str) -> Result<ObjectId, StoreError>;
    /// Remove from the public index; existing references stay valid.
    fn privatise(&mut self, id: ObjectId);
    fn supersede(&mut self, id: ObjectId);
    /// Drop contents and record an error status.
    fn abort(&mut self, id: ObjectId, status: u16, message: &str);

    /// Page in stored data starting at `offset`.
    fn fill_from_disk(&mut self, id: ObjectId, offset: u64);
    /// `Some(0)` when data is present at `offset`, `Some(n)` for a hole of
    /// `n` bytes followed by data, `None` when the hole runs to the end.
    fn hole_size(&self, id: ObjectId, offset: u64) -> Option<u64>;
    fn add_data(&mut self, id: ObjectId, offset: u64, data: &[u8]) -> Result<(), StoreError>;

    fn lock_chunk(&mut self, id: ObjectId, index: usize);
    fn unlock_chunk(&mut self, id: ObjectId, index: usize);
    /// Writable chunk memory covering `[offset, end)`, or `None` when chunk
    /// `offset / CHUNK_SIZE` holds fewer than `offset % CHUNK_SIZE` bytes.
    fn direct_slices(&mut self, id: ObjectId, offset: u64, end: u64) -> Option<DirectSlices<'_>>;
    /// Mark `[offset, end)` as filled after a direct read.
    fn commit_direct(&mut self, id: ObjectId, offset: u64, end: u64);

    fn metadata_changed(&mut self, id: ObjectId);
    /// First reply for an initial object: record length and headers.
    fn set_partial(&mut self, id: ObjectId, length: Option<u64>, headers: Option<String>);
    /// Move readers of `old` onto `new`; returns how many moved.
    fn rebind(&mut self, old: ObjectId, new: ObjectId) -> usize;
}
