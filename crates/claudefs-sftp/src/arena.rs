//! Per-job bump arena.
//!
//! Handlers carve reply and data buffers out of a shared chunk instead of
//! allocating per buffer. Everything carved from an arena is released
//! together once the job and the last buffer referencing a chunk are gone.

use std::cell::{Cell, RefCell};

use bytes::{Bytes, BytesMut};

/// Default chunk size for a job arena.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Bump-style allocation scope bound to one job.
///
/// Not `Sync`: an arena belongs to the single thread executing its job.
pub struct JobArena {
    chunk: RefCell<BytesMut>,
    chunk_size: usize,
    allocated: Cell<usize>,
    allocations: Cell<usize>,
}

impl JobArena {
    /// Creates an arena with the default chunk size.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Creates an arena whose chunks are at least `chunk_size` bytes.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(64);
        Self {
            chunk: RefCell::new(BytesMut::new()),
            chunk_size,
            allocated: Cell::new(0),
            allocations: Cell::new(0),
        }
    }

    fn carve(&self, len: usize) -> BytesMut {
        let mut chunk = self.chunk.borrow_mut();
        if chunk.capacity() < len {
            *chunk = BytesMut::with_capacity(self.chunk_size.max(len));
        }
        chunk.resize(len, 0);
        self.allocated.set(self.allocated.get() + len);
        self.allocations.set(self.allocations.get() + 1);
        chunk.split_to(len)
    }

    /// Allocates `len` zeroed bytes.
    pub fn alloc(&self, len: usize) -> BytesMut {
        self.carve(len)
    }

    /// Allocates an empty buffer with room for `capacity` bytes.
    pub fn buffer(&self, capacity: usize) -> BytesMut {
        let mut buf = self.carve(capacity);
        buf.clear();
        buf
    }

    /// Copies `data` into the arena.
    pub fn copy(&self, data: &[u8]) -> Bytes {
        let mut buf = self.carve(data.len());
        buf.copy_from_slice(data);
        buf.freeze()
    }

    /// Total bytes handed out by this arena.
    pub fn bytes_allocated(&self) -> usize {
        self.allocated.get()
    }

    /// Number of allocations served.
    pub fn allocations(&self) -> usize {
        self.allocations.get()
    }
}

impl Default for JobArena {
    fn default() -> Self {
        Self::new()
    }
}
