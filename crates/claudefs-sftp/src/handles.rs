//! Open file and directory handles for one connection

use std::fs::{File, ReadDir};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SftpError};

/// Wire length of every handle this server issues.
pub const HANDLE_LEN: usize = 8;

/// What a handle refers to.
pub enum HandleObject {
    /// An open regular file
    File {
        /// The file
        file: File,
        /// Path it was opened with
        path: PathBuf,
    },
    /// A directory being listed
    Dir {
        /// Path it was opened with
        path: PathBuf,
        /// Remaining entries
        entries: ReadDir,
    },
}

impl HandleObject {
    /// Path the handle was opened with.
    pub fn path(&self) -> &PathBuf {
        match self {
            HandleObject::File { path, .. } | HandleObject::Dir { path, .. } => path,
        }
    }
}

/// Shared reference to an open handle.
pub type HandleRef = Arc<Mutex<HandleObject>>;

/// Per-connection handle table.
///
/// Handles are `u32 slot || u32 tag`; the tag is random per connection so
/// handles from a previous server process are rejected.
pub struct HandleTable {
    tag: u32,
    next_slot: AtomicU32,
    objects: DashMap<u32, HandleRef>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::with_tag(rand::random())
    }

    pub fn with_tag(tag: u32) -> Self {
        Self {
            tag,
            next_slot: AtomicU32::new(1),
            objects: DashMap::new(),
        }
    }

    /// Stores `object` and returns its wire handle.
    pub fn insert(&self, object: HandleObject) -> Bytes {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        debug!(slot, path = %object.path().display(), "handle opened");
        self.objects.insert(slot, Arc::new(Mutex::new(object)));
        let mut handle = BytesMut::with_capacity(HANDLE_LEN);
        handle.put_u32(slot);
        handle.put_u32(self.tag);
        handle.freeze()
    }

    fn slot(&self, handle: &[u8]) -> Result<u32> {
        if handle.len() != HANDLE_LEN {
            return Err(SftpError::InvalidHandle);
        }
        let slot = u32::from_be_bytes([handle[0], handle[1], handle[2], handle[3]]);
        let tag = u32::from_be_bytes([handle[4], handle[5], handle[6], handle[7]]);
        if tag != self.tag {
            return Err(SftpError::InvalidHandle);
        }
        Ok(slot)
    }

    /// Looks up an open handle.
    pub fn get(&self, handle: &[u8]) -> Result<HandleRef> {
        let slot = self.slot(handle)?;
        self.objects
            .get(&slot)
            .map(|o| Arc::clone(o.value()))
            .ok_or(SftpError::InvalidHandle)
    }

    /// Removes a handle. The underlying file closes once the last
    /// in-flight user drops its reference.
    pub fn remove(&self, handle: &[u8]) -> Result<HandleRef> {
        let slot = self.slot(handle)?;
        let (_, object) = self.objects.remove(&slot).ok_or(SftpError::InvalidHandle)?;
        debug!(slot, "handle closed");
        Ok(object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
