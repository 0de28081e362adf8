//! Cache entries
//!
//! A [`ZEntry`] is the cached form of one page. Its reference count is only
//! ever changed while the owning store's lock is held; the atomic type is
//! there so pinned entries can be shared across threads without `unsafe`.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::alloc::BlobHandle;
use super::page::{PageOffset, Word, PAGE_SIZE};
use super::pool::ZPool;

// =============================================================================
// Stored Blob
// =============================================================================

/// One allocator blob, possibly shared by several entries
pub struct StoredBlob {
    /// Pool the blob was allocated from; kept alive by this reference
    pool: Arc<ZPool>,
    handle: BlobHandle,
    /// Payload length after the header; `PAGE_SIZE` means stored uncompressed
    length: usize,
    /// Content checksum when the blob is in the dedup index
    checksum: Option<u64>,
    /// Entries pointing at this blob
    refs: AtomicU32,
}

impl StoredBlob {
    pub fn new(pool: Arc<ZPool>, handle: BlobHandle, length: usize, checksum: Option<u64>) -> Self {
        Self {
            pool,
            handle,
            length,
            checksum,
            refs: AtomicU32::new(1),
        }
    }

    pub fn pool(&self) -> &Arc<ZPool> {
        &self.pool
    }

    pub fn handle(&self) -> BlobHandle {
        self.handle
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Payload holds the raw page rather than compressed bytes
    pub fn is_literal(&self) -> bool {
        self.length >= PAGE_SIZE
    }

    pub fn checksum(&self) -> Option<u64> {
        self.checksum
    }

    /// Number of entries sharing this blob
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    pub(crate) fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn drop_ref(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

impl fmt::Debug for StoredBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredBlob")
            .field("pool", &self.pool.id())
            .field("handle", &self.handle)
            .field("length", &self.length)
            .field("refs", &self.refs())
            .finish()
    }
}

// =============================================================================
// Entry
// =============================================================================

/// Cached representation of a page
#[derive(Debug, Clone)]
pub enum Payload {
    /// Page is one repeated non-zero word
    SameFilled(Word),
    /// Page is all zero
    ZeroFilled,
    /// Page lives in an allocator blob
    Compressed(Arc<StoredBlob>),
}

/// Reference-counted cache entry
#[derive(Debug)]
pub struct ZEntry {
    offset: PageOffset,
    refcount: AtomicU32,
    payload: Payload,
}

impl ZEntry {
    /// New entry holding the map's initial reference
    pub fn new(offset: PageOffset, payload: Payload) -> Self {
        Self {
            offset,
            refcount: AtomicU32::new(1),
            payload,
        }
    }

    pub fn offset(&self) -> PageOffset {
        self.offset
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Stored payload length; zero for same-value pages
    pub fn length(&self) -> usize {
        match &self.payload {
            Payload::SameFilled(_) | Payload::ZeroFilled => 0,
            Payload::Compressed(blob) => blob.length(),
        }
    }

    pub fn blob(&self) -> Option<&Arc<StoredBlob>> {
        match &self.payload {
            Payload::Compressed(blob) => Some(blob),
            _ => None,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub(crate) fn get(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; returns the remaining count
    pub(crate) fn put(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "entry refcount underflow at offset {}", self.offset);
        prev.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_value_entries_have_zero_length() {
        let same = ZEntry::new(3, Payload::SameFilled(0xabab));
        assert_eq!(same.length(), 0);
        assert!(same.blob().is_none());

        let zero = ZEntry::new(4, Payload::ZeroFilled);
        assert_eq!(zero.length(), 0);
        assert_eq!(zero.offset(), 4);
    }

    #[test]
    fn test_entry_refcount() {
        let entry = ZEntry::new(1, Payload::ZeroFilled);
        assert_eq!(entry.refcount(), 1);
        entry.get();
        assert_eq!(entry.refcount(), 2);
        assert_eq!(entry.put(), 1);
        assert_eq!(entry.put(), 0);
    }
}
