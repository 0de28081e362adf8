//! Backing Store
//!
//! The durable page store behind the cache. The cache only needs two things
//! from it: a slot reservation for a page it is about to write back, and an
//! asynchronous write with a completion callback.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryBackingStore`] - DashMap-backed, with optional deferred
//!   completion and fault injection for tests
//! - [`FileBackingStore`] - one image file per address space, written from
//!   the tokio runtime

mod file;
mod memory;

use bytes::Bytes;
use thiserror::Error;

use crate::cache::page::{PageOffset, SpaceId};

pub use file::FileBackingStore;
pub use memory::MemoryBackingStore;

/// Reservation for one page write
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PageSlot {
    pub space: SpaceId,
    pub offset: PageOffset,
}

/// Slot reservation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    /// A write for this page is already in flight
    #[error("page slot busy")]
    Busy,

    /// The store cannot take more pages
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

/// Write failures reported through the completion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackingError {
    #[error("backing write failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackingError {
    fn from(e: std::io::Error) -> Self {
        BackingError::Io(e.to_string())
    }
}

/// Completion callback for [`BackingStore::submit_write`]
pub type WriteCompletion = Box<dyn FnOnce(Result<(), BackingError>) + Send + 'static>;

/// Backing store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackingStats {
    /// Pages currently held
    pub pages: u64,
    /// Completed writes
    pub writes: u64,
    /// Failed writes
    pub failed_writes: u64,
    /// Reservations refused because a write was pending
    pub busy: u64,
}

/// Durable page-indexed store the cache writes back to
pub trait BackingStore: Send + Sync {
    /// Reserve the slot for a page; `Busy` if a write is already pending
    fn alloc_page_slot(&self, space: SpaceId, offset: PageOffset) -> Result<PageSlot, SlotError>;

    /// Give back a reservation that will not be written
    fn release_slot(&self, slot: PageSlot);

    /// Write one page. Implementations must run `on_complete` exactly once,
    /// possibly before this call returns. A completion dropped without being
    /// run is treated as neither success nor failure: the cache keeps the
    /// entry and releases its writeback reference.
    fn submit_write(&self, slot: PageSlot, data: Bytes, on_complete: WriteCompletion);

    /// Get storage statistics
    fn stats(&self) -> BackingStats;
}
