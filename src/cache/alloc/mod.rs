//! Backend Allocator Pool
//!
//! Variable-size allocators for compressed blobs. Blobs are packed into page
//! frames and addressed through opaque [`BlobHandle`]s. Two backends are
//! registered by name:
//!
//! - `zsmalloc` - size classes in 16-byte steps, multi-page spans
//! - `zbud` - at most two blobs (first/last buddy) per page
//!
//! # Eviction Hook
//!
//! ```text
//!   alloc() over page limit          shrink(n)
//!            │                           │
//!            └──────────┬────────────────┘
//!                       ▼
//!        pick LRU unit, mark under reclaim
//!                       │   (allocator lock released)
//!                       ▼
//!        EvictionSink::evict(pool, allocator, handle)  ──►  free(handle)
//!                       │
//!                       ▼
//!        unit empty? release pages : rotate to MRU
//! ```
//!
//! A unit under reclaim is never released by `free()`; the shrinker releases
//! it once every handle in it has been written back.

mod zbud;
mod zsmalloc;

use std::ops::{Deref, DerefMut, Range};
use std::sync::{Arc, Weak};

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::page::PAGE_SIZE;

pub use zbud::ZbudAllocator;
pub use zsmalloc::ZsmallocAllocator;

/// Units examined per shrink request before giving up
pub const MAX_RECLAIM_RETRIES: usize = 8;

// =============================================================================
// Handles and Errors
// =============================================================================

/// Opaque reference to one allocated blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHandle(pub(crate) u64);

impl BlobHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Identity of a compressor+allocator pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub u64);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Allocator failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free space and reclaim could not make room
    #[error("allocator out of memory")]
    NoMemory,

    /// Blob exceeds the largest size the backend can hold
    #[error("blob of {0} bytes exceeds backend limit")]
    TooLarge(usize),

    /// Shrink requested but no eviction sink is attached
    #[error("no eviction handler registered")]
    NoEvictor,

    /// Shrink could not evict anything
    #[error("reclaim made no progress")]
    ReclaimFailed,
}

// =============================================================================
// Eviction Hook
// =============================================================================

/// Result of one eviction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Content handed to the backing store; the blob will be freed
    Evicted,
    /// Handle not evictable right now
    Skipped,
}

/// Callback the allocator invokes to move a blob's content elsewhere
pub trait EvictionSink: Send + Sync {
    fn evict(&self, pool: PoolId, allocator: &dyn BlobAllocator, handle: BlobHandle) -> EvictOutcome;
}

/// Registration of an eviction sink with an allocator
#[derive(Clone)]
pub struct Evictor {
    /// Pool identity passed back to the sink
    pub pool: PoolId,
    /// Non-owning reference to the sink
    pub sink: Weak<dyn EvictionSink>,
}

impl std::fmt::Debug for Evictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evictor").field("pool", &self.pool).finish()
    }
}

// =============================================================================
// Mapped Blobs
// =============================================================================

/// Backing memory for one allocator unit
pub(crate) type Frame = Arc<RwLock<Box<[u8]>>>;

pub(crate) fn new_frame(pages: usize) -> Frame {
    Arc::new(RwLock::new(vec![0u8; pages * PAGE_SIZE].into_boxed_slice()))
}

/// Read-only view of a blob; keeps the frame alive while held
pub struct MappedBlob {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    range: Range<usize>,
}

impl MappedBlob {
    pub(crate) fn new(frame: &Frame, range: Range<usize>) -> Self {
        Self {
            guard: frame.read_arc(),
            range,
        }
    }
}

impl Deref for MappedBlob {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[self.range.clone()]
    }
}

/// Writable view of a blob
pub struct MappedBlobMut {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    range: Range<usize>,
}

impl MappedBlobMut {
    pub(crate) fn new(frame: &Frame, range: Range<usize>) -> Self {
        Self {
            guard: frame.write_arc(),
            range,
        }
    }
}

impl Deref for MappedBlobMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[self.range.clone()]
    }
}

impl DerefMut for MappedBlobMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[self.range.clone()]
    }
}

// =============================================================================
// Allocator Trait
// =============================================================================

/// Blob allocator contract
pub trait BlobAllocator: Send + Sync {
    /// Backend identifier
    fn kind(&self) -> AllocatorKind;

    /// Allocate a blob of `size` bytes
    fn alloc(&self, size: usize) -> Result<BlobHandle, AllocError>;

    /// Release a blob; unknown handles are ignored
    fn free(&self, handle: BlobHandle);

    /// Map a blob for reading
    fn map(&self, handle: BlobHandle) -> Option<MappedBlob>;

    /// Map a blob for writing
    fn map_mut(&self, handle: BlobHandle) -> Option<MappedBlobMut>;

    /// Evict content until `pages` pages are released or retries run out.
    ///
    /// Returns the number of pages released; `Ok(0)` means blobs were handed
    /// to the sink but their pages are not free yet.
    fn shrink(&self, pages: usize) -> Result<usize, AllocError>;

    /// Bytes of page memory currently held
    fn total_size(&self) -> u64;

    /// Number of live blobs
    fn blob_count(&self) -> usize;
}

/// Registered allocator backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    Zsmalloc,
    Zbud,
}

impl AllocatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            AllocatorKind::Zsmalloc => "zsmalloc",
            AllocatorKind::Zbud => "zbud",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::available_backends()
            .into_iter()
            .find(|kind| kind.name() == name.trim())
    }

    pub fn available_backends() -> Vec<Self> {
        vec![Self::Zsmalloc, Self::Zbud]
    }

    /// Build an allocator of this kind
    pub fn create(&self, max_pages: Option<usize>, evictor: Option<Evictor>) -> Box<dyn BlobAllocator> {
        match self {
            AllocatorKind::Zsmalloc => Box::new(ZsmallocAllocator::new(max_pages, evictor)),
            AllocatorKind::Zbud => Box::new(ZbudAllocator::new(max_pages, evictor)),
        }
    }
}

impl Default for AllocatorKind {
    fn default() -> Self {
        AllocatorKind::Zsmalloc
    }
}

impl std::fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Shared Reclaim Driver
// =============================================================================

/// Unit bookkeeping a backend exposes to the shared shrink loop
pub(crate) trait ReclaimUnits {
    /// Mark the least recently used unit not already under reclaim and
    /// return its id with the handles it holds.
    fn begin_reclaim(&self) -> Option<(u64, Vec<BlobHandle>)>;

    /// Clear the mark. Releases the unit if empty and returns the pages freed,
    /// otherwise rotates it to the most recently used position.
    fn end_reclaim(&self, unit: u64) -> usize;
}

pub(crate) fn shrink_units<A>(
    allocator: &A,
    evictor: Option<&Evictor>,
    pages: usize,
) -> Result<usize, AllocError>
where
    A: BlobAllocator + ReclaimUnits,
{
    let evictor = evictor.ok_or(AllocError::NoEvictor)?;
    let sink = evictor.sink.upgrade().ok_or(AllocError::NoEvictor)?;

    let mut released = 0;
    let mut evicted = 0;

    for _ in 0..MAX_RECLAIM_RETRIES {
        if released >= pages {
            break;
        }

        let Some((unit, handles)) = allocator.begin_reclaim() else {
            break;
        };

        for handle in handles {
            if sink.evict(evictor.pool, allocator, handle) == EvictOutcome::Evicted {
                evicted += 1;
            }
        }

        released += allocator.end_reclaim(unit);
    }

    tracing::debug!(
        pool = %evictor.pool,
        backend = %allocator.kind(),
        evicted,
        released,
        "Shrink pass finished"
    );

    if released == 0 && evicted == 0 {
        Err(AllocError::ReclaimFailed)
    } else {
        Ok(released)
    }
}

/// Allocation wrapper that runs one shrink pass when the page limit is hit
pub(crate) fn alloc_with_reclaim<A, F>(allocator: &A, mut try_alloc: F) -> Result<BlobHandle, AllocError>
where
    A: BlobAllocator,
    F: FnMut() -> Result<BlobHandle, AllocError>,
{
    match try_alloc() {
        Err(AllocError::NoMemory) => {
            allocator.shrink(1).map_err(|_| AllocError::NoMemory)?;
            try_alloc()
        }
        other => other,
    }
}
