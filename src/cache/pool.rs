//! Compressor + allocator pools
//!
//! A [`ZPool`] binds one compressor to one allocator backend. The registry
//! keeps at most one pool current; replaced pools keep serving loads for the
//! entries that still reference them and disappear once the last entry is
//! freed.
//!
//! ```text
//!   Active ──(switch away, entries remain)──► Draining ──(last ref dropped)──► Destroyed
//!     ▲                                          │
//!     └──────────(switch back to same pair)──────┘
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;

use super::alloc::{AllocatorKind, BlobAllocator, EvictionSink, Evictor, PoolId};
use super::compression::{CompGuard, CompressionAlgorithm, CompressorPool};
use crate::error::Result;

// =============================================================================
// Pool State
// =============================================================================

/// Lifecycle state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Current pool; accepts new stores
    Active,
    /// Replaced; still referenced by live entries
    Draining,
    /// Last reference dropped
    Destroyed,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Active,
            1 => PoolState::Draining,
            _ => PoolState::Destroyed,
        }
    }
}

// =============================================================================
// ZPool
// =============================================================================

/// One compressor bound to one allocator
pub struct ZPool {
    id: PoolId,
    allocator: Box<dyn BlobAllocator>,
    compressors: CompressorPool,
    state: AtomicU8,
}

impl ZPool {
    /// Create a pool whose allocator reports pressure to `sink`
    pub fn new(
        id: PoolId,
        compressor: CompressionAlgorithm,
        backend: AllocatorKind,
        page_limit: Option<usize>,
        sink: Weak<dyn EvictionSink>,
    ) -> Result<Self> {
        let compressors = CompressorPool::new(compressor)?;
        let allocator = backend.create(page_limit, Some(Evictor { pool: id, sink }));

        tracing::debug!(%id, compressor = %compressor, backend = %backend, "Created pool");

        Ok(Self {
            id,
            allocator,
            compressors,
            state: AtomicU8::new(PoolState::Active as u8),
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn compressor(&self) -> CompressionAlgorithm {
        self.compressors.algorithm()
    }

    pub fn backend(&self) -> AllocatorKind {
        self.allocator.kind()
    }

    pub fn allocator(&self) -> &dyn BlobAllocator {
        self.allocator.as_ref()
    }

    /// Acquire a compression context for this pool's algorithm
    pub fn compressor_context(&self) -> Result<CompGuard<'_>> {
        self.compressors.acquire()
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Bytes of page memory held by the allocator
    pub fn total_size(&self) -> u64 {
        self.allocator.total_size()
    }

    fn matches(&self, compressor: CompressionAlgorithm, backend: AllocatorKind) -> bool {
        self.compressor() == compressor && self.backend() == backend
    }
}

impl Drop for ZPool {
    fn drop(&mut self) {
        tracing::debug!(
            id = %self.id,
            compressor = %self.compressor(),
            backend = %self.backend(),
            "Destroyed pool"
        );
    }
}

impl std::fmt::Debug for ZPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZPool")
            .field("id", &self.id)
            .field("compressor", &self.compressor())
            .field("backend", &self.backend())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Pool Registry
// =============================================================================

/// Point-in-time description of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub id: PoolId,
    pub compressor: String,
    pub backend: String,
    pub state: PoolState,
    pub total_size: u64,
    pub blobs: usize,
}

struct PoolSlot {
    id: PoolId,
    compressor: CompressionAlgorithm,
    backend: AllocatorKind,
    pool: Weak<ZPool>,
}

#[derive(Default)]
struct RegistryInner {
    current: Option<Arc<ZPool>>,
    /// Every pool ever switched to and not yet pruned, newest first
    pools: Vec<PoolSlot>,
}

/// Owner of the current pool and index of the draining ones
pub struct PoolRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
    page_limit: Option<usize>,
    sink: Weak<dyn EvictionSink>,
}

impl PoolRegistry {
    pub fn new(page_limit: Option<usize>, sink: Weak<dyn EvictionSink>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            page_limit,
            sink,
        }
    }

    /// The pool accepting new stores
    pub fn current(&self) -> Option<Arc<ZPool>> {
        self.inner.read().current.clone()
    }

    /// Make the (compressor, backend) pair current.
    ///
    /// A still-live pool with the same pair is revived rather than rebuilt.
    /// On failure the previous pool stays current.
    pub fn switch(&self, compressor: CompressionAlgorithm, backend: AllocatorKind) -> Result<Arc<ZPool>> {
        let mut inner = self.inner.write();

        if let Some(current) = inner.current.as_ref() {
            if current.matches(compressor, backend) {
                return Ok(current.clone());
            }
        }

        let existing = inner.pools.iter().position(|slot| {
            slot.compressor == compressor && slot.backend == backend && slot.pool.strong_count() > 0
        });

        let pool = match existing.and_then(|i| inner.pools[i].pool.upgrade().map(|p| (i, p))) {
            Some((index, pool)) => {
                tracing::info!(id = %pool.id(), %compressor, %backend, "Reusing draining pool");
                let slot = inner.pools.remove(index);
                inner.pools.insert(0, slot);
                pool
            }
            None => {
                let id = PoolId(self.next_id.fetch_add(1, Ordering::Relaxed));
                let pool = Arc::new(ZPool::new(
                    id,
                    compressor,
                    backend,
                    self.page_limit,
                    self.sink.clone(),
                )?);
                inner.pools.insert(
                    0,
                    PoolSlot {
                        id,
                        compressor,
                        backend,
                        pool: Arc::downgrade(&pool),
                    },
                );
                pool
            }
        };

        pool.set_state(PoolState::Active);
        let previous = inner.current.replace(pool.clone());
        if let Some(previous) = previous.as_ref() {
            previous.set_state(PoolState::Draining);
            tracing::info!(
                from = %previous.id(),
                to = %pool.id(),
                %compressor,
                %backend,
                "Switched current pool"
            );
        }

        inner.pools.retain(|slot| slot.pool.strong_count() > 0 || slot.id == pool.id());
        drop(inner);
        drop(previous);

        Ok(pool)
    }

    /// Oldest live pool; reclaim starts here
    pub fn oldest(&self) -> Option<Arc<ZPool>> {
        self.inner
            .read()
            .pools
            .iter()
            .rev()
            .find_map(|slot| slot.pool.upgrade())
    }

    /// Total page memory across every live pool
    pub fn total_size(&self) -> u64 {
        self.inner
            .read()
            .pools
            .iter()
            .filter_map(|slot| slot.pool.upgrade())
            .map(|pool| pool.total_size())
            .sum()
    }

    /// Describe every pool the registry still tracks, newest first
    pub fn pool_infos(&self) -> Vec<PoolInfo> {
        self.inner
            .read()
            .pools
            .iter()
            .map(|slot| match slot.pool.upgrade() {
                Some(pool) => PoolInfo {
                    id: slot.id,
                    compressor: slot.compressor.name().to_string(),
                    backend: slot.backend.name().to_string(),
                    state: pool.state(),
                    total_size: pool.total_size(),
                    blobs: pool.allocator().blob_count(),
                },
                None => PoolInfo {
                    id: slot.id,
                    compressor: slot.compressor.name().to_string(),
                    backend: slot.backend.name().to_string(),
                    state: PoolState::Destroyed,
                    total_size: 0,
                    blobs: 0,
                },
            })
            .collect()
    }
}
