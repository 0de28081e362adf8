//! Cache Controller
//!
//! [`ZCache`] is the interface the fault handler talks to. It owns the map of
//! address spaces, the pool registry, the writeback sink and the statistics.
//!
//! # Store
//!
//! ```text
//!   page checks ─► space / poison checks ─► fullness (one reclaim pass)
//!        │
//!        ├─► same-value page ───────────────────────────► SameFilled / ZeroFilled
//!        ├─► dedup hit (checksum + byte compare) ───────► shared blob
//!        └─► compress ─► alloc(header + data) ─► copy ──► Compressed
//!                                                              │
//!                                                   insert_or_replace
//! ```
//!
//! Rejections are returned to the caller, which writes the page to the
//! backing store itself. A rejected overwrite drops the previous entry at
//! that offset, so a later load misses instead of returning old data.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use super::alloc::{AllocError, AllocatorKind, EvictionSink};
use super::compression::CompressionAlgorithm;
use super::entry::{Payload, StoredBlob, ZEntry};
use super::metrics::{CacheStats, StatsSnapshot};
use super::page::{
    checksum, fill_page, hex_preview, is_zero_filled, same_filled_value, BlobHeader, PageOffset,
    SpaceId, HEADER_LEN, PAGE_SIZE,
};
use super::pool::{PoolInfo, PoolRegistry, ZPool};
use super::store::EntryStore;
use super::writeback::Writeback;
use crate::backing::BackingStore;
use crate::config::{check_pool_percent, CacheConfig, DEFAULT_ALLOCATOR, FALLBACK_COMPRESSOR};
use crate::error::{Error, Result};

// =============================================================================
// Outcomes
// =============================================================================

/// Why a page was not cached
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    #[error("cache disabled or address space not initialised")]
    NotAvailable,

    #[error("buffer is not exactly one page")]
    InvalidPage,

    #[error("composite pages are not cached")]
    HugePage,

    #[error("page was marked unrecoverable")]
    PermanentFailure,

    #[error("pool limit reached")]
    PoolFull,

    #[error("allocator out of memory")]
    AllocFailure,

    #[error("page too large for the allocator after compression")]
    CompressPoor,
}

impl RejectReason {
    pub const COUNT: usize = 7;

    pub fn all() -> &'static [RejectReason] {
        &[
            RejectReason::NotAvailable,
            RejectReason::InvalidPage,
            RejectReason::HugePage,
            RejectReason::PermanentFailure,
            RejectReason::PoolFull,
            RejectReason::AllocFailure,
            RejectReason::CompressPoor,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            RejectReason::NotAvailable => "not_available",
            RejectReason::InvalidPage => "invalid_page",
            RejectReason::HugePage => "huge_page",
            RejectReason::PermanentFailure => "permanent_failure",
            RejectReason::PoolFull => "pool_full",
            RejectReason::AllocFailure => "alloc_failure",
            RejectReason::CompressPoor => "compress_poor",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

/// Result of a successful load call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Page copied into the destination
    Found,
    /// Not cached; read the backing store
    NotFound,
}

/// Load failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("destination buffer is {0} bytes, expected one page")]
    InvalidBuffer(usize),

    /// Entry did not decompress to exactly one page; the page is lost
    #[error("cached page {space}:{offset} is corrupted")]
    Corrupted { space: SpaceId, offset: PageOffset },
}

// =============================================================================
// ZCache
// =============================================================================

/// Compressed write-back page cache
pub struct ZCache {
    spaces: Arc<DashMap<SpaceId, Arc<EntryStore>>>,
    pools: PoolRegistry,
    /// Kept alive for the allocators' weak eviction hooks
    _writeback: Arc<Writeback>,
    stats: Arc<CacheStats>,
    total_memory_pages: u64,
    page_limit: Option<usize>,
    enabled: AtomicBool,
    max_pool_percent: AtomicU8,
    same_value_enabled: AtomicBool,
    content_dedup_enabled: AtomicBool,
    /// Serialises compressor / backend switches
    switch_lock: Mutex<()>,
}

impl ZCache {
    /// Build a cache in front of `backing`.
    ///
    /// Unknown compressor or allocator names fall back to `lz4` / `zsmalloc`
    /// with a warning; construction fails only if no pool can be built.
    pub fn new(config: CacheConfig, backing: Arc<dyn BackingStore>) -> Result<Self> {
        check_pool_percent(config.max_pool_percent)?;
        let total_memory = config.resolve_total_memory();
        if total_memory == 0 {
            return Err(Error::Config("total memory size is zero".into()));
        }

        let compressor = config.compression_algorithm().unwrap_or_else(|e| {
            tracing::warn!(error = %e, fallback = FALLBACK_COMPRESSOR, "Using fallback compressor");
            CompressionAlgorithm::Lz4
        });
        let backend = config.allocator_kind().unwrap_or_else(|e| {
            tracing::warn!(error = %e, fallback = DEFAULT_ALLOCATOR, "Using default allocator");
            AllocatorKind::Zsmalloc
        });

        let spaces = Arc::new(DashMap::new());
        let stats = Arc::new(CacheStats::new());
        let writeback = Arc::new(Writeback::new(spaces.clone(), backing, stats.clone()));
        let sink: Arc<dyn EvictionSink> = writeback.clone();
        let pools = PoolRegistry::new(config.allocator_page_limit, Arc::downgrade(&sink));

        if let Err(e) = pools.switch(compressor, backend) {
            let fallback = (CompressionAlgorithm::Lz4, AllocatorKind::Zsmalloc);
            if (compressor, backend) == fallback {
                return Err(Error::PoolUnavailable(e.to_string()));
            }
            tracing::warn!(error = %e, "Pool creation failed, trying lz4/zsmalloc");
            pools
                .switch(fallback.0, fallback.1)
                .map_err(|e| Error::PoolUnavailable(e.to_string()))?;
        }

        tracing::info!(
            compressor = %compressor,
            backend = %backend,
            max_pool_percent = config.max_pool_percent,
            total_memory,
            enabled = config.enabled,
            "Compressed page cache initialized"
        );

        Ok(Self {
            spaces,
            pools,
            _writeback: writeback,
            stats,
            total_memory_pages: total_memory / PAGE_SIZE as u64,
            page_limit: config.allocator_page_limit,
            enabled: AtomicBool::new(config.enabled),
            max_pool_percent: AtomicU8::new(config.max_pool_percent),
            same_value_enabled: AtomicBool::new(config.same_value_dedup_enabled),
            content_dedup_enabled: AtomicBool::new(config.content_dedup_enabled),
            switch_lock: Mutex::new(()),
        })
    }

    fn space_store(&self, space: SpaceId) -> Option<Arc<EntryStore>> {
        self.spaces.get(&space).map(|store| Arc::clone(store.value()))
    }

    // =========================================================================
    // Address Spaces
    // =========================================================================

    /// Create the entry store for an address space; no-op if it exists
    pub fn init_space(&self, space: SpaceId) {
        self.spaces.entry(space).or_insert_with(|| {
            tracing::debug!(%space, "Initialized address space");
            Arc::new(EntryStore::new(space, self.stats.clone()))
        });
    }

    /// Drop every entry of an address space and forget the space
    pub fn invalidate_area(&self, space: SpaceId) {
        if let Some((_, store)) = self.spaces.remove(&space) {
            let dropped = store.drain();
            tracing::debug!(%space, dropped, "Invalidated address space");
        }
        self.refresh_pool_total();
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Cache one page
    pub fn store(&self, space: SpaceId, offset: PageOffset, page: &[u8]) -> std::result::Result<(), RejectReason> {
        let result = self.try_store(space, offset, page);
        if let Err(reason) = result {
            self.stats.record_reject(reason);
        }
        self.refresh_pool_total();
        result
    }

    fn try_store(&self, space: SpaceId, offset: PageOffset, page: &[u8]) -> std::result::Result<(), RejectReason> {
        if page.len() != PAGE_SIZE {
            return Err(if page.len() > PAGE_SIZE && page.len() % PAGE_SIZE == 0 {
                RejectReason::HugePage
            } else {
                RejectReason::InvalidPage
            });
        }

        if !self.enabled.load(Ordering::Relaxed) {
            return Err(RejectReason::NotAvailable);
        }
        let store = self.space_store(space).ok_or(RejectReason::NotAvailable)?;

        if store.is_poisoned(offset) {
            return Err(RejectReason::PermanentFailure);
        }

        let result = self.store_page(&store, space, offset, page);
        if result.is_err() && store.discard(offset) {
            // Caller falls back to the backing store; the old copy is stale
            tracing::debug!(%space, offset, "Dropped previous entry after rejected overwrite");
        }
        result
    }

    fn store_page(
        &self,
        store: &EntryStore,
        space: SpaceId,
        offset: PageOffset,
        page: &[u8],
    ) -> std::result::Result<(), RejectReason> {
        if self.is_full() {
            self.stats.record_pool_limit_hit();
            if let Err(e) = self.reclaim_once() {
                tracing::debug!(%space, offset, error = %e, "Reclaim failed");
                self.stats.record_reclaim_fail();
                return Err(RejectReason::PoolFull);
            }
            if self.is_full() {
                return Err(RejectReason::PoolFull);
            }
        }

        if let Some(payload) = self.same_value_payload(page) {
            store.insert_or_replace(Arc::new(ZEntry::new(offset, payload)));
            return Ok(());
        }

        let sum = if self.content_dedup_enabled.load(Ordering::Relaxed) {
            let sum = checksum(page);
            if self.store_duplicate(store, offset, sum, page) {
                return Ok(());
            }
            Some(sum)
        } else {
            None
        };

        let pool = self.pools.current().ok_or(RejectReason::NotAvailable)?;
        let blob = self.compress_and_alloc(&pool, space, offset, page, sum)?;
        store.insert_or_replace(Arc::new(ZEntry::new(offset, Payload::Compressed(blob))));
        Ok(())
    }

    fn same_value_payload(&self, page: &[u8]) -> Option<Payload> {
        if self.same_value_enabled.load(Ordering::Relaxed) {
            return match same_filled_value(page)? {
                0 => Some(Payload::ZeroFilled),
                value => Some(Payload::SameFilled(value)),
            };
        }
        is_zero_filled(page).then_some(Payload::ZeroFilled)
    }

    /// Share an existing blob with identical content, if there is one
    fn store_duplicate(&self, store: &EntryStore, offset: PageOffset, sum: u64, page: &[u8]) -> bool {
        store
            .dedup_candidates(sum)
            .iter()
            .any(|candidate| self.blob_matches(candidate, page) && store.insert_shared(offset, candidate))
    }

    fn blob_matches(&self, blob: &StoredBlob, page: &[u8]) -> bool {
        let Some(mapped) = blob.pool().allocator().map(blob.handle()) else {
            return false;
        };
        let payload = &mapped[HEADER_LEN..HEADER_LEN + blob.length()];
        if blob.is_literal() {
            return payload == page;
        }
        let Ok(mut ctx) = blob.pool().compressor_context() else {
            return false;
        };
        matches!(ctx.decompress_scratch(payload), Ok(content) if content == page)
    }

    fn compress_and_alloc(
        &self,
        pool: &Arc<ZPool>,
        space: SpaceId,
        offset: PageOffset,
        page: &[u8],
        sum: Option<u64>,
    ) -> std::result::Result<Arc<StoredBlob>, RejectReason> {
        let mut ctx = match pool.compressor_context() {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                tracing::warn!(pool = %pool.id(), error = %e, "No compressor context, storing page uncompressed");
                self.stats.record_compress_fail();
                None
            }
        };

        let compressed = match ctx.as_mut().map(|ctx| ctx.compress(page)) {
            Some(Ok(data)) if data.len() < PAGE_SIZE => Some(data),
            Some(Ok(_)) | None => None,
            Some(Err(e)) => {
                tracing::warn!(pool = %pool.id(), error = %e, "Compression failed, storing page uncompressed");
                self.stats.record_compress_fail();
                None
            }
        };
        let data = compressed.unwrap_or(page);

        let allocator = pool.allocator();
        let handle = allocator
            .alloc(HEADER_LEN + data.len())
            .map_err(|e| match e {
                AllocError::TooLarge(_) => RejectReason::CompressPoor,
                _ => RejectReason::AllocFailure,
            })?;

        let Some(mut blob) = allocator.map_mut(handle) else {
            allocator.free(handle);
            return Err(RejectReason::AllocFailure);
        };
        BlobHeader::new(space, offset).encode(&mut blob);
        blob[HEADER_LEN..].copy_from_slice(data);
        drop(blob);

        Ok(Arc::new(StoredBlob::new(pool.clone(), handle, data.len(), sum)))
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Copy a cached page into `out`
    pub fn load(
        &self,
        space: SpaceId,
        offset: PageOffset,
        out: &mut [u8],
    ) -> std::result::Result<LoadOutcome, LoadError> {
        if out.len() != PAGE_SIZE {
            return Err(LoadError::InvalidBuffer(out.len()));
        }

        let found = self
            .space_store(space)
            .and_then(|store| store.find_get(offset).map(|entry| (store, entry)));
        let Some((store, entry)) = found else {
            self.stats.record_load(false);
            return Ok(LoadOutcome::NotFound);
        };

        let result = match entry.payload() {
            Payload::SameFilled(value) => {
                fill_page(out, *value);
                Ok(())
            }
            Payload::ZeroFilled => {
                out.fill(0);
                Ok(())
            }
            Payload::Compressed(blob) => Self::read_blob(blob, out),
        };

        if let Err(reason) = result {
            let preview = entry
                .blob()
                .and_then(|blob| blob.pool().allocator().map(blob.handle()))
                .map(|mapped| hex_preview(&mapped, 64))
                .unwrap_or_default();
            tracing::error!(
                %space,
                offset,
                length = entry.length(),
                %reason,
                blob = %preview,
                "Cached page failed to decompress, marking it lost"
            );
            if !store.poison_if_same(offset, entry) {
                tracing::debug!(%space, offset, "Offset was rewritten during the failed load");
            }
            self.refresh_pool_total();
            return Err(LoadError::Corrupted { space, offset });
        }

        store.put(entry);
        self.stats.record_load(true);
        Ok(LoadOutcome::Found)
    }

    fn read_blob(blob: &StoredBlob, out: &mut [u8]) -> std::result::Result<(), String> {
        let mapped = blob
            .pool()
            .allocator()
            .map(blob.handle())
            .ok_or_else(|| "blob handle not mapped".to_string())?;
        let payload = &mapped[HEADER_LEN..HEADER_LEN + blob.length()];

        if blob.is_literal() {
            out.copy_from_slice(payload);
            return Ok(());
        }

        let mut ctx = blob.pool().compressor_context().map_err(|e| e.to_string())?;
        match ctx.decompress(payload, out) {
            Ok(PAGE_SIZE) => Ok(()),
            Ok(len) => Err(format!("decompressed to {} bytes", len)),
            Err(e) => Err(e.to_string()),
        }
    }

    // =========================================================================
    // Invalidate
    // =========================================================================

    /// Drop the cached copy of a page
    pub fn invalidate(&self, space: SpaceId, offset: PageOffset) -> bool {
        let removed = self
            .space_store(space)
            .is_some_and(|store| store.invalidate(offset));
        self.refresh_pool_total();
        removed
    }

    /// Record that the page at `offset` could not be written or read by the
    /// caller; further stores to it are refused until it is invalidated
    pub fn mark_page_failed(&self, space: SpaceId, offset: PageOffset) {
        if let Some(store) = self.space_store(space) {
            store.poison(offset);
            tracing::warn!(%space, offset, "Page marked as failed");
        }
        self.refresh_pool_total();
    }

    // =========================================================================
    // Fullness and Reclaim
    // =========================================================================

    /// Pool size limit in pages
    pub fn limit_pages(&self) -> u64 {
        self.total_memory_pages * self.max_pool_percent.load(Ordering::Relaxed) as u64 / 100
    }

    /// Pages held by every live pool, rounded up
    pub fn used_pages(&self) -> u64 {
        self.pools.total_size().div_ceil(PAGE_SIZE as u64)
    }

    pub fn is_full(&self) -> bool {
        self.used_pages() >= self.limit_pages()
    }

    fn reclaim_once(&self) -> std::result::Result<usize, AllocError> {
        let pool = self.pools.oldest().ok_or(AllocError::NoEvictor)?;
        pool.allocator().shrink(1)
    }

    /// Run one reclaim pass on the oldest pool; true if anything was evicted
    pub fn reclaim(&self) -> bool {
        let reclaimed = self.reclaim_once().is_ok();
        self.refresh_pool_total();
        reclaimed
    }

    fn refresh_pool_total(&self) {
        self.stats.update_pool_total(self.pools.total_size());
    }

    // =========================================================================
    // Runtime Tunables
    // =========================================================================

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::Relaxed) != enabled {
            tracing::info!(enabled, "Cache enabled state changed");
        }
    }

    /// Switch the compressor for new stores
    pub fn set_compressor(&self, name: &str) -> Result<()> {
        let compressor =
            CompressionAlgorithm::from_name(name).ok_or_else(|| Error::UnknownCompressor(name.to_string()))?;
        let _guard = self.switch_lock.lock();
        let backend = self.current_pool()?.backend();
        self.pools.switch(compressor, backend)?;
        Ok(())
    }

    /// Switch the allocator backend for new stores
    pub fn set_allocator_backend(&self, name: &str) -> Result<()> {
        let backend = AllocatorKind::from_name(name).ok_or_else(|| Error::UnknownAllocator(name.to_string()))?;
        let _guard = self.switch_lock.lock();
        let compressor = self.current_pool()?.compressor();
        self.pools.switch(compressor, backend)?;
        Ok(())
    }

    pub fn set_max_pool_percent(&self, percent: u8) -> Result<()> {
        check_pool_percent(percent)?;
        self.max_pool_percent.store(percent, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_same_value_dedup(&self, enabled: bool) {
        self.same_value_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_content_dedup(&self, enabled: bool) {
        self.content_dedup_enabled.store(enabled, Ordering::Relaxed);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn current_pool(&self) -> Result<Arc<ZPool>> {
        self.pools
            .current()
            .ok_or_else(|| Error::PoolUnavailable("no current pool".into()))
    }

    /// Current effective configuration
    pub fn config(&self) -> CacheConfig {
        let current = self.pools.current();
        CacheConfig {
            enabled: self.enabled.load(Ordering::Relaxed),
            compressor: current
                .as_ref()
                .map(|p| p.compressor().name().to_string())
                .unwrap_or_default(),
            allocator_backend: current
                .as_ref()
                .map(|p| p.backend().name().to_string())
                .unwrap_or_default(),
            max_pool_percent: self.max_pool_percent.load(Ordering::Relaxed),
            same_value_dedup_enabled: self.same_value_enabled.load(Ordering::Relaxed),
            content_dedup_enabled: self.content_dedup_enabled.load(Ordering::Relaxed),
            total_memory_bytes: Some(self.total_memory_pages * PAGE_SIZE as u64),
            allocator_page_limit: self.page_limit,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.refresh_pool_total();
        self.stats.snapshot()
    }

    pub fn pool_infos(&self) -> Vec<PoolInfo> {
        self.pools.pool_infos()
    }

    /// Entries cached for an address space
    pub fn space_len(&self, space: SpaceId) -> usize {
        self.space_store(space).map_or(0, |store| store.len())
    }

    pub fn spaces(&self) -> Vec<SpaceId> {
        self.spaces.iter().map(|entry| *entry.key()).collect()
    }
}
