//! Writeback Path
//!
//! Allocators call back into [`Writeback`] when they need room. For the
//! victim handle we:
//!
//! 1. read the blob header to learn which space and offset own it
//! 2. pin the entry at that offset and confirm it still owns this exact blob
//! 3. reserve a backing-store slot (a pending write means someone raced us)
//! 4. decompress into a fresh page and submit the write
//!
//! The write completion unlinks the entry if the offset still maps to it and
//! drops our pin, which frees the blob. The pin is also released if the
//! completion is dropped unrun. Any failure before submission undoes the pin
//! and reports the handle as skipped; the allocator moves on.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;

use super::alloc::{BlobAllocator, BlobHandle, EvictOutcome, EvictionSink, PoolId};
use super::entry::ZEntry;
use super::metrics::CacheStats;
use super::page::{BlobHeader, SpaceId, HEADER_LEN, PAGE_SIZE};
use super::store::EntryStore;
use crate::backing::{BackingStore, PageSlot, SlotError};

/// Why a victim was left in place
#[derive(Error, Debug)]
enum SkipReason {
    #[error("handle no longer mapped")]
    Unmapped,

    #[error("blob header unreadable")]
    BadHeader,

    #[error("address space gone")]
    NoSpace,

    #[error("entry invalidated")]
    Invalidated,

    #[error("offset now holds a different blob")]
    Stale,

    #[error("blob shared by {0} entries")]
    Shared(u32),

    #[error("backing slot: {0}")]
    Slot(#[from] SlotError),

    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Writeback's reference on a victim entry. Dropping it unpins the entry,
/// whether or not the backing store ever ran the completion.
struct EntryPin {
    store: Arc<EntryStore>,
    entry: Arc<ZEntry>,
}

impl EntryPin {
    fn unlink_if_current(&self) {
        self.store.invalidate_if_same(self.entry.offset(), &self.entry);
    }
}

impl Drop for EntryPin {
    fn drop(&mut self) {
        self.store.put(Arc::clone(&self.entry));
    }
}

/// Eviction sink writing victims to the backing store
pub struct Writeback {
    spaces: Arc<DashMap<SpaceId, Arc<EntryStore>>>,
    backing: Arc<dyn BackingStore>,
    stats: Arc<CacheStats>,
}

impl Writeback {
    pub fn new(
        spaces: Arc<DashMap<SpaceId, Arc<EntryStore>>>,
        backing: Arc<dyn BackingStore>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            spaces,
            backing,
            stats,
        }
    }

    fn writeback_entry(
        &self,
        pool: PoolId,
        allocator: &dyn BlobAllocator,
        handle: BlobHandle,
    ) -> Result<(), SkipReason> {
        let header = {
            let blob = allocator.map(handle).ok_or(SkipReason::Unmapped)?;
            BlobHeader::decode(&blob).ok_or(SkipReason::BadHeader)?
        };

        let store = self
            .spaces
            .get(&header.space)
            .map(|store| Arc::clone(store.value()))
            .ok_or(SkipReason::NoSpace)?;

        let entry = store
            .find_get(header.offset)
            .ok_or(SkipReason::Invalidated)?;
        let pin = EntryPin { store, entry };

        let (slot, page) = self.prepare(&pin.store, &pin.entry, pool, allocator, handle)?;

        let stats = self.stats.clone();
        self.backing.submit_write(
            slot,
            Bytes::from(page),
            Box::new(move |result| match result {
                Ok(()) => {
                    pin.unlink_if_current();
                    stats.record_written_back();
                }
                Err(e) => {
                    tracing::warn!(
                        space = %pin.store.space(),
                        offset = pin.entry.offset(),
                        error = %e,
                        "Writeback write failed, entry kept"
                    );
                }
            }),
        );

        Ok(())
    }

    /// Validate the pinned entry, reserve a slot and decompress the page
    fn prepare(
        &self,
        store: &EntryStore,
        entry: &ZEntry,
        pool: PoolId,
        allocator: &dyn BlobAllocator,
        handle: BlobHandle,
    ) -> Result<(PageSlot, Vec<u8>), SkipReason> {
        let blob = entry.blob().ok_or(SkipReason::Stale)?;
        if blob.pool().id() != pool || blob.handle() != handle {
            return Err(SkipReason::Stale);
        }
        let refs = blob.refs();
        if refs != 1 {
            return Err(SkipReason::Shared(refs));
        }

        let slot = self
            .backing
            .alloc_page_slot(store.space(), entry.offset())?;

        let mut page = vec![0u8; PAGE_SIZE];
        let decompressed = allocator
            .map(handle)
            .ok_or(SkipReason::Unmapped)
            .and_then(|mapped| {
                let payload = &mapped[HEADER_LEN..HEADER_LEN + blob.length()];
                if blob.is_literal() {
                    page.copy_from_slice(payload);
                    return Ok(PAGE_SIZE);
                }
                let mut ctx = blob
                    .pool()
                    .compressor_context()
                    .map_err(|e| SkipReason::Decompress(e.to_string()))?;
                ctx.decompress(payload, &mut page)
                    .map_err(|e| SkipReason::Decompress(e.to_string()))
            });

        match decompressed {
            Ok(PAGE_SIZE) => Ok((slot, page)),
            Ok(len) => {
                self.backing.release_slot(slot);
                Err(SkipReason::Decompress(format!("decompressed to {} bytes", len)))
            }
            Err(reason) => {
                self.backing.release_slot(slot);
                Err(reason)
            }
        }
    }
}

impl EvictionSink for Writeback {
    fn evict(&self, pool: PoolId, allocator: &dyn BlobAllocator, handle: BlobHandle) -> EvictOutcome {
        match self.writeback_entry(pool, allocator, handle) {
            Ok(()) => EvictOutcome::Evicted,
            Err(reason) => {
                tracing::debug!(%pool, handle = handle.raw(), %reason, "Writeback skipped");
                self.stats.record_writeback_skipped();
                EvictOutcome::Skipped
            }
        }
    }
}
