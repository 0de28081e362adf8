//! Entry Store
//!
//! One store per address space. A single mutex covers the offset map, the
//! reference counts of every entry in it, the dedup index and the set of
//! poisoned offsets. Callers follow the pin protocol:
//!
//! ```text
//!   lock → find + get → unlock → decompress / map / write → lock → put → unlock
//! ```
//!
//! Dropping the last reference frees the entry: its blob reference goes away
//! and, if that was the last entry sharing the blob, the blob leaves the
//! dedup index and is returned to its pool's allocator.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::dedup::DedupIndex;
use super::entry::{Payload, StoredBlob, ZEntry};
use super::metrics::CacheStats;
use super::page::{PageOffset, SpaceId};

#[derive(Default)]
struct StoreInner {
    entries: BTreeMap<PageOffset, Arc<ZEntry>>,
    dedup: DedupIndex,
    /// Offsets whose page was lost; stores are refused until invalidated
    poisoned: HashSet<PageOffset>,
}

/// Offset-keyed entries for one address space
pub struct EntryStore {
    space: SpaceId,
    inner: Mutex<StoreInner>,
    stats: Arc<CacheStats>,
}

impl EntryStore {
    pub fn new(space: SpaceId, stats: Arc<CacheStats>) -> Self {
        Self {
            space,
            inner: Mutex::new(StoreInner::default()),
            stats,
        }
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Look up an entry and pin it
    pub fn find_get(&self, offset: PageOffset) -> Option<Arc<ZEntry>> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(&offset)?;
        entry.get();
        Some(entry.clone())
    }

    /// Release a reference obtained from [`find_get`](Self::find_get)
    pub fn put(&self, entry: Arc<ZEntry>) {
        let mut inner = self.inner.lock();
        self.put_locked(&mut inner, entry);
    }

    fn put_locked(&self, inner: &mut StoreInner, entry: Arc<ZEntry>) {
        if entry.put() == 0 {
            self.free_entry(inner, &entry);
        }
    }

    fn free_entry(&self, inner: &mut StoreInner, entry: &ZEntry) {
        match entry.payload() {
            Payload::SameFilled(_) => self.stats.same_value_freed(),
            Payload::ZeroFilled => self.stats.zero_freed(),
            Payload::Compressed(blob) => {
                if blob.drop_ref() == 0 {
                    inner.dedup.remove(blob);
                    blob.pool().allocator().free(blob.handle());
                } else {
                    self.stats.duplicate_freed();
                }
            }
        }
        self.stats.entry_freed();
    }

    fn account_added(&self, entry: &ZEntry) {
        match entry.payload() {
            Payload::SameFilled(_) => self.stats.same_value_added(),
            Payload::ZeroFilled => self.stats.zero_added(),
            Payload::Compressed(_) => {}
        }
        self.stats.entry_added();
    }

    fn install(&self, inner: &mut StoreInner, entry: Arc<ZEntry>) {
        self.account_added(&entry);
        if let Some(blob) = entry.blob() {
            inner.dedup.insert(blob);
        }
        if let Some(old) = inner.entries.insert(entry.offset(), entry) {
            // New entry is already visible; the old one loses the map's reference
            self.stats.record_duplicate_entry();
            self.put_locked(inner, old);
        }
    }

    /// Insert an entry, atomically displacing any entry at the same offset
    pub fn insert_or_replace(&self, entry: Arc<ZEntry>) {
        let mut inner = self.inner.lock();
        self.install(&mut inner, entry);
    }

    /// Blobs that may already hold a page with this checksum
    pub fn dedup_candidates(&self, checksum: u64) -> Vec<Arc<StoredBlob>> {
        self.inner.lock().dedup.candidates(checksum)
    }

    /// Attach a new entry to an already stored blob.
    ///
    /// Fails if the blob was freed since it was looked up.
    pub fn insert_shared(&self, offset: PageOffset, blob: &Arc<StoredBlob>) -> bool {
        let mut inner = self.inner.lock();
        if blob.refs() == 0 {
            return false;
        }
        blob.add_ref();
        self.stats.duplicate_added();
        let entry = Arc::new(ZEntry::new(offset, Payload::Compressed(blob.clone())));
        self.install(&mut inner, entry);
        true
    }

    /// Remove the entry at `offset` and drop the map's reference
    pub fn invalidate(&self, offset: PageOffset) -> bool {
        let mut inner = self.inner.lock();
        inner.poisoned.remove(&offset);
        match inner.entries.remove(&offset) {
            Some(entry) => {
                self.put_locked(&mut inner, entry);
                true
            }
            None => false,
        }
    }

    /// Remove `offset` only if it still maps to `entry`
    pub fn invalidate_if_same(&self, offset: PageOffset, entry: &Arc<ZEntry>) -> bool {
        let mut inner = self.inner.lock();
        let same = inner
            .entries
            .get(&offset)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if !same {
            return false;
        }
        if let Some(removed) = inner.entries.remove(&offset) {
            self.put_locked(&mut inner, removed);
        }
        true
    }

    /// Remove the entry at `offset` without touching its poison mark
    pub fn discard(&self, offset: PageOffset) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&offset) {
            Some(entry) => {
                self.put_locked(&mut inner, entry);
                true
            }
            None => false,
        }
    }

    /// Drop a pin on an entry found unreadable, and poison `offset` if the
    /// map still holds that entry. A newer entry at the offset is left alone.
    pub fn poison_if_same(&self, offset: PageOffset, entry: Arc<ZEntry>) -> bool {
        let mut inner = self.inner.lock();
        let same = inner
            .entries
            .get(&offset)
            .is_some_and(|current| Arc::ptr_eq(current, &entry));
        self.put_locked(&mut inner, entry);
        if !same {
            return false;
        }
        if let Some(removed) = inner.entries.remove(&offset) {
            self.put_locked(&mut inner, removed);
        }
        inner.poisoned.insert(offset);
        true
    }

    /// Remove every entry; returns how many were dropped
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        let entries = std::mem::take(&mut inner.entries);
        let count = entries.len();
        for entry in entries.into_values() {
            self.put_locked(&mut inner, entry);
        }
        inner.poisoned.clear();
        count
    }

    /// Mark an offset as permanently lost and drop any entry it had
    pub fn poison(&self, offset: PageOffset) {
        let mut inner = self.inner.lock();
        inner.poisoned.insert(offset);
        if let Some(entry) = inner.entries.remove(&offset) {
            self.put_locked(&mut inner, entry);
        }
    }

    pub fn is_poisoned(&self, offset: PageOffset) -> bool {
        self.inner.lock().poisoned.contains(&offset)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn dedup_len(&self) -> usize {
        self.inner.lock().dedup.len()
    }
}

impl Drop for EntryStore {
    fn drop(&mut self) {
        let dropped = self.drain();
        if dropped > 0 {
            tracing::debug!(space = %self.space, dropped, "Freed entries of dropped store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::alloc::{AllocatorKind, BlobAllocator, BlobHandle, EvictOutcome, EvictionSink, PoolId};
    use crate::cache::compression::CompressionAlgorithm;
    use crate::cache::pool::ZPool;

    struct NullSink;

    impl EvictionSink for NullSink {
        fn evict(&self, _: PoolId, _: &dyn BlobAllocator, _: BlobHandle) -> EvictOutcome {
            EvictOutcome::Skipped
        }
    }

    struct Fixture {
        _sink: Arc<dyn EvictionSink>,
        pool: Arc<ZPool>,
        stats: Arc<CacheStats>,
        store: EntryStore,
    }

    fn fixture() -> Fixture {
        let sink: Arc<dyn EvictionSink> = Arc::new(NullSink);
        let pool = Arc::new(
            ZPool::new(
                PoolId(1),
                CompressionAlgorithm::Lz4,
                AllocatorKind::Zsmalloc,
                None,
                Arc::downgrade(&sink),
            )
            .unwrap(),
        );
        let stats = Arc::new(CacheStats::new());
        let store = EntryStore::new(SpaceId(0), stats.clone());
        Fixture {
            _sink: sink,
            pool,
            stats,
            store,
        }
    }

    fn compressed(pool: &Arc<ZPool>, offset: PageOffset, checksum: Option<u64>) -> Arc<ZEntry> {
        let handle = pool.allocator().alloc(100).unwrap();
        let blob = Arc::new(StoredBlob::new(pool.clone(), handle, 88, checksum));
        Arc::new(ZEntry::new(offset, Payload::Compressed(blob)))
    }

    #[test]
    fn test_find_get_pins_entry() {
        let fx = fixture();
        fx.store.insert_or_replace(Arc::new(ZEntry::new(5, Payload::ZeroFilled)));

        let entry = fx.store.find_get(5).unwrap();
        assert_eq!(entry.refcount(), 2);
        fx.store.put(entry.clone());
        assert_eq!(entry.refcount(), 1);
        assert!(fx.store.find_get(6).is_none());
    }

    #[test]
    fn test_replace_frees_old_blob() {
        let fx = fixture();
        let old = compressed(&fx.pool, 1, None);
        fx.store.insert_or_replace(old.clone());
        fx.store.insert_or_replace(compressed(&fx.pool, 1, None));

        assert_eq!(old.refcount(), 0);
        assert_eq!(fx.pool.allocator().blob_count(), 1);
        assert_eq!(fx.stats.snapshot().duplicate_entry, 1);
        assert_eq!(fx.stats.stored_pages(), 1);
    }

    #[test]
    fn test_invalidate_with_pinned_reader_defers_free() {
        let fx = fixture();
        fx.store.insert_or_replace(compressed(&fx.pool, 2, None));

        let pinned = fx.store.find_get(2).unwrap();
        assert!(fx.store.invalidate(2));
        assert!(fx.store.find_get(2).is_none());
        assert_eq!(fx.pool.allocator().blob_count(), 1);

        // Blob stays readable until the last reference is dropped
        let blob = pinned.blob().unwrap();
        assert!(fx.pool.allocator().map(blob.handle()).is_some());

        fx.store.put(pinned);
        assert_eq!(fx.pool.allocator().blob_count(), 0);
        assert_eq!(fx.stats.stored_pages(), 0);
    }

    #[test]
    fn test_shared_blob_freed_with_last_entry() {
        let fx = fixture();
        let first = compressed(&fx.pool, 10, Some(77));
        let blob = first.blob().unwrap().clone();
        fx.store.insert_or_replace(first);
        assert_eq!(fx.store.dedup_len(), 1);

        let candidates = fx.store.dedup_candidates(77);
        assert_eq!(candidates.len(), 1);
        assert!(fx.store.insert_shared(11, &candidates[0]));
        assert_eq!(blob.refs(), 2);
        assert_eq!(fx.stats.snapshot().duplicate_pages, 1);

        fx.store.invalidate(10);
        assert_eq!(blob.refs(), 1);
        assert_eq!(fx.pool.allocator().blob_count(), 1);
        assert!(fx.store.find_get(11).is_some());

        fx.store.invalidate(11);
        assert_eq!(blob.refs(), 0);
        assert_eq!(fx.store.dedup_len(), 0);
        assert_eq!(fx.pool.allocator().blob_count(), 0);
        assert_eq!(fx.stats.snapshot().duplicate_pages, 0);

        // A freed blob can no longer be shared
        assert!(!fx.store.insert_shared(12, &blob));
    }

    #[test]
    fn test_invalidate_if_same() {
        let fx = fixture();
        let a = Arc::new(ZEntry::new(3, Payload::SameFilled(9)));
        fx.store.insert_or_replace(a.clone());
        fx.store
            .insert_or_replace(Arc::new(ZEntry::new(3, Payload::SameFilled(10))));

        assert!(!fx.store.invalidate_if_same(3, &a));
        let current = fx.store.find_get(3).unwrap();
        fx.store.put(current.clone());
        assert!(fx.store.invalidate_if_same(3, &current));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_poison_and_clear() {
        let fx = fixture();
        fx.store.insert_or_replace(Arc::new(ZEntry::new(8, Payload::ZeroFilled)));
        fx.store.poison(8);
        assert!(fx.store.is_poisoned(8));
        assert!(fx.store.find_get(8).is_none());
        assert_eq!(fx.stats.snapshot().zero_pages, 0);

        fx.store.invalidate(8);
        assert!(!fx.store.is_poisoned(8));
    }

    #[test]
    fn test_poison_if_same_drops_pin_and_entry() {
        let fx = fixture();
        fx.store.insert_or_replace(compressed(&fx.pool, 4, None));

        let pinned = fx.store.find_get(4).unwrap();
        assert!(fx.store.poison_if_same(4, pinned.clone()));
        assert_eq!(pinned.refcount(), 0);
        assert!(fx.store.is_poisoned(4));
        assert!(fx.store.find_get(4).is_none());
        assert_eq!(fx.pool.allocator().blob_count(), 0);
        assert_eq!(fx.stats.stored_pages(), 0);
    }

    #[test]
    fn test_poison_if_same_keeps_newer_entry() {
        let fx = fixture();
        fx.store.insert_or_replace(compressed(&fx.pool, 4, None));
        let stale = fx.store.find_get(4).unwrap();

        // A store lands between the failed read and the poison
        fx.store.insert_or_replace(compressed(&fx.pool, 4, None));
        assert!(!fx.store.poison_if_same(4, stale.clone()));

        assert_eq!(stale.refcount(), 0);
        assert!(!fx.store.is_poisoned(4));
        let current = fx.store.find_get(4).unwrap();
        assert!(!Arc::ptr_eq(&current, &stale));
        fx.store.put(current);
        assert_eq!(fx.pool.allocator().blob_count(), 1);
        assert_eq!(fx.stats.stored_pages(), 1);
    }

    #[test]
    fn test_discard_keeps_poison_mark() {
        let fx = fixture();
        fx.store.poison(6);
        fx.store.insert_or_replace(Arc::new(ZEntry::new(7, Payload::ZeroFilled)));

        assert!(!fx.store.discard(6));
        assert!(fx.store.is_poisoned(6));
        assert!(fx.store.discard(7));
        assert!(fx.store.find_get(7).is_none());
        assert_eq!(fx.stats.stored_pages(), 0);
    }

    #[test]
    fn test_drain_frees_everything() {
        let fx = fixture();
        for offset in 0..20 {
            fx.store.insert_or_replace(compressed(&fx.pool, offset, None));
        }
        fx.store
            .insert_or_replace(Arc::new(ZEntry::new(100, Payload::SameFilled(1))));
        assert_eq!(fx.stats.stored_pages(), 21);

        assert_eq!(fx.store.drain(), 21);
        assert_eq!(fx.stats.stored_pages(), 0);
        assert_eq!(fx.stats.snapshot().same_value_pages, 0);
        assert_eq!(fx.pool.allocator().blob_count(), 0);
        assert_eq!(fx.store.drain(), 0);
    }
}
