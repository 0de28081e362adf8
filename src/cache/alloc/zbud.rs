//! Buddy-pair allocator
//!
//! Every page holds at most two blobs: the first buddy grows up from just
//! after the page header chunk, the last buddy grows down from the end of the
//! page. Space is accounted in 64-byte chunks. Simple and predictable, at the
//! cost of a density ceiling of two blobs per page.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{
    alloc_with_reclaim, new_frame, shrink_units, AllocError, AllocatorKind, BlobAllocator,
    BlobHandle, Evictor, Frame, MappedBlob, MappedBlobMut, ReclaimUnits,
};
use crate::cache::page::PAGE_SIZE;

const CHUNK_SIZE: usize = 64;
const ZHDR_CHUNKS: usize = 1;
const NCHUNKS: usize = PAGE_SIZE / CHUNK_SIZE - ZHDR_CHUNKS;

/// Largest blob a single buddy can hold
pub const MAX_ALLOC: usize = PAGE_SIZE - ZHDR_CHUNKS * CHUNK_SIZE - CHUNK_SIZE;

fn size_to_chunks(size: usize) -> usize {
    (size + CHUNK_SIZE - 1) / CHUNK_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buddy {
    First,
    Last,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    handle: BlobHandle,
    chunks: usize,
}

struct ZbudPage {
    frame: Frame,
    first: Option<Slot>,
    last: Option<Slot>,
    lru_tick: u64,
    under_reclaim: bool,
}

impl ZbudPage {
    fn free_chunks(&self) -> usize {
        NCHUNKS - self.first.map_or(0, |s| s.chunks) - self.last.map_or(0, |s| s.chunks)
    }

    fn is_empty(&self) -> bool {
        self.first.is_none() && self.last.is_none()
    }

    /// Exactly one buddy in use
    fn is_unbuddied(&self) -> bool {
        self.first.is_some() != self.last.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    page: u64,
    buddy: Buddy,
    len: usize,
}

struct Inner {
    pages: HashMap<u64, ZbudPage>,
    handles: HashMap<BlobHandle, Location>,
    /// Pages with one free buddy, keyed by free chunk count
    unbuddied: BTreeSet<(usize, u64)>,
    /// Allocation order of pages, oldest first
    lru: BTreeMap<u64, u64>,
    next_page: u64,
    next_handle: u64,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, page_id: u64) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(page) = self.pages.get_mut(&page_id) {
            self.lru.remove(&page.lru_tick);
            page.lru_tick = tick;
            self.lru.insert(tick, page_id);
        }
    }

    /// Re-file a page in the unbuddied index after its buddies changed
    fn refile(&mut self, page_id: u64, old_free: usize) {
        self.unbuddied.remove(&(old_free, page_id));
        if let Some(page) = self.pages.get(&page_id) {
            if page.is_unbuddied() && !page.under_reclaim {
                self.unbuddied.insert((page.free_chunks(), page_id));
            }
        }
    }

    fn release(&mut self, page_id: u64) -> usize {
        match self.pages.remove(&page_id) {
            Some(page) => {
                self.lru.remove(&page.lru_tick);
                self.unbuddied.remove(&(page.free_chunks(), page_id));
                1
            }
            None => 0,
        }
    }

    fn locate(&self, handle: BlobHandle) -> Option<(Frame, std::ops::Range<usize>)> {
        let loc = self.handles.get(&handle)?;
        let page = self.pages.get(&loc.page)?;
        let start = match loc.buddy {
            Buddy::First => ZHDR_CHUNKS * CHUNK_SIZE,
            Buddy::Last => PAGE_SIZE - page.last?.chunks * CHUNK_SIZE,
        };
        Some((page.frame.clone(), start..start + loc.len))
    }
}

/// Two-blobs-per-page allocator
pub struct ZbudAllocator {
    inner: Mutex<Inner>,
    pages: AtomicUsize,
    max_pages: Option<usize>,
    evictor: Option<Evictor>,
}

impl ZbudAllocator {
    pub fn new(max_pages: Option<usize>, evictor: Option<Evictor>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pages: HashMap::new(),
                handles: HashMap::new(),
                unbuddied: BTreeSet::new(),
                lru: BTreeMap::new(),
                next_page: 0,
                next_handle: 1,
                tick: 0,
            }),
            pages: AtomicUsize::new(0),
            max_pages,
            evictor,
        }
    }

    fn try_alloc(&self, size: usize) -> Result<BlobHandle, AllocError> {
        let chunks = size_to_chunks(size);
        let mut inner = self.inner.lock();

        let found = inner.unbuddied.range((chunks, 0)..).next().copied();
        let (page_id, old_free) = match found {
            Some((free, id)) => (id, free),
            None => {
                if let Some(max) = self.max_pages {
                    if self.pages.load(Ordering::Relaxed) + 1 > max {
                        return Err(AllocError::NoMemory);
                    }
                }
                let id = inner.next_page;
                inner.next_page += 1;
                inner.pages.insert(
                    id,
                    ZbudPage {
                        frame: new_frame(1),
                        first: None,
                        last: None,
                        lru_tick: 0,
                        under_reclaim: false,
                    },
                );
                self.pages.fetch_add(1, Ordering::Relaxed);
                (id, NCHUNKS)
            }
        };

        let handle = BlobHandle(inner.next_handle);
        inner.next_handle += 1;

        let Some(page) = inner.pages.get_mut(&page_id) else {
            return Err(AllocError::NoMemory);
        };
        let slot = Some(Slot { handle, chunks });
        let buddy = if page.first.is_none() {
            page.first = slot;
            Buddy::First
        } else {
            page.last = slot;
            Buddy::Last
        };

        inner.refile(page_id, old_free);
        inner.touch(page_id);
        inner.handles.insert(
            handle,
            Location {
                page: page_id,
                buddy,
                len: size,
            },
        );

        Ok(handle)
    }
}

impl BlobAllocator for ZbudAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Zbud
    }

    fn alloc(&self, size: usize) -> Result<BlobHandle, AllocError> {
        if size == 0 || size > MAX_ALLOC {
            return Err(AllocError::TooLarge(size));
        }
        alloc_with_reclaim(self, || self.try_alloc(size))
    }

    fn free(&self, handle: BlobHandle) {
        let mut inner = self.inner.lock();
        let Some(loc) = inner.handles.remove(&handle) else {
            return;
        };
        let Some(page) = inner.pages.get_mut(&loc.page) else {
            return;
        };

        let old_free = page.free_chunks();
        match loc.buddy {
            Buddy::First => page.first = None,
            Buddy::Last => page.last = None,
        }
        if page.under_reclaim {
            return;
        }

        if page.is_empty() {
            inner.unbuddied.remove(&(old_free, loc.page));
            let released = inner.release(loc.page);
            self.pages.fetch_sub(released, Ordering::Relaxed);
        } else {
            inner.refile(loc.page, old_free);
        }
    }

    fn map(&self, handle: BlobHandle) -> Option<MappedBlob> {
        let (frame, range) = self.inner.lock().locate(handle)?;
        Some(MappedBlob::new(&frame, range))
    }

    fn map_mut(&self, handle: BlobHandle) -> Option<MappedBlobMut> {
        let (frame, range) = self.inner.lock().locate(handle)?;
        Some(MappedBlobMut::new(&frame, range))
    }

    fn shrink(&self, pages: usize) -> Result<usize, AllocError> {
        shrink_units(self, self.evictor.as_ref(), pages)
    }

    fn total_size(&self) -> u64 {
        (self.pages.load(Ordering::Relaxed) * PAGE_SIZE) as u64
    }

    fn blob_count(&self) -> usize {
        self.inner.lock().handles.len()
    }
}

impl ReclaimUnits for ZbudAllocator {
    fn begin_reclaim(&self) -> Option<(u64, Vec<BlobHandle>)> {
        let mut inner = self.inner.lock();
        let page_id = inner
            .lru
            .values()
            .copied()
            .find(|id| inner.pages.get(id).is_some_and(|p| !p.under_reclaim))?;

        let page = inner.pages.get_mut(&page_id)?;
        page.under_reclaim = true;
        let free = page.free_chunks();
        let handles: Vec<BlobHandle> = page
            .first
            .iter()
            .chain(page.last.iter())
            .map(|slot| slot.handle)
            .collect();
        inner.unbuddied.remove(&(free, page_id));

        Some((page_id, handles))
    }

    fn end_reclaim(&self, unit: u64) -> usize {
        let mut inner = self.inner.lock();
        let Some(page) = inner.pages.get_mut(&unit) else {
            return 0;
        };
        page.under_reclaim = false;

        if page.is_empty() {
            let released = inner.release(unit);
            self.pages.fetch_sub(released, Ordering::Relaxed);
            return released;
        }

        let free = page.free_chunks();
        inner.refile(unit, free);
        inner.touch(unit);
        0
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_two_buddies_share_a_page() {
        let allocator = ZbudAllocator::new(None, None);
        let first = allocator.alloc(1000).unwrap();
        let last = allocator.alloc(1000).unwrap();
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);

        allocator.map_mut(first).unwrap().fill(0x11);
        allocator.map_mut(last).unwrap().fill(0x22);
        assert!(allocator.map(first).unwrap().iter().all(|&b| b == 0x11));
        assert!(allocator.map(last).unwrap().iter().all(|&b| b == 0x22));

        // A third blob always needs a new page
        allocator.alloc(64).unwrap();
        assert_eq!(allocator.total_size(), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_buddy_too_large_for_remaining_space() {
        let allocator = ZbudAllocator::new(None, None);
        allocator.alloc(3000).unwrap();
        allocator.alloc(3000).unwrap();
        assert_eq!(allocator.total_size(), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_rejects_oversized_blob() {
        let allocator = ZbudAllocator::new(None, None);
        assert!(allocator.alloc(MAX_ALLOC).is_ok());
        assert_eq!(
            allocator.alloc(MAX_ALLOC + 1),
            Err(AllocError::TooLarge(MAX_ALLOC + 1))
        );
        assert_eq!(
            allocator.alloc(PAGE_SIZE),
            Err(AllocError::TooLarge(PAGE_SIZE))
        );
    }

    #[test]
    fn test_free_reuses_buddy_slot() {
        let allocator = ZbudAllocator::new(None, None);
        let a = allocator.alloc(1000).unwrap();
        let b = allocator.alloc(1000).unwrap();
        allocator.map_mut(b).unwrap().fill(9);

        allocator.free(a);
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);

        let c = allocator.alloc(1500).unwrap();
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);
        allocator.map_mut(c).unwrap().fill(3);
        assert!(allocator.map(b).unwrap().iter().all(|&x| x == 9));

        allocator.free(b);
        allocator.free(c);
        assert_eq!(allocator.total_size(), 0);
    }

    #[test]
    fn test_shrink_evicts_both_buddies_of_oldest_page() {
        let sink = FreeingSink::new();
        let allocator = ZbudAllocator::new(None, Some(evictor(&sink)));

        let a = allocator.alloc(1000).unwrap();
        let b = allocator.alloc(1000).unwrap();
        let c = allocator.alloc(1000).unwrap();
        let d = allocator.alloc(1000).unwrap();
        assert_eq!(allocator.total_size(), 2 * PAGE_SIZE as u64);

        assert_eq!(allocator.shrink(1), Ok(1));
        let offered = sink.offered.lock().clone();
        assert_eq!(offered, vec![a, b]);
        assert!(allocator.map(c).is_some());
        assert!(allocator.map(d).is_some());
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);
    }

    #[test]
    fn test_partial_reclaim_rotates_page() {
        let sink = FreeingSink::new();
        let allocator = ZbudAllocator::new(None, Some(evictor(&sink)));

        let a = allocator.alloc(3000).unwrap();
        let b = allocator.alloc(500).unwrap();
        sink.refuse.lock().push(b);

        // Only page holds a refused buddy: a goes, page survives
        let released = allocator.shrink(1).unwrap();
        assert_eq!(released, 0);
        assert!(allocator.map(a).is_none());
        assert!(allocator.map(b).is_some());
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);
    }
}
