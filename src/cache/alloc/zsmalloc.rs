//! Size-class allocator
//!
//! Blobs are rounded up to a 16-byte size class. Each class carves spans of
//! 1..=4 contiguous pages into equal slots; the span length is chosen per
//! class to waste the least space. Reclaim evicts whole spans, least
//! recently allocated first.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{
    alloc_with_reclaim, new_frame, shrink_units, AllocError, AllocatorKind, BlobAllocator,
    BlobHandle, Evictor, Frame, MappedBlob, MappedBlobMut, ReclaimUnits,
};
use crate::cache::page::{HEADER_LEN, PAGE_SIZE};

const CLASS_DELTA: usize = 16;
const MIN_ALLOC: usize = 32;
const MAX_SPAN_PAGES: usize = 4;

/// Largest blob this backend accepts: a literal page plus its header
pub const MAX_ALLOC: usize = (PAGE_SIZE + HEADER_LEN + CLASS_DELTA - 1) / CLASS_DELTA * CLASS_DELTA;

const NUM_CLASSES: usize = (MAX_ALLOC - MIN_ALLOC) / CLASS_DELTA + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SizeClass {
    size: usize,
    pages_per_span: usize,
    slots_per_span: usize,
}

impl SizeClass {
    fn for_index(index: usize) -> Self {
        let size = MIN_ALLOC + index * CLASS_DELTA;

        // Pick the span length with the best usage; ties go to fewer pages
        let mut best = (1, PAGE_SIZE / size, 0usize);
        for pages in 1..=MAX_SPAN_PAGES {
            let slots = pages * PAGE_SIZE / size;
            if slots == 0 {
                continue;
            }
            let usage = slots * size * 1000 / (pages * PAGE_SIZE);
            if usage > best.2 {
                best = (pages, slots, usage);
            }
        }

        Self {
            size,
            pages_per_span: best.0,
            slots_per_span: best.1,
        }
    }
}

fn class_index(size: usize) -> usize {
    (size.max(MIN_ALLOC) - MIN_ALLOC + CLASS_DELTA - 1) / CLASS_DELTA
}

struct Span {
    frame: Frame,
    class: usize,
    slots: Vec<Option<BlobHandle>>,
    free: Vec<usize>,
    lru_tick: u64,
    under_reclaim: bool,
}

impl Span {
    fn used(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    span: u64,
    slot: usize,
    len: usize,
}

struct Inner {
    classes: Vec<SizeClass>,
    spans: HashMap<u64, Span>,
    handles: HashMap<BlobHandle, Location>,
    /// Spans per class with at least one free slot
    partial: Vec<BTreeSet<u64>>,
    /// Allocation order of spans, oldest first
    lru: BTreeMap<u64, u64>,
    next_span: u64,
    next_handle: u64,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, span_id: u64) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(span) = self.spans.get_mut(&span_id) {
            self.lru.remove(&span.lru_tick);
            span.lru_tick = tick;
            self.lru.insert(tick, span_id);
        }
    }

    /// Drop an empty span, returning the pages it held
    fn release(&mut self, span_id: u64) -> usize {
        match self.spans.remove(&span_id) {
            Some(span) => {
                self.lru.remove(&span.lru_tick);
                self.partial[span.class].remove(&span_id);
                self.classes[span.class].pages_per_span
            }
            None => 0,
        }
    }

    fn locate(&self, handle: BlobHandle) -> Option<(Frame, std::ops::Range<usize>)> {
        let loc = self.handles.get(&handle)?;
        let span = self.spans.get(&loc.span)?;
        let start = loc.slot * self.classes[span.class].size;
        Some((span.frame.clone(), start..start + loc.len))
    }
}

/// Size-class blob allocator
pub struct ZsmallocAllocator {
    inner: Mutex<Inner>,
    /// Pages currently held by spans
    pages: AtomicUsize,
    max_pages: Option<usize>,
    evictor: Option<Evictor>,
}

impl ZsmallocAllocator {
    pub fn new(max_pages: Option<usize>, evictor: Option<Evictor>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                classes: (0..NUM_CLASSES).map(SizeClass::for_index).collect(),
                spans: HashMap::new(),
                handles: HashMap::new(),
                partial: vec![BTreeSet::new(); NUM_CLASSES],
                lru: BTreeMap::new(),
                next_span: 0,
                next_handle: 1,
                tick: 0,
            }),
            pages: AtomicUsize::new(0),
            max_pages,
            evictor,
        }
    }

    fn try_alloc(&self, size: usize) -> Result<BlobHandle, AllocError> {
        let index = class_index(size);
        let mut inner = self.inner.lock();
        let class = inner.classes[index];

        let span_id = match inner.partial[index].iter().next().copied() {
            Some(id) => id,
            None => {
                let held = self.pages.load(Ordering::Relaxed);
                if let Some(max) = self.max_pages {
                    if held + class.pages_per_span > max {
                        return Err(AllocError::NoMemory);
                    }
                }

                let id = inner.next_span;
                inner.next_span += 1;
                inner.spans.insert(
                    id,
                    Span {
                        frame: new_frame(class.pages_per_span),
                        class: index,
                        slots: vec![None; class.slots_per_span],
                        free: (0..class.slots_per_span).rev().collect(),
                        lru_tick: 0,
                        under_reclaim: false,
                    },
                );
                inner.partial[index].insert(id);
                self.pages.fetch_add(class.pages_per_span, Ordering::Relaxed);
                id
            }
        };

        let handle = BlobHandle(inner.next_handle);
        inner.next_handle += 1;

        let Some(span) = inner.spans.get_mut(&span_id) else {
            return Err(AllocError::NoMemory);
        };
        let Some(slot) = span.free.pop() else {
            return Err(AllocError::NoMemory);
        };
        span.slots[slot] = Some(handle);
        let full = span.free.is_empty();

        if full {
            inner.partial[index].remove(&span_id);
        }
        inner.touch(span_id);
        inner.handles.insert(
            handle,
            Location {
                span: span_id,
                slot,
                len: size,
            },
        );

        Ok(handle)
    }
}

impl BlobAllocator for ZsmallocAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Zsmalloc
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
        let Some(span) = inner.spans.get_mut(&loc.span) else {
            return;
        };

        span.slots[loc.slot] = None;
        span.free.push(loc.slot);
        if span.under_reclaim {
            return;
        }

        let (class, used) = (span.class, span.used());
        if used == 0 {
            let released = inner.release(loc.span);
            self.pages.fetch_sub(released, Ordering::Relaxed);
        } else {
            inner.partial[class].insert(loc.span);
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

impl ReclaimUnits for ZsmallocAllocator {
    fn begin_reclaim(&self) -> Option<(u64, Vec<BlobHandle>)> {
        let mut inner = self.inner.lock();
        let span_id = inner
            .lru
            .values()
            .copied()
            .find(|id| inner.spans.get(id).is_some_and(|s| !s.under_reclaim))?;

        let span = inner.spans.get_mut(&span_id)?;
        span.under_reclaim = true;
        let class = span.class;
        let handles: Vec<BlobHandle> = span.slots.iter().flatten().copied().collect();
        inner.partial[class].remove(&span_id);

        Some((span_id, handles))
    }

    fn end_reclaim(&self, unit: u64) -> usize {
        let mut inner = self.inner.lock();
        let Some(span) = inner.spans.get_mut(&unit) else {
            return 0;
        };
        span.under_reclaim = false;

        if span.used() == 0 {
            let released = inner.release(unit);
            self.pages.fetch_sub(released, Ordering::Relaxed);
            return released;
        }

        if !span.free.is_empty() {
            let class = span.class;
            inner.partial[class].insert(unit);
        }
        inner.touch(unit);
        0
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_class_geometry() {
        let smallest = SizeClass::for_index(0);
        assert_eq!(smallest.size, MIN_ALLOC);
        assert_eq!(smallest.pages_per_span, 1);
        assert_eq!(smallest.slots_per_span, PAGE_SIZE / MIN_ALLOC);

        // 3008 * 4 fits three pages almost exactly
        let class = SizeClass::for_index(class_index(3000));
        assert_eq!(class.size, 3008);
        assert_eq!(class.pages_per_span, 3);
        assert_eq!(class.slots_per_span, 4);

        let largest = SizeClass::for_index(NUM_CLASSES - 1);
        assert_eq!(largest.size, MAX_ALLOC);
        assert!(largest.slots_per_span >= 1);
    }

    #[test]
    fn test_class_index_rounding() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(32), 0);
        assert_eq!(class_index(33), 1);
        assert_eq!(class_index(48), 1);
        assert_eq!(class_index(MAX_ALLOC), NUM_CLASSES - 1);
    }

    #[test]
    fn test_same_class_shares_span() {
        let allocator = ZsmallocAllocator::new(None, None);
        let a = allocator.alloc(100).unwrap();
        let b = allocator.alloc(110).unwrap();
        assert_ne!(a, b);
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);

        allocator.map_mut(a).unwrap().fill(1);
        allocator.map_mut(b).unwrap().fill(2);
        assert!(allocator.map(a).unwrap().iter().all(|&x| x == 1));
        assert!(allocator.map(b).unwrap().iter().all(|&x| x == 2));
        assert_eq!(allocator.map(b).unwrap().len(), 110);

        allocator.free(a);
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);
        allocator.free(b);
        assert_eq!(allocator.total_size(), 0);
    }

    #[test]
    fn test_literal_page_accepted() {
        let allocator = ZsmallocAllocator::new(None, None);
        let handle = allocator.alloc(PAGE_SIZE + HEADER_LEN).unwrap();
        assert_eq!(allocator.map(handle).unwrap().len(), PAGE_SIZE + HEADER_LEN);
        assert_eq!(
            allocator.alloc(MAX_ALLOC + 1),
            Err(AllocError::TooLarge(MAX_ALLOC + 1))
        );
        assert_eq!(allocator.alloc(0), Err(AllocError::TooLarge(0)));
    }

    #[test]
    fn test_shrink_evicts_oldest_span() {
        let sink = FreeingSink::new();
        let allocator = ZsmallocAllocator::new(None, Some(evictor(&sink)));

        let old = allocator.alloc(2000).unwrap();
        let young = allocator.alloc(1000).unwrap();

        let released = allocator.shrink(1).unwrap();
        assert!(released >= 1);
        assert_eq!(sink.offered.lock().as_slice(), &[old]);
        assert!(allocator.map(young).is_some());
        assert_eq!(allocator.blob_count(), 1);
    }

    #[test]
    fn test_free_during_reclaim_keeps_span() {
        let allocator = ZsmallocAllocator::new(None, None);
        let handle = allocator.alloc(500).unwrap();

        let (unit, handles) = allocator.begin_reclaim().unwrap();
        assert_eq!(handles, vec![handle]);

        allocator.free(handle);
        assert_eq!(allocator.total_size(), PAGE_SIZE as u64);

        assert_eq!(allocator.end_reclaim(unit), 1);
        assert_eq!(allocator.total_size(), 0);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let allocator = ZsmallocAllocator::new(None, None);
        std::thread::scope(|s| {
            for t in 0..4u8 {
                let allocator = &allocator;
                s.spawn(move || {
                    for i in 0..200usize {
                        let size = 64 + (i * 37) % 3000;
                        let handle = allocator.alloc(size).unwrap();
                        allocator.map_mut(handle).unwrap().fill(t);
                        assert!(allocator.map(handle).unwrap().iter().all(|&b| b == t));
                        allocator.free(handle);
                    }
                });
            }
        });
        assert_eq!(allocator.blob_count(), 0);
        assert_eq!(allocator.total_size(), 0);
    }
}
