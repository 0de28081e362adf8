//! In-memory backing store
//!
//! Lock-free page map built on DashMap. Completions run inline by default;
//! with deferral enabled they queue until [`MemoryBackingStore::flush_pending`]
//! so tests can hold writebacks in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{BackingError, BackingStats, BackingStore, PageSlot, SlotError, WriteCompletion};
use crate::cache::page::{PageOffset, SpaceId};

type PageKey = (SpaceId, PageOffset);

/// In-memory backing store
pub struct MemoryBackingStore {
    /// Written pages
    pages: DashMap<PageKey, Bytes>,
    /// Reserved slots with a write not yet completed
    pending: DashMap<PageKey, ()>,
    /// Deferred writes awaiting flush
    queue: Mutex<Vec<(PageSlot, Bytes, WriteCompletion)>>,
    defer: AtomicBool,
    fail_writes: AtomicBool,
    /// Maximum pages held; further reservations are refused
    capacity: Option<usize>,
    reserved: AtomicUsize,
    writes: AtomicU64,
    failed_writes: AtomicU64,
    busy: AtomicU64,
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self {
            pages: DashMap::new(),
            pending: DashMap::new(),
            queue: Mutex::new(Vec::new()),
            defer: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            capacity: None,
            reserved: AtomicUsize::new(0),
            writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            busy: AtomicU64::new(0),
        }
    }
}

impl MemoryBackingStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding at most `pages` pages
    pub fn with_capacity(pages: usize) -> Self {
        Self {
            capacity: Some(pages),
            ..Self::default()
        }
    }

    /// Queue completions instead of running them inline
    pub fn set_deferred(&self, defer: bool) {
        self.defer.store(defer, Ordering::Relaxed);
    }

    /// Make subsequent writes complete with an error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Complete every queued write; returns how many ran
    pub fn flush_pending(&self) -> usize {
        let queued = std::mem::take(&mut *self.queue.lock());
        let count = queued.len();
        for (slot, data, on_complete) in queued {
            self.complete(slot, data, on_complete);
        }
        count
    }

    /// Number of writes waiting for [`flush_pending`](Self::flush_pending)
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Read back a written page
    pub fn read_page(&self, space: SpaceId, offset: PageOffset) -> Option<Bytes> {
        self.pages.get(&(space, offset)).map(|page| page.clone())
    }

    /// Drop a stored page
    pub fn discard(&self, space: SpaceId, offset: PageOffset) -> bool {
        let removed = self.pages.remove(&(space, offset)).is_some();
        if removed {
            self.reserved.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn is_pending(&self, space: SpaceId, offset: PageOffset) -> bool {
        self.pending.contains_key(&(space, offset))
    }

    fn complete(&self, slot: PageSlot, data: Bytes, on_complete: WriteCompletion) {
        let key = (slot.space, slot.offset);
        let result = if self.fail_writes.load(Ordering::Relaxed) {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
            self.release_reservation(&key);
            Err(BackingError::Io("injected write failure".into()))
        } else {
            self.pages.insert(key, data);
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        };
        self.pending.remove(&key);
        on_complete(result);
    }

    fn release_reservation(&self, key: &PageKey) {
        if !self.pages.contains_key(key) {
            self.reserved.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl BackingStore for MemoryBackingStore {
    fn alloc_page_slot(&self, space: SpaceId, offset: PageOffset) -> Result<PageSlot, SlotError> {
        let key = (space, offset);
        match self.pending.entry(key) {
            Entry::Occupied(_) => {
                self.busy.fetch_add(1, Ordering::Relaxed);
                Err(SlotError::Busy)
            }
            Entry::Vacant(vacant) => {
                if !self.pages.contains_key(&key) {
                    let reserved = self.reserved.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.capacity.is_some_and(|cap| reserved > cap) {
                        self.reserved.fetch_sub(1, Ordering::Relaxed);
                        return Err(SlotError::Unavailable("backing store full".into()));
                    }
                }
                vacant.insert(());
                Ok(PageSlot { space, offset })
            }
        }
    }

    fn release_slot(&self, slot: PageSlot) {
        let key = (slot.space, slot.offset);
        if self.pending.remove(&key).is_some() {
            self.release_reservation(&key);
        }
    }

    fn submit_write(&self, slot: PageSlot, data: Bytes, on_complete: WriteCompletion) {
        if self.defer.load(Ordering::Relaxed) {
            self.queue.lock().push((slot, data, on_complete));
        } else {
            self.complete(slot, data, on_complete);
        }
    }

    fn stats(&self) -> BackingStats {
        BackingStats {
            pages: self.pages.len() as u64,
            writes: self.writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
        }
    }
}
