//! File backing store
//!
//! One sparse image file per address space under a root directory; page `n`
//! lives at byte `n * PAGE_SIZE`. Writes run as tasks on a tokio runtime and
//! report through the completion callback.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Handle;

use super::{BackingError, BackingStats, BackingStore, PageSlot, SlotError, WriteCompletion};
use crate::cache::page::{PageOffset, SpaceId, PAGE_SIZE};
use crate::error::Result;

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    failed_writes: AtomicU64,
    busy: AtomicU64,
}

/// Image-file backing store
pub struct FileBackingStore {
    root: PathBuf,
    runtime: Handle,
    pending: Arc<DashMap<(SpaceId, PageOffset), ()>>,
    /// Pages written per space
    written: Arc<DashMap<(SpaceId, PageOffset), ()>>,
    counters: Arc<Counters>,
}

impl FileBackingStore {
    /// Create a store rooted at `root`, spawning writes on `runtime`
    pub fn new(root: impl Into<PathBuf>, runtime: Handle) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            runtime,
            pending: Arc::new(DashMap::new()),
            written: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_path(root: &Path, space: SpaceId) -> PathBuf {
        root.join(format!("{}.img", space))
    }

    /// Read a page back; `None` if it was never written
    pub async fn read_page(&self, space: SpaceId, offset: PageOffset) -> Result<Option<Vec<u8>>> {
        if !self.written.contains_key(&(space, offset)) {
            return Ok(None);
        }
        let mut file = tokio::fs::File::open(Self::image_path(&self.root, space)).await?;
        file.seek(SeekFrom::Start(offset * PAGE_SIZE as u64)).await?;
        let mut page = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut page).await?;
        Ok(Some(page))
    }

    async fn write_page(path: PathBuf, offset: PageOffset, data: Bytes) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset * PAGE_SIZE as u64)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

impl BackingStore for FileBackingStore {
    fn alloc_page_slot(&self, space: SpaceId, offset: PageOffset) -> std::result::Result<PageSlot, SlotError> {
        match self.pending.entry((space, offset)) {
            Entry::Occupied(_) => {
                self.counters.busy.fetch_add(1, Ordering::Relaxed);
                Err(SlotError::Busy)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(PageSlot { space, offset })
            }
        }
    }

    fn release_slot(&self, slot: PageSlot) {
        self.pending.remove(&(slot.space, slot.offset));
    }

    fn submit_write(&self, slot: PageSlot, data: Bytes, on_complete: WriteCompletion) {
        let path = Self::image_path(&self.root, slot.space);
        let pending = self.pending.clone();
        let written = self.written.clone();
        let counters = self.counters.clone();

        self.runtime.spawn(async move {
            let key = (slot.space, slot.offset);
            let result = Self::write_page(path, slot.offset, data).await;
            match &result {
                Ok(()) => {
                    written.insert(key, ());
                    counters.writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(space = %slot.space, offset = slot.offset, error = %e, "Backing write failed");
                    counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                }
            }
            pending.remove(&key);
            on_complete(result.map_err(BackingError::from));
        });
    }

    fn stats(&self) -> BackingStats {
        BackingStats {
            pages: self.written.len() as u64,
            writes: self.counters.writes.load(Ordering::Relaxed),
            failed_writes: self.counters.failed_writes.load(Ordering::Relaxed),
            busy: self.counters.busy.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "zcache-file-store-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_and_read_back() {
        let dir = scratch_dir();
        let store = FileBackingStore::new(&dir, Handle::current()).unwrap();

        let page = vec![0x3cu8; PAGE_SIZE];
        let slot = store.alloc_page_slot(SpaceId(1), 7).unwrap();
        assert_eq!(store.alloc_page_slot(SpaceId(1), 7), Err(SlotError::Busy));

        let (tx, rx) = tokio::sync::oneshot::channel();
        store.submit_write(
            slot,
            Bytes::from(page.clone()),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        assert_eq!(rx.await.unwrap(), Ok(()));

        assert_eq!(store.read_page(SpaceId(1), 7).await.unwrap(), Some(page));
        assert_eq!(store.read_page(SpaceId(1), 8).await.unwrap(), None);
        assert_eq!(store.stats().writes, 1);
        assert!(store.alloc_page_slot(SpaceId(1), 7).is_ok());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_slot() {
        let dir = scratch_dir();
        let store = FileBackingStore::new(&dir, Handle::current()).unwrap();

        let slot = store.alloc_page_slot(SpaceId(0), 0).unwrap();
        store.release_slot(slot);
        assert!(store.alloc_page_slot(SpaceId(0), 0).is_ok());
        assert_eq!(store.stats().pages, 0);

        let _ = std::fs::remove_dir_all(dir);
    }
}
