//! Content-Dedup Index
//!
//! Ordered map from page checksum to the blobs whose decompressed content
//! produced it. Several blobs may share a checksum; callers must compare the
//! full page bytes before reusing a candidate.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::entry::StoredBlob;

/// Checksum index over shareable blobs
#[derive(Debug, Default)]
pub struct DedupIndex {
    tree: BTreeMap<u64, Vec<Arc<StoredBlob>>>,
    len: usize,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a blob under its checksum; blobs without one are ignored
    pub fn insert(&mut self, blob: &Arc<StoredBlob>) -> bool {
        let Some(checksum) = blob.checksum() else {
            return false;
        };
        let bucket = self.tree.entry(checksum).or_default();
        if bucket.iter().any(|b| Arc::ptr_eq(b, blob)) {
            return false;
        }
        bucket.push(blob.clone());
        self.len += 1;
        true
    }

    /// Blobs that may hold a page with this checksum
    pub fn candidates(&self, checksum: u64) -> Vec<Arc<StoredBlob>> {
        self.tree.get(&checksum).cloned().unwrap_or_default()
    }

    pub fn remove(&mut self, blob: &Arc<StoredBlob>) -> bool {
        let Some(checksum) = blob.checksum() else {
            return false;
        };
        let Some(bucket) = self.tree.get_mut(&checksum) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|b| !Arc::ptr_eq(b, blob));
        let removed = bucket.len() < before;
        if bucket.is_empty() {
            self.tree.remove(&checksum);
        }
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.len = 0;
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

    fn pool() -> Arc<ZPool> {
        let sink: Arc<dyn EvictionSink> = Arc::new(NullSink);
        Arc::new(
            ZPool::new(
                PoolId(9),
                CompressionAlgorithm::Lz4,
                AllocatorKind::Zsmalloc,
                None,
                Arc::downgrade(&sink),
            )
            .unwrap(),
        )
    }

    fn blob(pool: &Arc<ZPool>, checksum: Option<u64>) -> Arc<StoredBlob> {
        let handle = pool.allocator().alloc(64).unwrap();
        Arc::new(StoredBlob::new(pool.clone(), handle, 52, checksum))
    }

    #[test]
    fn test_collisions_share_a_bucket() {
        let pool = pool();
        let mut index = DedupIndex::new();
        let a = blob(&pool, Some(42));
        let b = blob(&pool, Some(42));
        let c = blob(&pool, Some(7));

        assert!(index.insert(&a));
        assert!(index.insert(&b));
        assert!(index.insert(&c));
        assert!(!index.insert(&a));
        assert_eq!(index.len(), 3);

        let candidates = index.candidates(42);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|x| Arc::ptr_eq(x, &a)));
        assert!(candidates.iter().any(|x| Arc::ptr_eq(x, &b)));
        assert!(index.candidates(1).is_empty());
    }

    #[test]
    fn test_remove() {
        let pool = pool();
        let mut index = DedupIndex::new();
        let a = blob(&pool, Some(5));
        let unindexed = blob(&pool, None);

        assert!(!index.insert(&unindexed));
        index.insert(&a);
        assert!(index.remove(&a));
        assert!(!index.remove(&a));
        assert!(index.is_empty());
        assert!(index.candidates(5).is_empty());
    }
}
