//! Cache statistics
//!
//! Relaxed atomic counters shared by every address space. Gauges are moved
//! up and down as entries come and go; readers may see slightly stale
//! values, which the fullness check tolerates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::controller::RejectReason;
use super::page::PAGE_SIZE;

/// Cache counters and gauges
#[derive(Debug, Default)]
pub struct CacheStats {
    // Gauges
    stored_pages: AtomicU64,
    pool_total_bytes: AtomicU64,
    same_value_pages: AtomicU64,
    zero_pages: AtomicU64,
    duplicate_pages: AtomicU64,

    // Counters
    duplicate_entry: AtomicU64,
    pool_limit_hit: AtomicU64,
    written_back_pages: AtomicU64,
    writeback_skipped: AtomicU64,
    reject_reclaim_fail: AtomicU64,
    reject_compress_fail: AtomicU64,
    loads_found: AtomicU64,
    loads_not_found: AtomicU64,
    rejects: [AtomicU64; RejectReason::COUNT],
}

fn dec(counter: &AtomicU64) {
    // Saturating so a racing reader never sees a wrapped gauge
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    // Entry gauges
    pub fn entry_added(&self) {
        self.stored_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_freed(&self) {
        dec(&self.stored_pages);
    }

    pub fn same_value_added(&self) {
        self.same_value_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn same_value_freed(&self) {
        dec(&self.same_value_pages);
    }

    pub fn zero_added(&self) {
        self.zero_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn zero_freed(&self) {
        dec(&self.zero_pages);
    }

    pub fn duplicate_added(&self) {
        self.duplicate_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_freed(&self) {
        dec(&self.duplicate_pages);
    }

    pub fn update_pool_total(&self, bytes: u64) {
        self.pool_total_bytes.store(bytes, Ordering::Relaxed);
    }

    // Event counters
    pub fn record_duplicate_entry(&self) {
        self.duplicate_entry.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_limit_hit(&self) {
        self.pool_limit_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written_back(&self) {
        self.written_back_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_writeback_skipped(&self) {
        self.writeback_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaim_fail(&self) {
        self.reject_reclaim_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compress_fail(&self) {
        self.reject_compress_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self, found: bool) {
        if found {
            self.loads_found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.loads_not_found.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reject(&self, reason: RejectReason) {
        self.rejects[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    // Readers
    pub fn stored_pages(&self) -> u64 {
        self.stored_pages.load(Ordering::Relaxed)
    }

    pub fn pool_total_bytes(&self) -> u64 {
        self.pool_total_bytes.load(Ordering::Relaxed)
    }

    pub fn written_back_pages(&self) -> u64 {
        self.written_back_pages.load(Ordering::Relaxed)
    }

    pub fn rejects(&self, reason: RejectReason) -> u64 {
        self.rejects[reason.index()].load(Ordering::Relaxed)
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> StatsSnapshot {
        let pool_total_bytes = self.pool_total_bytes();
        StatsSnapshot {
            stored_pages: self.stored_pages(),
            pool_total_bytes,
            pool_pages: pool_total_bytes / PAGE_SIZE as u64,
            same_value_pages: self.same_value_pages.load(Ordering::Relaxed),
            zero_pages: self.zero_pages.load(Ordering::Relaxed),
            duplicate_pages: self.duplicate_pages.load(Ordering::Relaxed),
            duplicate_entry: self.duplicate_entry.load(Ordering::Relaxed),
            pool_limit_hit: self.pool_limit_hit.load(Ordering::Relaxed),
            written_back_pages: self.written_back_pages(),
            writeback_skipped: self.writeback_skipped.load(Ordering::Relaxed),
            reject_reclaim_fail: self.reject_reclaim_fail.load(Ordering::Relaxed),
            reject_compress_fail: self.reject_compress_fail.load(Ordering::Relaxed),
            loads_found: self.loads_found.load(Ordering::Relaxed),
            loads_not_found: self.loads_not_found.load(Ordering::Relaxed),
            rejects: RejectReason::all()
                .iter()
                .map(|r| (r.name().to_string(), self.rejects(*r)))
                .collect(),
        }
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub stored_pages: u64,
    pub pool_total_bytes: u64,
    pub pool_pages: u64,
    pub same_value_pages: u64,
    pub zero_pages: u64,
    pub duplicate_pages: u64,
    pub duplicate_entry: u64,
    pub pool_limit_hit: u64,
    pub written_back_pages: u64,
    pub writeback_skipped: u64,
    pub reject_reclaim_fail: u64,
    pub reject_compress_fail: u64,
    pub loads_found: u64,
    pub loads_not_found: u64,
    /// Rejected stores by reason name
    pub rejects: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    pub fn total_rejects(&self) -> u64 {
        self.rejects.values().sum()
    }

    pub fn reject_count(&self, reason: RejectReason) -> u64 {
        self.rejects.get(reason.name()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_move_both_ways() {
        let stats = CacheStats::new();
        stats.entry_added();
        stats.entry_added();
        stats.zero_added();
        stats.entry_freed();
        stats.zero_freed();

        let snap = stats.snapshot();
        assert_eq!(snap.stored_pages, 1);
        assert_eq!(snap.zero_pages, 0);
    }

    #[test]
    fn test_gauge_never_wraps() {
        let stats = CacheStats::new();
        stats.duplicate_freed();
        assert_eq!(stats.snapshot().duplicate_pages, 0);
    }

    #[test]
    fn test_reject_counts_by_reason() {
        let stats = CacheStats::new();
        stats.record_reject(RejectReason::PoolFull);
        stats.record_reject(RejectReason::PoolFull);
        stats.record_reject(RejectReason::AllocFailure);

        let snap = stats.snapshot();
        assert_eq!(snap.reject_count(RejectReason::PoolFull), 2);
        assert_eq!(snap.reject_count(RejectReason::AllocFailure), 1);
        assert_eq!(snap.reject_count(RejectReason::NotAvailable), 0);
        assert_eq!(snap.total_rejects(), 3);
        assert_eq!(snap.rejects.len(), RejectReason::COUNT);
    }

    #[test]
    fn test_pool_pages_derived_from_bytes() {
        let stats = CacheStats::new();
        stats.update_pool_total(3 * PAGE_SIZE as u64);
        let snap = stats.snapshot();
        assert_eq!(snap.pool_pages, 3);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CacheStats::new();
        stats.record_written_back();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["written_back_pages"], 1);
        assert_eq!(json["rejects"]["pool_full"], 0);
    }
}
