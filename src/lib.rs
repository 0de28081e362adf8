//! zcache - Compressed Write-Back Page Cache
//!
//! A compressed cache sitting between a paging layer and its backing store.
//! Pages are compressed into a memory pool on their way out; faults are served
//! from the pool; when the pool is full the oldest blobs are written back.
//!
//! # Architecture
//!
//! ```text
//! fault handler ──store/load──▶ ZCache ──evict──▶ Writeback ──▶ BackingStore
//!                                  │
//!                          compressor + allocator pools
//! ```
//!
//! # Features
//!
//! - Compressors: LZ4, LZ4HC, Zstd
//! - Allocators: zsmalloc (size classes), zbud (two buddies per page)
//! - Same-value page detection and optional content dedup
//! - LRU reclaim with asynchronous writeback
//! - Runtime switching of compressor and allocator
//! - Prometheus metrics
//!
//! # Modules
//!
//! - [`backing`] - backing store trait and implementations
//! - [`cache`] - the compressed cache
//! - [`config`] - configuration
//! - [`error`] - Error types
//! - [`monitoring`] - Prometheus exposition

pub mod backing;
pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use backing::{BackingStore, FileBackingStore, MemoryBackingStore};
pub use cache::{LoadError, LoadOutcome, RejectReason, SpaceId, StatsSnapshot, ZCache, PAGE_SIZE};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use monitoring::PrometheusExporter;
