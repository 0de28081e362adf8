//! Compressed Page Cache
//!
//! Pages evicted from memory are compressed into a pool before they reach the
//! backing store. A later fault reads them back from the pool; when the pool
//! fills, the least recently used blobs are decompressed and written back.
//!
//! # Architecture
//!
//! ```text
//!                     ┌────────────────────────────┐
//!   store / load ────▶│           ZCache           │
//!   invalidate        │  (controller, tunables)    │
//!                     └──────┬──────────────┬──────┘
//!                            │              │
//!              ┌─────────────▼───┐   ┌──────▼─────────────┐
//!              │   EntryStore    │   │    PoolRegistry    │
//!              │ (per space map, │   │ current + draining │
//!              │  dedup index)   │   │       ZPools       │
//!              └─────────────────┘   └──────┬─────────────┘
//!                                           │
//!                      ┌────────────────────┼────────────────────┐
//!                      │                    │                    │
//!              ┌───────▼──────┐   ┌─────────▼────────┐  ┌────────▼───────┐
//!              │ Compressors  │   │  BlobAllocator   │  │   Writeback    │
//!              │ lz4/lz4hc/   │   │ zsmalloc / zbud  │──▶ (EvictionSink) │
//!              │ zstd         │   │                  │  │  BackingStore  │
//!              └──────────────┘   └──────────────────┘  └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`page`] - page constants, same-value detection, blob header
//! - [`compression`] - compressor registry and per-worker contexts
//! - [`alloc`] - blob allocators and the eviction hook
//! - [`pool`] - compressor/allocator pairs and their lifecycle
//! - [`entry`] - cache entries and shared blobs
//! - [`store`] - per address space entry map
//! - [`dedup`] - checksum index for content dedup
//! - [`writeback`] - eviction sink writing victims to the backing store
//! - [`metrics`] - counters and gauges
//! - [`controller`] - the [`ZCache`] front end

pub mod alloc;
pub mod compression;
pub mod controller;
pub mod dedup;
pub mod entry;
pub mod metrics;
pub mod page;
pub mod pool;
pub mod store;
pub mod writeback;

#[cfg(test)]
mod proptest;

pub use alloc::{AllocError, AllocatorKind, BlobAllocator, BlobHandle, PoolId};
pub use compression::CompressionAlgorithm;
pub use controller::{LoadError, LoadOutcome, RejectReason, ZCache};
pub use entry::{Payload, StoredBlob, ZEntry};
pub use metrics::{CacheStats, StatsSnapshot};
pub use page::{PageOffset, SpaceId, PAGE_SIZE};
pub use pool::{PoolInfo, PoolState, ZPool};
