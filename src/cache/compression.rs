//! Compressor Pool
//!
//! Named page compressors and the per-worker contexts that run them.
//!
//! Every pool owns one context per hardware thread. A caller pins the context
//! that belongs to its worker slot; if that slot is busy (another caller on the
//! same slot, or a re-entrant call from the eviction hook) the next free slot
//! is taken, and if every slot is busy a throwaway spare context is built.
//! Acquisition therefore never blocks.
//!
//! # Example
//!
//! ```
//! use zcache::cache::compression::{CompressionAlgorithm, CompressorPool};
//! use zcache::cache::PAGE_SIZE;
//!
//! let pool = CompressorPool::new(CompressionAlgorithm::Lz4).unwrap();
//! let page = vec![0x5au8; PAGE_SIZE];
//!
//! let mut ctx = pool.acquire().unwrap();
//! let compressed = ctx.compress(&page).unwrap().to_vec();
//!
//! let mut out = vec![0u8; PAGE_SIZE];
//! assert_eq!(ctx.decompress(&compressed, &mut out).unwrap(), PAGE_SIZE);
//! assert_eq!(out, page);
//! ```

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use super::page::PAGE_SIZE;
use crate::error::{Error, Result};

/// Per-context destination buffer; large enough for any page compressor's
/// worst-case expansion.
pub const COMPRESS_BUFFER_SIZE: usize = PAGE_SIZE * 2;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported page compressors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// LZ4 - fast compression
    Lz4,
    /// LZ4 high-compression mode
    Lz4hc,
    /// Zstandard - best ratio
    Zstd,
}

impl CompressionAlgorithm {
    /// Get the registered name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Lz4hc => "lz4hc",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    /// Look up a compressor by its registered name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::available_algorithms()
            .into_iter()
            .find(|alg| alg.name() == name.trim())
    }

    /// Get list of available algorithms
    pub fn available_algorithms() -> Vec<Self> {
        vec![Self::Lz4, Self::Lz4hc, Self::Zstd]
    }

    fn codec(&self) -> Result<Box<dyn PageCodec>> {
        Ok(match self {
            CompressionAlgorithm::Lz4 => Box::new(Lz4Codec::new(*self, None)),
            CompressionAlgorithm::Lz4hc => Box::new(Lz4Codec::new(
                *self,
                Some(lz4::block::CompressionMode::HIGHCOMPRESSION(LZ4HC_LEVEL)),
            )),
            CompressionAlgorithm::Zstd => Box::new(ZstdCodec::new()?),
        })
    }
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Zstd
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

const LZ4HC_LEVEL: i32 = 9;
const ZSTD_LEVEL: i32 = 3;

// =============================================================================
// Codec Trait
// =============================================================================

/// One compression context bound to a single algorithm
pub trait PageCodec: Send {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress `src` into `dst`, returning the compressed length
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decompress `src` into `dst`, returning the decompressed length
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize>;
}

fn compress_error(algorithm: CompressionAlgorithm, e: impl std::fmt::Display) -> Error {
    Error::CompressionFailed {
        algorithm: algorithm.name().into(),
        reason: e.to_string(),
    }
}

fn decompress_error(algorithm: CompressionAlgorithm, e: impl std::fmt::Display) -> Error {
    Error::DecompressionFailed {
        algorithm: algorithm.name().into(),
        reason: e.to_string(),
    }
}

// =============================================================================
// LZ4
// =============================================================================

/// LZ4 block codec (raw blocks, no size prefix)
struct Lz4Codec {
    algorithm: CompressionAlgorithm,
    mode: Option<lz4::block::CompressionMode>,
}

impl Lz4Codec {
    fn new(algorithm: CompressionAlgorithm, mode: Option<lz4::block::CompressionMode>) -> Self {
        Self { algorithm, mode }
    }
}

impl PageCodec for Lz4Codec {
    fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4::block::compress_to_buffer(src, self.mode, false, dst)
            .map_err(|e| compress_error(self.algorithm, e))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4::block::decompress_to_buffer(src, Some(dst.len() as i32), dst)
            .map_err(|e| decompress_error(self.algorithm, e))
    }
}

// =============================================================================
// Zstd
// =============================================================================

/// Zstandard bulk codec with reusable contexts
struct ZstdCodec {
    compressor: zstd::bulk::Compressor<'static>,
    decompressor: zstd::bulk::Decompressor<'static>,
}

impl ZstdCodec {
    fn new() -> Result<Self> {
        let algorithm = CompressionAlgorithm::Zstd;
        Ok(Self {
            compressor: zstd::bulk::Compressor::new(ZSTD_LEVEL)
                .map_err(|e| compress_error(algorithm, e))?,
            decompressor: zstd::bulk::Decompressor::new()
                .map_err(|e| decompress_error(algorithm, e))?,
        })
    }
}

impl PageCodec for ZstdCodec {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        self.compressor
            .compress_to_buffer(src, dst)
            .map_err(|e| compress_error(CompressionAlgorithm::Zstd, e))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        self.decompressor
            .decompress_to_buffer(src, dst)
            .map_err(|e| decompress_error(CompressionAlgorithm::Zstd, e))
    }
}

// =============================================================================
// Compression Context
// =============================================================================

/// A codec plus its scratch buffer
pub struct CompContext {
    codec: Box<dyn PageCodec>,
    buffer: Box<[u8]>,
}

impl CompContext {
    fn new(algorithm: CompressionAlgorithm) -> Result<Self> {
        Ok(Self {
            codec: algorithm.codec()?,
            buffer: vec![0u8; COMPRESS_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    /// Get the algorithm identifier
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.codec.algorithm()
    }

    /// Compress one page into the context buffer and return the result
    pub fn compress(&mut self, page: &[u8]) -> Result<&[u8]> {
        let len = self.codec.compress(page, &mut self.buffer)?;
        Ok(&self.buffer[..len])
    }

    /// Decompress into a caller-provided page
    pub fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        self.codec.decompress(src, dst)
    }

    /// Decompress one page into the context buffer
    pub fn decompress_scratch(&mut self, src: &[u8]) -> Result<&[u8]> {
        let len = self.codec.decompress(src, &mut self.buffer[..PAGE_SIZE])?;
        Ok(&self.buffer[..len])
    }
}

// =============================================================================
// Compressor Pool
// =============================================================================

static NEXT_WORKER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static WORKER_INDEX: Cell<usize> = Cell::new(NEXT_WORKER.fetch_add(1, Ordering::Relaxed));
}

/// Per-worker compression contexts for one algorithm
pub struct CompressorPool {
    algorithm: CompressionAlgorithm,
    contexts: Box<[CachePadded<Mutex<CompContext>>]>,
}

impl CompressorPool {
    /// Create a pool with one context per available hardware thread
    pub fn new(algorithm: CompressionAlgorithm) -> Result<Self> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(algorithm, workers)
    }

    /// Create a pool with an explicit number of worker contexts
    pub fn with_workers(algorithm: CompressionAlgorithm, workers: usize) -> Result<Self> {
        let contexts = (0..workers.max(1))
            .map(|_| CompContext::new(algorithm).map(|ctx| CachePadded::new(Mutex::new(ctx))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            algorithm,
            contexts: contexts.into_boxed_slice(),
        })
    }

    /// Get the algorithm identifier
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Number of pinned worker contexts
    pub fn workers(&self) -> usize {
        self.contexts.len()
    }

    /// Acquire a context without blocking
    pub fn acquire(&self) -> Result<CompGuard<'_>> {
        let n = self.contexts.len();
        let start = WORKER_INDEX.with(|w| w.get()) % n;

        for i in 0..n {
            if let Some(guard) = self.contexts[(start + i) % n].try_lock() {
                return Ok(CompGuard::Pinned(guard));
            }
        }

        tracing::debug!(algorithm = %self.algorithm, "All compressor contexts busy, using spare");
        Ok(CompGuard::Spare(Box::new(CompContext::new(self.algorithm)?)))
    }
}

impl std::fmt::Debug for CompressorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorPool")
            .field("algorithm", &self.algorithm)
            .field("workers", &self.contexts.len())
            .finish()
    }
}

/// Exclusive access to one compression context
pub enum CompGuard<'a> {
    /// A worker slot owned by the pool
    Pinned(MutexGuard<'a, CompContext>),
    /// Temporary context built because every slot was busy
    Spare(Box<CompContext>),
}

impl Deref for CompGuard<'_> {
    type Target = CompContext;

    fn deref(&self) -> &CompContext {
        match self {
            CompGuard::Pinned(guard) => guard,
            CompGuard::Spare(ctx) => ctx,
        }
    }
}

impl DerefMut for CompGuard<'_> {
    fn deref_mut(&mut self) -> &mut CompContext {
        match self {
            CompGuard::Pinned(guard) => guard,
            CompGuard::Spare(ctx) => ctx,
        }
    }
}
