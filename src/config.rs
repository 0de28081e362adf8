//! Cache configuration
//!
//! Loaded from YAML (or built in code) and handed to [`crate::ZCache::new`].
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```yaml
//! compressor: lz4
//! max_pool_percent: 20
//! content_dedup_enabled: true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::alloc::AllocatorKind;
use crate::cache::compression::CompressionAlgorithm;
use crate::error::{Error, Result};

/// Compressor used when none is configured
pub const DEFAULT_COMPRESSOR: &str = "zstd";

/// Compressor tried when the configured one is unavailable at startup
pub const FALLBACK_COMPRESSOR: &str = "lz4";

/// Allocator backend used when none is configured
pub const DEFAULT_ALLOCATOR: &str = "zsmalloc";

/// Default share of system memory the pool may use
pub const DEFAULT_MAX_POOL_PERCENT: u8 = 30;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Accept new stores
    pub enabled: bool,
    /// Compressor name (`lz4`, `lz4hc`, `zstd`)
    pub compressor: String,
    /// Allocator backend name (`zsmalloc`, `zbud`)
    pub allocator_backend: String,
    /// Pool limit as a percentage of total memory
    pub max_pool_percent: u8,
    /// Store repeated-word pages without compressing them
    pub same_value_dedup_enabled: bool,
    /// Share blobs between offsets with identical content
    pub content_dedup_enabled: bool,
    /// Memory the pool limit is computed against; detected when unset
    pub total_memory_bytes: Option<u64>,
    /// Hard page cap inside each allocator; triggers eviction from `alloc`
    pub allocator_page_limit: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compressor: DEFAULT_COMPRESSOR.to_string(),
            allocator_backend: DEFAULT_ALLOCATOR.to_string(),
            max_pool_percent: DEFAULT_MAX_POOL_PERCENT,
            same_value_dedup_enabled: true,
            content_dedup_enabled: false,
            total_memory_bytes: None,
            allocator_page_limit: None,
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.check_percent()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Reject unknown names and out-of-range values
    pub fn validate(&self) -> Result<()> {
        self.check_percent()?;
        self.compression_algorithm()?;
        self.allocator_kind()?;
        if self.total_memory_bytes == Some(0) {
            return Err(Error::Config("total_memory_bytes must be non-zero".into()));
        }
        Ok(())
    }

    fn check_percent(&self) -> Result<()> {
        check_pool_percent(self.max_pool_percent)
    }

    pub fn compression_algorithm(&self) -> Result<CompressionAlgorithm> {
        CompressionAlgorithm::from_name(&self.compressor)
            .ok_or_else(|| Error::UnknownCompressor(self.compressor.clone()))
    }

    pub fn allocator_kind(&self) -> Result<AllocatorKind> {
        AllocatorKind::from_name(&self.allocator_backend)
            .ok_or_else(|| Error::UnknownAllocator(self.allocator_backend.clone()))
    }

    /// Configured memory size, or the machine's physical memory
    pub fn resolve_total_memory(&self) -> u64 {
        self.total_memory_bytes.unwrap_or_else(detect_total_memory)
    }
}

pub(crate) fn check_pool_percent(percent: u8) -> Result<()> {
    if percent > 100 {
        return Err(Error::Config(format!(
            "max_pool_percent must be within 0..=100, got {}",
            percent
        )));
    }
    Ok(())
}

/// Physical memory in bytes as reported by the OS
pub fn detect_total_memory() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory()
}
