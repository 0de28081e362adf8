//! Property-Based Tests for the Page Cache
//!
//! # Test Properties
//!
//! 1. **Codec Roundtrip**: every compressor restores any page exactly
//! 2. **Same-Value Detection**: filled pages are recognised, others are not
//! 3. **Cache Roundtrip**: a stored page loads back byte for byte on every
//!    compressor/allocator pair
//! 4. **Model Agreement**: random store/invalidate/load sequences match a
//!    plain map of the last value written per offset

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use super::compression::{CompressionAlgorithm, CompressorPool};
use super::controller::{LoadOutcome, ZCache};
use super::page::{fill_page, same_filled_value, SpaceId, PAGE_SIZE};
use crate::backing::MemoryBackingStore;
use crate::config::CacheConfig;

// =============================================================================
// Property Strategies
// =============================================================================

/// Pages built from byte runs; short runs give noise, long runs compress well
fn run_page_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec((any::<u8>(), 1usize..600), 1..64).prop_map(|runs| {
        runs.into_iter()
            .flat_map(|(byte, len)| std::iter::repeat(byte).take(len))
            .cycle()
            .take(PAGE_SIZE)
            .collect()
    })
}

fn noise_page_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), PAGE_SIZE)
}

fn filled_page_strategy() -> impl Strategy<Value = Vec<u8>> {
    any::<u64>().prop_map(|word| {
        let mut page = vec![0u8; PAGE_SIZE];
        fill_page(&mut page, word);
        page
    })
}

fn page_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => run_page_strategy(),
        1 => noise_page_strategy(),
        1 => filled_page_strategy(),
    ]
}

fn algorithm_strategy() -> impl Strategy<Value = CompressionAlgorithm> {
    prop::sample::select(CompressionAlgorithm::available_algorithms())
}

fn backend_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["zsmalloc", "zbud"])
}

#[derive(Debug, Clone)]
enum Op {
    Store(u64, Vec<u8>),
    Invalidate(u64),
    Load(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u64..16, run_page_strategy()).prop_map(|(o, p)| Op::Store(o, p)),
        1 => (0u64..16).prop_map(Op::Invalidate),
        2 => (0u64..16).prop_map(Op::Load),
    ]
}

fn cache_for(compressor: &str, backend: &str, dedup: bool) -> ZCache {
    let cache = ZCache::new(
        CacheConfig {
            compressor: compressor.to_string(),
            allocator_backend: backend.to_string(),
            content_dedup_enabled: dedup,
            total_memory_bytes: Some(1 << 30),
            ..CacheConfig::default()
        },
        Arc::new(MemoryBackingStore::new()),
    )
    .unwrap();
    cache.init_space(SpaceId(0));
    cache
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: decompress(compress(page)) == page
    #[test]
    fn prop_codec_roundtrip(alg in algorithm_strategy(), page in page_strategy()) {
        let pool = CompressorPool::with_workers(alg, 1).unwrap();
        let mut ctx = pool.acquire().unwrap();
        let compressed = ctx.compress(&page).unwrap().to_vec();

        let mut out = vec![0u8; PAGE_SIZE];
        let len = ctx.decompress(&compressed, &mut out).unwrap();
        prop_assert_eq!(len, PAGE_SIZE);
        prop_assert_eq!(out, page);
    }

    /// Property: a filled page reports its word
    #[test]
    fn prop_filled_page_detected(word in any::<u64>()) {
        let mut page = vec![0u8; PAGE_SIZE];
        fill_page(&mut page, word);
        prop_assert_eq!(same_filled_value(&page), Some(word));
    }

    /// Property: changing any single byte breaks same-value detection
    #[test]
    fn prop_single_byte_breaks_fill(word in any::<u64>(), index in 0..PAGE_SIZE, flip in 1u8..=255) {
        let mut page = vec![0u8; PAGE_SIZE];
        fill_page(&mut page, word);
        page[index] ^= flip;
        prop_assert_eq!(same_filled_value(&page), None);
    }
}

// =============================================================================
// Cache Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: store then load returns the page, or the store was rejected
    #[test]
    fn prop_store_load_roundtrip(
        alg in algorithm_strategy(),
        backend in backend_strategy(),
        page in page_strategy(),
    ) {
        let cache = cache_for(alg.name(), backend, false);
        let space = SpaceId(0);

        if cache.store(space, 7, &page).is_ok() {
            let mut out = vec![0u8; PAGE_SIZE];
            prop_assert_eq!(cache.load(space, 7, &mut out), Ok(LoadOutcome::Found));
            prop_assert_eq!(out, page);
        } else {
            // Only zbud turns pages away, and only incompressible ones
            prop_assert_eq!(backend, "zbud");
        }
    }

    /// Property: the cache agrees with a map of last writes
    #[test]
    fn prop_matches_model(
        backend in backend_strategy(),
        dedup in any::<bool>(),
        ops in prop::collection::vec(op_strategy(), 1..48),
    ) {
        let cache = cache_for("lz4", backend, dedup);
        let space = SpaceId(0);
        let mut model: HashMap<u64, Vec<u8>> = HashMap::new();
        let mut out = vec![0u8; PAGE_SIZE];

        for op in ops {
            match op {
                Op::Store(offset, page) => {
                    // A rejected overwrite leaves the offset empty
                    if cache.store(space, offset, &page).is_ok() {
                        model.insert(offset, page);
                    } else {
                        model.remove(&offset);
                    }
                }
                Op::Invalidate(offset) => {
                    cache.invalidate(space, offset);
                    model.remove(&offset);
                }
                Op::Load(offset) => {
                    let outcome = cache.load(space, offset, &mut out).unwrap();
                    match model.get(&offset) {
                        Some(expected) => {
                            prop_assert_eq!(outcome, LoadOutcome::Found);
                            prop_assert_eq!(&out, expected);
                        }
                        None => prop_assert_eq!(outcome, LoadOutcome::NotFound),
                    }
                }
            }
        }

        prop_assert_eq!(cache.space_len(space), model.len());
        prop_assert_eq!(cache.stats().stored_pages, model.len() as u64);
    }
}
