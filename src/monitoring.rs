//! Prometheus Exposition
//!
//! Mirrors [`StatsSnapshot`] and the pool table into a private Prometheus
//! registry. Call [`PrometheusExporter::observe`] before each scrape; counters
//! only ever move forward, gauges are overwritten.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::cache::{PoolInfo, StatsSnapshot, ZCache};
use crate::error::{Error, Result};

const NAMESPACE: &str = "zcache";

/// Cache metrics in Prometheus text format
pub struct PrometheusExporter {
    registry: Registry,

    // Gauges
    stored_pages: IntGauge,
    pool_total_bytes: IntGauge,
    same_value_pages: IntGauge,
    zero_pages: IntGauge,
    duplicate_pages: IntGauge,
    pool_bytes: IntGaugeVec,

    // Counters
    duplicate_entry: IntCounter,
    pool_limit_hit: IntCounter,
    written_back_pages: IntCounter,
    writeback_skipped: IntCounter,
    reject_reclaim_fail: IntCounter,
    reject_compress_fail: IntCounter,
    loads: IntCounterVec,
    rejects: IntCounterVec,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let stored_pages = gauge("stored_pages", "Pages currently held by the cache")?;
        let pool_total_bytes = gauge("pool_total_size_bytes", "Page memory held by all pools")?;
        let same_value_pages = gauge("same_filled_pages", "Pages stored as a repeated word")?;
        let zero_pages = gauge("zero_filled_pages", "Pages stored as all zeroes")?;
        let duplicate_pages = gauge("duplicate_pages", "Entries sharing another entry's blob")?;

        let duplicate_entry = counter("duplicate_entry_total", "Stores that replaced an existing entry")?;
        let pool_limit_hit = counter("pool_limit_hit_total", "Stores that found the pool at its limit")?;
        let written_back_pages = counter("written_back_pages_total", "Pages written back to the backing store")?;
        let writeback_skipped = counter("writeback_skipped_total", "Reclaim victims left in place")?;
        let reject_reclaim_fail = counter("reject_reclaim_fail_total", "Stores rejected after a failed reclaim")?;
        let reject_compress_fail = counter(
            "reject_compress_fail_total",
            "Compressor failures; the page was stored uncompressed",
        )?;

        let pool_bytes = IntGaugeVec::new(
            Opts::new("pool_size_bytes", "Page memory held per pool").namespace(NAMESPACE),
            &["pool", "compressor", "backend", "state"],
        )?;
        registry.register(Box::new(pool_bytes.clone()))?;

        let loads = IntCounterVec::new(
            Opts::new("loads_total", "Load calls by result").namespace(NAMESPACE),
            &["result"],
        )?;
        registry.register(Box::new(loads.clone()))?;

        let rejects = IntCounterVec::new(
            Opts::new("rejects_total", "Rejected stores by reason").namespace(NAMESPACE),
            &["reason"],
        )?;
        registry.register(Box::new(rejects.clone()))?;

        Ok(Self {
            registry,
            stored_pages,
            pool_total_bytes,
            same_value_pages,
            zero_pages,
            duplicate_pages,
            pool_bytes,
            duplicate_entry,
            pool_limit_hit,
            written_back_pages,
            writeback_skipped,
            reject_reclaim_fail,
            reject_compress_fail,
            loads,
            rejects,
        })
    }

    /// Pull the latest values from a cache
    pub fn observe(&self, cache: &ZCache) {
        self.refresh(&cache.stats(), &cache.pool_infos());
    }

    pub fn refresh(&self, stats: &StatsSnapshot, pools: &[PoolInfo]) {
        self.stored_pages.set(stats.stored_pages as i64);
        self.pool_total_bytes.set(stats.pool_total_bytes as i64);
        self.same_value_pages.set(stats.same_value_pages as i64);
        self.zero_pages.set(stats.zero_pages as i64);
        self.duplicate_pages.set(stats.duplicate_pages as i64);

        advance(&self.duplicate_entry, stats.duplicate_entry);
        advance(&self.pool_limit_hit, stats.pool_limit_hit);
        advance(&self.written_back_pages, stats.written_back_pages);
        advance(&self.writeback_skipped, stats.writeback_skipped);
        advance(&self.reject_reclaim_fail, stats.reject_reclaim_fail);
        advance(&self.reject_compress_fail, stats.reject_compress_fail);
        advance(&self.loads.with_label_values(&["found"]), stats.loads_found);
        advance(&self.loads.with_label_values(&["not_found"]), stats.loads_not_found);
        for (reason, count) in &stats.rejects {
            advance(&self.rejects.with_label_values(&[reason.as_str()]), *count);
        }

        // Pool labels change with state; rebuild the whole family
        self.pool_bytes.reset();
        for pool in pools {
            let id = pool.id.to_string();
            let state = serde_json::to_value(pool.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            self.pool_bytes
                .with_label_values(&[id.as_str(), pool.compressor.as_str(), pool.backend.as_str(), state.as_str()])
                .set(pool.total_size as i64);
        }
    }

    /// Encode every metric in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}
