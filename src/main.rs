//! zcache workload driver
//!
//! Pushes a synthetic page workload through the cache, verifies every page
//! reads back from the cache or the backing store, and prints a JSON report.
//! With `--metrics-addr` it keeps serving Prometheus metrics afterwards.
//!
//! ```text
//! ┌──────────────┐ store/load ┌──────────┐ writeback ┌───────────────┐
//! │  workers     │───────────▶│  ZCache  │──────────▶│ backing store │
//! │ (per space)  │            │          │           │ memory | file │
//! └──────────────┘            └──────────┘           └───────────────┘
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zcache::backing::{BackingStore, FileBackingStore, MemoryBackingStore};
use zcache::cache::page::fill_page;
use zcache::cache::{LoadOutcome, PoolInfo, StatsSnapshot};
use zcache::{CacheConfig, PrometheusExporter, SpaceId, ZCache, PAGE_SIZE};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Compressed page cache workload driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "ZCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Compressor override (lz4, lz4hc, zstd)
    #[arg(long, env = "ZCACHE_COMPRESSOR")]
    compressor: Option<String>,

    /// Allocator backend override (zsmalloc, zbud)
    #[arg(long, env = "ZCACHE_ALLOCATOR")]
    allocator: Option<String>,

    /// Pool limit override, percent of total memory
    #[arg(long, env = "ZCACHE_MAX_POOL_PERCENT")]
    max_pool_percent: Option<u8>,

    /// Memory the pool limit is computed against, in MiB
    #[arg(long, env = "ZCACHE_TOTAL_MEMORY_MB")]
    total_memory_mb: Option<u64>,

    /// Enable content dedup
    #[arg(long, env = "ZCACHE_CONTENT_DEDUP")]
    content_dedup: bool,

    /// Number of address spaces, one worker each
    #[arg(long, default_value = "2")]
    spaces: u32,

    /// Pages stored per address space
    #[arg(long, default_value = "4096")]
    pages: u64,

    /// Page content generator
    #[arg(long, value_enum, default_value = "mixed")]
    workload: Workload,

    /// Write back to image files in this directory instead of memory
    #[arg(long, env = "ZCACHE_BACKING_DIR")]
    backing_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address after the run
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Workload {
    /// Compressible text
    Text,
    /// All-zero pages
    Zero,
    /// Repeated-word pages
    Same,
    /// Incompressible noise
    Random,
    /// Round-robin over the others
    Mixed,
}

impl Workload {
    fn page(&self, space: SpaceId, offset: u64) -> Vec<u8> {
        let kind = match self {
            Workload::Mixed => [Workload::Text, Workload::Zero, Workload::Same, Workload::Random]
                [(offset % 4) as usize],
            other => *other,
        };

        let mut page = vec![0u8; PAGE_SIZE];
        match kind {
            Workload::Text => {
                let text = format!("{} page {} holds some very ordinary text. ", space, offset);
                for (dst, src) in page.iter_mut().zip(text.bytes().cycle()) {
                    *dst = src;
                }
            }
            Workload::Zero => {}
            Workload::Same => fill_page(&mut page, offset.wrapping_mul(0x0101_0101_0101_0101) | 1),
            Workload::Random | Workload::Mixed => {
                let mut state = (((space.0 as u64) << 32) | offset).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                for byte in page.iter_mut() {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    *byte = state as u8;
                }
            }
        }
        page
    }
}

// =============================================================================
// Backing Store Selection
// =============================================================================

#[derive(Clone)]
enum Backing {
    Memory(Arc<MemoryBackingStore>),
    File(Arc<FileBackingStore>),
}

impl Backing {
    fn as_store(&self) -> Arc<dyn BackingStore> {
        match self {
            Backing::Memory(store) => store.clone(),
            Backing::File(store) => store.clone(),
        }
    }

    /// Read a written-back page, waiting briefly for in-flight file writes
    async fn read_back(&self, space: SpaceId, offset: u64) -> anyhow::Result<Option<Vec<u8>>> {
        match self {
            Backing::Memory(store) => Ok(store.read_page(space, offset).map(|page| page.to_vec())),
            Backing::File(store) => {
                for _ in 0..50 {
                    if let Some(page) = store.read_page(space, offset).await? {
                        return Ok(Some(page));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(None)
            }
        }
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Default, Serialize)]
struct RunReport {
    stored: u64,
    rejected: BTreeMap<String, u64>,
    served_from_cache: u64,
    served_from_backing: u64,
    mismatches: u64,
    elapsed_ms: u128,
    stats: StatsSnapshot,
    pools: Vec<PoolInfo>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = build_config(&args)?;
    info!("Starting zcache workload");
    info!("  Compressor: {}", config.compressor);
    info!("  Allocator: {}", config.allocator_backend);
    info!("  Max pool percent: {}", config.max_pool_percent);
    info!("  Spaces: {} x {} pages ({:?})", args.spaces, args.pages, args.workload);

    let backing = match &args.backing_dir {
        Some(dir) => Backing::File(Arc::new(
            FileBackingStore::new(dir, tokio::runtime::Handle::current())
                .with_context(|| format!("opening backing directory {}", dir.display()))?,
        )),
        None => Backing::Memory(Arc::new(MemoryBackingStore::new())),
    };

    let cache = Arc::new(ZCache::new(config, backing.as_store()).context("creating cache")?);

    let report = run_workload(&args, &cache, &backing).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.mismatches > 0 {
        error!(mismatches = report.mismatches, "Pages did not read back intact");
        anyhow::bail!("{} pages did not read back intact", report.mismatches);
    }

    if let Some(addr) = args.metrics_addr.as_deref() {
        let exporter = Arc::new(PrometheusExporter::new()?);
        let server_cache = cache.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, exporter, server_cache).await {
                error!("Metrics server error: {}", e);
            }
        });
        info!("Serving metrics until interrupted");
        tokio::signal::ctrl_c().await?;
    }

    for space in cache.spaces() {
        cache.invalidate_area(space);
    }
    info!("Shutdown complete");
    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(compressor) = &args.compressor {
        config.compressor = compressor.clone();
    }
    if let Some(allocator) = &args.allocator {
        config.allocator_backend = allocator.clone();
    }
    if let Some(percent) = args.max_pool_percent {
        config.max_pool_percent = percent;
    }
    if let Some(mb) = args.total_memory_mb {
        config.total_memory_bytes = Some(mb * 1024 * 1024);
    }
    if args.content_dedup {
        config.content_dedup_enabled = true;
    }
    Ok(config)
}

async fn run_workload(args: &Args, cache: &Arc<ZCache>, backing: &Backing) -> anyhow::Result<RunReport> {
    let started = Instant::now();
    let mut report = RunReport::default();

    let mut workers = Vec::new();
    for id in 0..args.spaces {
        let space = SpaceId(id);
        let cache = cache.clone();
        let workload = args.workload;
        let pages = args.pages;
        cache.init_space(space);

        workers.push(tokio::task::spawn_blocking(move || {
            let mut stored = 0u64;
            let mut rejected = Vec::new();
            for offset in 0..pages {
                match cache.store(space, offset, &workload.page(space, offset)) {
                    Ok(()) => stored += 1,
                    Err(reason) => rejected.push((offset, reason)),
                }
            }
            (space, stored, rejected)
        }));
    }

    let mut accepted = Vec::new();
    for worker in workers {
        let (space, stored, rejected) = worker.await?;
        report.stored += stored;
        for (offset, reason) in &rejected {
            warn!(%space, offset, %reason, "Store rejected");
            *report.rejected.entry(reason.name().to_string()).or_default() += 1;
        }
        let rejected: HashSet<u64> = rejected.into_iter().map(|(offset, _)| offset).collect();
        accepted.extend((0..args.pages).filter(|o| !rejected.contains(o)).map(|o| (space, o)));
    }

    let mut out = vec![0u8; PAGE_SIZE];
    for (space, offset) in accepted {
        let expected = args.workload.page(space, offset);
        let actual = match cache.load(space, offset, &mut out) {
            Ok(LoadOutcome::Found) => {
                report.served_from_cache += 1;
                Some(out.clone())
            }
            Ok(LoadOutcome::NotFound) => {
                report.served_from_backing += 1;
                backing.read_back(space, offset).await?
            }
            Err(e) => {
                error!(%space, offset, error = %e, "Load failed");
                None
            }
        };
        if actual.as_deref() != Some(&expected[..]) {
            report.mismatches += 1;
        }
    }

    report.elapsed_ms = started.elapsed().as_millis();
    report.stats = cache.stats();
    report.pools = cache.pool_infos();
    info!(
        stored = report.stored,
        written_back = report.stats.written_back_pages,
        pool_bytes = report.stats.pool_total_bytes,
        elapsed_ms = report.elapsed_ms,
        "Workload finished"
    );
    Ok(report)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr; stdout carries the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    exporter: Arc<PrometheusExporter>,
    cache: Arc<ZCache>,
) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept error")?;
        let io = TokioIo::new(stream);
        let exporter = exporter.clone();
        let cache = cache.clone();

        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let exporter = exporter.clone();
            let cache = cache.clone();
            async move {
                let response = match req.uri().path() {
                    "/metrics" => {
                        exporter.observe(&cache);
                        match exporter.encode() {
                            Ok(text) => {
                                let mut response = respond(StatusCode::OK, text);
                                response
                                    .headers_mut()
                                    .insert(CONTENT_TYPE, HeaderValue::from_static(exporter.content_type()));
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        }
                    }
                    "/healthz" => respond(StatusCode::OK, "ok"),
                    _ => respond(StatusCode::NOT_FOUND, "not found"),
                };
                Ok::<_, std::convert::Infallible>(response)
            }
        });

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
