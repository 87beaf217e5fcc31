use anyhow::{Context, Result};
use clap::Parser;
use kampung_atlas::config::{
    ResolverConfig, DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_TIMEOUT_SECS,
};
use kampung_atlas::input::{self, DEFAULT_COLUMN};
use kampung_atlas::postal::{CancelToken, GeoCache, PostalResolver, DEFAULT_ENDPOINT};
use kampung_atlas::{logging, map, server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Kampung Atlas: place event participants on a map by postal code
///
/// Reads the postal code column of an exported participant sheet, geocodes
/// each valid six-digit code through the OneMap search API and prints the
/// located markers as JSON. Invalid or unknown codes are skipped and listed.
///
/// Examples:
///   atlas participants.json
///   atlas participants.json --column "Postal Code" --html postal_code_map.html
///   atlas codes.txt --geojson markers.geojson --persist-cache
///   atlas --serve --port 8080
#[derive(Parser)]
#[command(name = "atlas", version, about, long_about = None)]
struct Cli {
    /// Input file: JSON rows/values, or one postal code per line.
    #[arg(index = 1, required_unless_present = "serve")]
    input: Option<PathBuf>,

    /// Column holding the postal code in JSON rows (or the header line).
    #[arg(long, default_value = DEFAULT_COLUMN)]
    column: String,

    /// Geocoding API token (bearer credential).
    #[arg(long, env = "ONEMAP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Geocoding search endpoint.
    #[arg(long, env = "ONEMAP_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Concurrent lookups per batch.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Attempts for a transient service failure, first try included.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    retries: u32,

    /// Base back-off delay between retries, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS)]
    retry_delay_ms: u64,

    /// Keep resolved coordinates in this JSON file between runs.
    #[arg(long, conflicts_with = "persist_cache")]
    cache_file: Option<PathBuf>,

    /// Keep resolved coordinates in ~/.kampung_atlas/cache.json.
    #[arg(long)]
    persist_cache: bool,

    /// Write a standalone HTML map of the markers.
    #[arg(long)]
    html: Option<PathBuf>,

    /// Write the markers as a GeoJSON FeatureCollection.
    #[arg(long)]
    geojson: Option<PathBuf>,

    /// Run the HTTP API instead of resolving a file.
    #[arg(long)]
    serve: bool,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Debug logging (RUST_LOG overrides).
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = ResolverConfig {
        endpoint: cli.endpoint.clone(),
        token: cli.token.clone().unwrap_or_default(),
        timeout_secs: cli.timeout,
        concurrency: cli.concurrency,
        max_attempts: cli.retries,
        retry_delay_ms: cli.retry_delay_ms,
    };

    let cache = Arc::new(match (&cli.cache_file, cli.persist_cache) {
        (Some(path), _) => GeoCache::load_from(path.clone()),
        (None, true) => GeoCache::load(),
        (None, false) => GeoCache::in_memory(),
    });

    let resolver = PostalResolver::from_config(&config, Arc::clone(&cache))?;

    if cli.serve {
        let runtime = tokio::runtime::Runtime::new().context("cannot start async runtime")?;
        return runtime
            .block_on(server::start(Arc::new(resolver), &cli.host, cli.port))
            .with_context(|| format!("server on {}:{} failed", cli.host, cli.port));
    }

    let input_path = cli.input.as_deref().context("no input file given")?;
    let raw = input::load_raw_codes(input_path, &cli.column)?;
    info!(path = %input_path.display(), rows = raw.len(), "loaded postal codes");

    let report = resolver.resolve_batch(&raw, &CancelToken::new())?;

    if let Err(e) = cache.persist() {
        warn!(error = %e, "failed to persist geocode cache");
    }

    if let Some(path) = &cli.html {
        map::write_html(path, &report.locations)
            .with_context(|| format!("cannot write map to {}", path.display()))?;
        info!(path = %path.display(), markers = report.locations.len(), "wrote HTML map");
    }
    if let Some(path) = &cli.geojson {
        map::write_geojson(path, &report.locations)
            .with_context(|| format!("cannot write GeoJSON to {}", path.display()))?;
        info!(path = %path.display(), features = report.locations.len(), "wrote GeoJSON");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
