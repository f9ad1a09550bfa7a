//! Chunked Storage CLI
//!
//! Streams a byte range of a chunked logical file to stdout. The file is
//! described by a JSON plan source (explicit chunks, fixed-size parts or a
//! fragment listing) whose paths are relative to the connector's `remote_path`.

use anyhow::{bail, Context};
use chunked_storage::{ByteRange, ChunkedLink, ConnectorConfig, PlanSource, ReaderMetrics};
use futures::StreamExt;
use std::env;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const BLOCK_SIZE: usize = 256 * 1024;

/// Main entry point for the chunked storage CLI
///
/// # Usage
/// ```bash
/// # Stream a whole file
/// chunked-storage connector.yaml plan.json
///
/// # Stream 4096 bytes starting at offset 1000
/// chunked-storage connector.yaml plan.json 1000 4096
///
/// # Same range as an HTTP Range header value
/// chunked-storage connector.yaml plan.json bytes=1000-5095
/// ```
#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout carries only file content
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(env::args().skip(1).collect()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Vec<String>) -> anyhow::Result<()> {
    if args.len() < 2 || args.len() > 4 {
        bail!("usage: chunked-storage <config.yaml> <plan.json> [start [length] | bytes=<first>-<last>]");
    }

    let config = ConnectorConfig::from_file(&args[0])
        .with_context(|| format!("Failed to load configuration from {}", args[0]))?;
    info!("Configuration loaded successfully");
    info!("  - API URL: {}", config.api_url);
    info!("  - Remote path: {}", config.remote_path);
    info!("  - Part size: {} bytes", config.part_size);
    info!("  - Fragment marker: {}", config.fragment_marker);
    info!("  - Max fetch attempts: {}", config.max_fetch_attempts);
    info!("  - Verify hash: {} ({})", config.verify_hash, config.hash_algorithm);

    let plan_json = tokio::fs::read_to_string(&args[1])
        .await
        .with_context(|| format!("Failed to read chunk plan {}", args[1]))?;
    let source = PlanSource::from_json(&plan_json).context("Invalid chunk plan")?;
    let plan = config.resolve_plan(source).context("Invalid chunk plan")?;
    let needs_proxy = plan.needs_proxy;

    let range = parse_range(&args[2..])?;

    let metrics = Arc::new(ReaderMetrics::new());
    let fetcher = Arc::new(config.http_fetcher()?);
    let link = ChunkedLink::new(&plan, fetcher)?
        .with_retry_policy(config.retry_policy(needs_proxy))
        .with_verification(config.verify_hash)
        .with_metrics(Arc::clone(&metrics));

    info!(
        "Streaming {} of {} bytes from offset {} across {} chunks",
        range.effective_length(link.size()),
        link.size(),
        range.start,
        link.index().len()
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight fetches");
            interrupt.cancel();
        }
    });

    let (stream, releases) = link.open(range, cancel)?;
    let mut body = Box::pin(stream.into_byte_stream(BLOCK_SIZE));
    let mut stdout = tokio::io::stdout();

    let copied: anyhow::Result<()> = async {
        while let Some(block) = body.next().await {
            stdout.write_all(&block?).await?;
        }
        stdout.flush().await?;
        Ok(())
    }
    .await;

    // Release runs even when streaming failed part way
    let released = releases.release().await;

    let stats = metrics.get_stats();
    info!(
        "Fetched {} chunks ({} bytes), delivered {} bytes, {} retries",
        stats.chunks_fetched, stats.bytes_fetched, stats.bytes_delivered, stats.fetch_retries
    );

    copied?;
    released?;
    Ok(())
}

/// Range from either `bytes=<first>-<last>` or a signed `start [length]` pair,
/// where a negative length reads to the end
fn parse_range(args: &[String]) -> anyhow::Result<ByteRange> {
    if let Some(first) = args.first().filter(|a| a.starts_with("bytes=")) {
        if args.len() > 1 {
            bail!("a bytes= range takes no length argument");
        }
        return Ok(ByteRange::from_header(first)?);
    }

    let start: i64 = match args.first() {
        Some(s) => s.parse().with_context(|| format!("Invalid start offset '{}'", s))?,
        None => 0,
    };
    let length: i64 = match args.get(1) {
        Some(s) => s.parse().with_context(|| format!("Invalid length '{}'", s))?,
        None => -1,
    };
    Ok(ByteRange::from_signed(start, length)?)
}
