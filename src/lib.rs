//! Chunked Storage
//!
//! Byte-range access to logical files that a storage backend keeps as an
//! ordered sequence of smaller physical chunks.
//!
//! # Overview
//!
//! Some storage connectors never hold a large file as one object. The file is
//! uploaded as fixed-size parts, or split by a third-party convention such as
//! rclone's `<name>.rclone_chunk.<NNN>` fragments. The only operation the backend
//! offers is "fetch one physical chunk in full", yet clients ask for arbitrary
//! byte ranges of the logical file.
//!
//! This crate provides both halves of that abstraction:
//!
//! - **Listing**: merge a flat listing of fragments into logical file entries
//! - **Reading**: serve a byte range by lazily fetching only the chunks it spans,
//!   with retries, cancellation and end-to-end digest verification
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chunked_storage::{ByteRange, ChunkPlan, ChunkedLink, HttpChunkFetcher};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = ChunkPlan::from_sizes(
//!     vec!["/store/a.bin.rclone_chunk.001".into(), "/store/a.bin.rclone_chunk.002".into()],
//!     &[1048576, 524288],
//! )?;
//! let fetcher = Arc::new(HttpChunkFetcher::new("http://127.0.0.1:5244")?);
//!
//! let link = ChunkedLink::new(&plan, fetcher)?;
//! let (mut stream, releases) = link.open(ByteRange::new(1000, Some(4096)), CancellationToken::new())?;
//! let bytes = stream.read_to_end().await?;
//! releases.release().await?;
//! println!("read {} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ChunkIndex`]: cumulative extents of the physical chunks
//! - [`FragmentAggregator`]: reconciles listings into [`LogicalEntry`] values
//! - [`ChunkFetcher`]: the single backend seam, with [`HttpChunkFetcher`] for API servers
//! - [`ChunkedRangeReader`]: per-open session with lazy fetches and a running digest
//! - [`ChunkedLink`] and [`RangeStream`]: bounded ranges plus a [`ReleaseSet`]
//! - [`ReaderMetrics`]: counters with Prometheus text output
//!
//! # Configuration
//!
//! Connectors are configured from YAML:
//!
//! ```yaml
//! api_url: "http://127.0.0.1:5244"
//! remote_path: "/backing"
//! part_size: 52428800            # 50MB
//! fragment_marker: "rclone_chunk"
//! max_fetch_attempts: 3
//! verify_hash: true
//! hash_algorithm: sha1
//! ```
//!
//! See [`ConnectorConfig`] for every option.
//!
//! # Error Handling
//!
//! Every fallible operation returns [`ChunkError`]:
//!
//! ```rust,no_run
//! use chunked_storage::{ChunkError, ConnectorConfig};
//!
//! # fn main() {
//! match ConnectorConfig::from_file("connector.yaml") {
//!     Ok(_) => println!("Config loaded successfully"),
//!     Err(ChunkError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod config;
pub mod models;
pub mod error;
pub mod chunk_index;
pub mod fragment;
pub mod integrity;
pub mod fetcher;
pub mod reader;
pub mod range_stream;
pub mod metrics;

// Re-export commonly used types
pub use config::ConnectorConfig;
pub use models::{
    ByteRange, ChunkDescriptor, ChunkPlan, ChunkRef, ExpectedDigest, LogicalEntry, PhysicalEntry,
    PlanLayout, PlanSource,
};
pub use error::{ChunkError, Result};
pub use chunk_index::ChunkIndex;
pub use fragment::{FragmentAggregator, FragmentPattern};
pub use integrity::{HashAlgorithm, IntegrityVerifier};
pub use fetcher::{ChunkFetcher, HttpChunkFetcher, RetryPolicy, StaticTokenSigner, UrlSigner};
pub use reader::ChunkedRangeReader;
pub use range_stream::{ChunkedLink, RangeStream, Release, ReleaseSet};
pub use metrics::{MetricsSnapshot, ReaderMetrics};
