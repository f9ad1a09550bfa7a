//! Configuration management for chunked storage connectors

use crate::error::{ChunkError, Result};
use crate::chunk_index::ChunkIndex;
use crate::fetcher::{HttpChunkFetcher, RetryPolicy, StaticTokenSigner};
use crate::fragment::{FragmentAggregator, FragmentPattern, DEFAULT_FRAGMENT_MARKER};
use crate::integrity::{HashAlgorithm, IntegrityVerifier};
use crate::models::{ChunkPlan, ChunkRef, PlanLayout, PlanSource};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration for a chunked storage connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Base URL of the API server chunks are downloaded from
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Backend directory the physical chunks live under
    #[serde(default = "default_remote_path")]
    pub remote_path: String,

    /// Size of each uploaded part in bytes (default: 50MB)
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Marker between the base name and ordinal of a fragment
    #[serde(default = "default_fragment_marker")]
    pub fragment_marker: String,

    /// Attempts per chunk fetch, the first one included (default: 3)
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: usize,

    /// Pause between attempts for direct fetches (default: 1000ms)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Pause between attempts for proxy-routed fetches (default: 500ms)
    #[serde(default = "default_proxy_retry_backoff_ms")]
    pub proxy_retry_backoff_ms: u64,

    /// Per-request timeout of one chunk fetch (default: 60s)
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Whether recorded digests are verified when a whole file is read
    #[serde(default = "default_true")]
    pub verify_hash: bool,

    /// Digest algorithm recorded for uploaded files (default: sha1)
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: HashAlgorithm,

    /// Whether the remote storage only serves files through the proxy route
    #[serde(default)]
    pub must_proxy: bool,

    /// Download proxy replacing the API server's proxy route (optional)
    #[serde(default)]
    pub down_proxy_url: Option<String>,

    /// Token appended as `sign` to download URLs (optional)
    #[serde(default)]
    pub sign_token: Option<String>,
}

fn default_api_url() -> String {
    "http://127.0.0.1:5244".to_string()
}

fn default_remote_path() -> String {
    "/".to_string()
}

fn default_part_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_fragment_marker() -> String {
    DEFAULT_FRAGMENT_MARKER.to_string()
}

fn default_max_fetch_attempts() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_proxy_retry_backoff_ms() -> u64 {
    500
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_hash_algorithm() -> HashAlgorithm {
    HashAlgorithm::Sha1
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            api_url: default_api_url(),
            remote_path: default_remote_path(),
            part_size: default_part_size(),
            fragment_marker: default_fragment_marker(),
            max_fetch_attempts: default_max_fetch_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            proxy_retry_backoff_ms: default_proxy_retry_backoff_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            verify_hash: default_true(),
            hash_algorithm: default_hash_algorithm(),
            must_proxy: false,
            down_proxy_url: None,
            sign_token: None,
        }
    }
}

impl ConnectorConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(ConnectorConfig)` if loading and validation succeed
    /// * `Err(ChunkError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ChunkError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ConnectorConfig = serde_yaml::from_str(content).map_err(|e| {
            ChunkError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - api_url must be an http(s) URL
    /// - remote_path must be absolute
    /// - part_size must be between 1MB and 10GB
    /// - fragment_marker must be non-empty and contain no `/`
    /// - max_fetch_attempts must be between 1 and 10
    /// - fetch_timeout_secs must be > 0
    pub fn validate(&self) -> Result<()> {
        const MIN_PART_SIZE: u64 = 1024 * 1024; // 1MB
        const MAX_PART_SIZE: u64 = 10 * 1024 * 1024 * 1024; // 10GB
        const MAX_ATTEMPTS: usize = 10;

        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ChunkError::ConfigError(format!(
                "api_url must start with http:// or https://, got '{}'",
                self.api_url
            )));
        }

        if !self.remote_path.starts_with('/') {
            return Err(ChunkError::ConfigError(format!(
                "remote_path must be absolute, got '{}'",
                self.remote_path
            )));
        }

        if self.part_size < MIN_PART_SIZE || self.part_size > MAX_PART_SIZE {
            return Err(ChunkError::ConfigError(format!(
                "part_size must be between {}MB and {}GB, got {} bytes",
                MIN_PART_SIZE / (1024 * 1024),
                MAX_PART_SIZE / (1024 * 1024 * 1024),
                self.part_size
            )));
        }

        if self.fragment_marker.is_empty() || self.fragment_marker.contains('/') {
            return Err(ChunkError::ConfigError(format!(
                "fragment_marker must be non-empty and must not contain '/', got '{}'",
                self.fragment_marker
            )));
        }

        if self.max_fetch_attempts == 0 || self.max_fetch_attempts > MAX_ATTEMPTS {
            return Err(ChunkError::ConfigError(format!(
                "max_fetch_attempts must be between 1 and {}, got {}",
                MAX_ATTEMPTS, self.max_fetch_attempts
            )));
        }

        if self.fetch_timeout_secs == 0 {
            return Err(ChunkError::ConfigError(
                "fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy for fetches on the given route
    pub fn retry_policy(&self, needs_proxy: bool) -> RetryPolicy {
        let backoff_ms = if needs_proxy {
            self.proxy_retry_backoff_ms
        } else {
            self.retry_backoff_ms
        };
        RetryPolicy::new(self.max_fetch_attempts, Duration::from_millis(backoff_ms))
    }

    pub fn fragment_pattern(&self) -> Result<FragmentPattern> {
        FragmentPattern::new(&self.fragment_marker)
    }

    /// Build the HTTP fetcher described by this configuration
    pub fn http_fetcher(&self) -> Result<HttpChunkFetcher> {
        let mut fetcher = HttpChunkFetcher::with_timeout(
            self.api_url.clone(),
            Duration::from_secs(self.fetch_timeout_secs),
        )?;

        if let Some(proxy) = &self.down_proxy_url {
            fetcher = fetcher.with_down_proxy(proxy.clone());
        }
        if let Some(token) = &self.sign_token {
            fetcher = fetcher.with_signer(Arc::new(StaticTokenSigner::new(token.clone())));
        }
        Ok(fetcher)
    }

    /// Backend address of `path` relative to `remote_path`
    pub fn remote_address(&self, path: &str) -> String {
        let base = self.remote_path.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            if base.is_empty() {
                "/".to_string()
            } else {
                base.to_string()
            }
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Turn a recorded chunk layout into a plan with backend addresses
    ///
    /// Fixed-size layouts are split by `part_size`, listings are merged with
    /// `fragment_marker`, and a digest without an algorithm is taken to use
    /// `hash_algorithm`. The plan is routed through the proxy when either the
    /// source or the connector asks for it.
    ///
    /// # Returns
    /// * `Err(ChunkError::ParseError)` if the layout does not describe a readable file
    /// * `Err(ChunkError::ConfigError)` if the digest is not valid hex of its algorithm
    pub fn resolve_plan(&self, source: PlanSource) -> Result<ChunkPlan> {
        let mut plan = match source.layout {
            PlanLayout::Chunks { chunks } => ChunkPlan::new(
                chunks
                    .into_iter()
                    .map(|c| ChunkRef {
                        address: self.remote_address(&c.address),
                        size: c.size,
                    })
                    .collect(),
            ),
            PlanLayout::Uniform { parts, size } => {
                let index = ChunkIndex::uniform(size, self.part_size)?;
                if index.len() != parts.len() {
                    return Err(ChunkError::ParseError(format!(
                        "{} bytes in {} byte parts needs {} parts, {} recorded",
                        size,
                        self.part_size,
                        index.len(),
                        parts.len()
                    )));
                }
                let sizes: Vec<u64> = index.descriptors().iter().map(|d| d.size).collect();
                let addresses = parts.iter().map(|p| self.remote_address(p)).collect();
                ChunkPlan::from_sizes(addresses, &sizes)?
            }
            PlanLayout::Listing { directory, name, entries } => {
                let aggregator = FragmentAggregator::new(self.fragment_pattern()?);
                aggregator
                    .chunk_plan(&entries, &self.remote_address(&directory), &name)?
                    .ok_or_else(|| {
                        ChunkError::ParseError(format!("{} not found in {}", name, directory))
                    })?
            }
        };

        if let Some(hex) = source.digest {
            let algorithm = source.digest_algorithm.unwrap_or(self.hash_algorithm);
            IntegrityVerifier::new(algorithm, &hex)?;
            plan = plan.with_digest(algorithm, hex);
        }
        plan = plan.with_proxy(source.needs_proxy || self.must_proxy);

        let size = plan.validate()?;
        debug!("Resolved plan of {} chunks, {} bytes", plan.chunks.len(), size);
        Ok(plan)
    }
}
