//! Chunk fetching from the backing store
//!
//! The reader only ever asks for one whole physical chunk at a time. Backends
//! plug in through [`ChunkFetcher`]; [`HttpChunkFetcher`] resolves chunk
//! addresses to download URLs on an API server.

use crate::error::{ChunkError, Result};
use crate::metrics::ReaderMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capability to fetch one physical chunk in full
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    /// Fetch the complete payload stored at `address`
    ///
    /// # Arguments
    /// * `address` - Backend path of the physical chunk
    /// * `needs_proxy` - Whether the backend only serves this chunk through its
    ///   proxy route
    async fn fetch_chunk(&self, address: &str, needs_proxy: bool) -> Result<Bytes>;
}

/// Fixed-backoff retry policy for chunk fetches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: usize,
    /// Pause between two attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy for chunks fetched straight from a network backend
    pub fn network() -> Self {
        RetryPolicy::new(3, Duration::from_secs(1))
    }

    /// Policy for chunks served through the local proxy route
    pub fn proxied() -> Self {
        RetryPolicy::new(3, Duration::from_millis(500))
    }

    /// Pick the preset matching how a plan's chunks are routed
    pub fn for_route(needs_proxy: bool) -> Self {
        if needs_proxy {
            RetryPolicy::proxied()
        } else {
            RetryPolicy::network()
        }
    }

    /// Check if another attempt should follow a failed attempt number `attempt`
    /// (1-based)
    pub fn should_retry(&self, attempt: usize, error: &ChunkError) -> bool {
        attempt < self.max_attempts && error.should_retry()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::network()
    }
}

/// Fetch one chunk, retrying transient failures
///
/// Each attempt and each backoff pause races `cancel`; cancellation wins
/// immediately with [`ChunkError::Cancelled`].
///
/// # Returns
/// * `Ok(Bytes)` once an attempt succeeds
/// * `Err(ChunkError::ChunkFetchFailed)` when attempts are exhausted or the
///   failure is not worth retrying
pub async fn fetch_with_retry(
    fetcher: &dyn ChunkFetcher,
    address: &str,
    needs_proxy: bool,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    metrics: Option<&ReaderMetrics>,
) -> Result<Bytes> {
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ChunkError::Cancelled),
            res = fetcher.fetch_chunk(address, needs_proxy) => res,
        };

        let error = match outcome {
            Ok(data) => {
                if let Some(metrics) = metrics {
                    metrics.record_chunk_fetched(data.len() as u64, started.elapsed());
                }
                debug!(
                    "Fetched chunk {} ({} bytes, attempt {})",
                    address,
                    data.len(),
                    attempt
                );
                return Ok(data);
            }
            Err(ChunkError::Cancelled) => return Err(ChunkError::Cancelled),
            Err(e) => e,
        };

        if !policy.should_retry(attempt, &error) {
            warn!(
                "Giving up on chunk {} after {} attempts: {}",
                address, attempt, error
            );
            if let Some(metrics) = metrics {
                metrics.record_fetch_failure();
            }
            return Err(ChunkError::ChunkFetchFailed {
                address: address.to_string(),
                status: error.upstream_status(),
                attempts: attempt,
                message: error.to_string(),
            });
        }

        warn!(
            "Fetch failed for chunk {} (attempt {}), retrying after {:?}: {}",
            address, attempt, policy.backoff, error
        );
        if let Some(metrics) = metrics {
            metrics.record_fetch_retry();
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ChunkError::Cancelled),
            _ = sleep(policy.backoff) => {}
        }
    }
}

/// Produces the `sign` query parameter for a chunk address
pub trait UrlSigner: Send + Sync {
    fn sign(&self, address: &str) -> String;
}

/// Signer that hands out one preconfigured token for every address
#[derive(Debug, Clone)]
pub struct StaticTokenSigner {
    token: String,
}

impl StaticTokenSigner {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenSigner {
            token: token.into(),
        }
    }
}

impl UrlSigner for StaticTokenSigner {
    fn sign(&self, _address: &str) -> String {
        self.token.clone()
    }
}

/// Fetches chunks over HTTP from an API server
///
/// Chunk addresses are served at `{api_url}/d{address}`, or `{api_url}/p{address}`
/// when proxy routing is required. A configured download proxy replaces the
/// `/p` route.
pub struct HttpChunkFetcher {
    client: Client,
    api_url: String,
    down_proxy_url: Option<String>,
    signer: Option<Arc<dyn UrlSigner>>,
}

impl fmt::Debug for HttpChunkFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChunkFetcher")
            .field("api_url", &self.api_url)
            .field("down_proxy_url", &self.down_proxy_url)
            .field("signed", &self.signer.is_some())
            .finish()
    }
}

impl HttpChunkFetcher {
    /// Create a fetcher with the default 60 second per-request timeout
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(api_url, Duration::from_secs(60))
    }

    /// Create a fetcher with a custom per-request timeout
    pub fn with_timeout(api_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ChunkError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpChunkFetcher {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            down_proxy_url: None,
            signer: None,
        })
    }

    /// Route proxied fetches through a download proxy
    ///
    /// Only the first line of a multi-line proxy list is used.
    pub fn with_down_proxy(mut self, down_proxy_url: impl Into<String>) -> Self {
        let url = down_proxy_url.into();
        let first = url.lines().next().unwrap_or("").trim().trim_end_matches('/');
        self.down_proxy_url = if first.is_empty() {
            None
        } else {
            Some(first.to_string())
        };
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn UrlSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Build the download URL for a chunk address
    pub fn chunk_url(&self, address: &str, needs_proxy: bool) -> String {
        let encoded = encode_path(address);

        let mut url = match (needs_proxy, &self.down_proxy_url) {
            (true, Some(proxy)) => format!("{}{}", proxy, encoded),
            (true, None) => format!("{}/p{}", self.api_url, encoded),
            (false, _) => format!("{}/d{}", self.api_url, encoded),
        };

        if let Some(signer) = &self.signer {
            url.push_str("?sign=");
            url.push_str(&urlencoding::encode(&signer.sign(address)));
        }
        url
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch_chunk(&self, address: &str, needs_proxy: bool) -> Result<Bytes> {
        if address.is_empty() {
            return Err(ChunkError::ParseError("chunk address is empty".to_string()));
        }

        let url = self.chunk_url(address, needs_proxy);
        debug!("Fetching chunk {} from {}", address, url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ChunkError::Timeout(format!("GET {} timed out: {}", url, e))
            } else {
                ChunkError::HttpError(format!("GET {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ChunkError::Timeout(format!("Reading body of {} timed out: {}", url, e))
            } else {
                ChunkError::HttpError(format!("Failed to read body of {}: {}", url, e))
            }
        })?;

        if status != StatusCode::OK {
            let preview = String::from_utf8_lossy(&body[..body.len().min(256)]).into_owned();
            return Err(ChunkError::from_http_status(
                status.as_u16(),
                format!("bad status: {}, body: {}", status, preview),
            ));
        }

        Ok(body)
    }
}

/// Percent-encode every path segment of `path`, keeping the `/` separators
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyFetcher {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChunkFetcher for FlakyFetcher {
        async fn fetch_chunk(&self, _address: &str, _needs_proxy: bool) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ChunkError::from_http_status(503, "unavailable"));
            }
            Ok(Bytes::from_static(b"payload"))
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_retry_presets() {
        assert_eq!(RetryPolicy::network(), RetryPolicy::new(3, Duration::from_secs(1)));
        assert_eq!(RetryPolicy::proxied().backoff, Duration::from_millis(500));
        assert_eq!(RetryPolicy::for_route(true), RetryPolicy::proxied());
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::network();
        let error = ChunkError::HttpError("reset".to_string());
        assert!(policy.should_retry(1, &error));
        assert!(policy.should_retry(2, &error));
        assert!(!policy.should_retry(3, &error));
        assert!(!policy.should_retry(1, &ChunkError::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_succeeds_on_third_attempt() {
        let fetcher = FlakyFetcher {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        };
        let metrics = ReaderMetrics::new();
        let data = fetch_with_retry(
            &fetcher,
            "/c/1",
            false,
            &quick_policy(),
            &CancellationToken::new(),
            Some(&metrics),
        )
        .await
        .unwrap();

        assert_eq!(data, Bytes::from_static(b"payload"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.get_stats().fetch_retries, 2);
        assert_eq!(metrics.get_stats().chunks_fetched, 1);
    }

    #[tokio::test]
    async fn test_fetch_exhausts_attempts() {
        let fetcher = FlakyFetcher {
            failures_left: AtomicUsize::new(10),
            calls: AtomicUsize::new(0),
        };
        let result = fetch_with_retry(
            &fetcher,
            "/c/1",
            false,
            &quick_policy(),
            &CancellationToken::new(),
            None,
        )
        .await;

        match result {
            Err(ChunkError::ChunkFetchFailed { address, status, attempts, .. }) => {
                assert_eq!(address, "/c/1");
                assert_eq!(status, Some(503));
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ChunkFetchFailed, got {:?}", other),
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_honours_cancellation() {
        let fetcher = FlakyFetcher {
            failures_left: AtomicUsize::new(10),
            calls: AtomicUsize::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fetch_with_retry(
            &fetcher,
            "/c/1",
            false,
            &RetryPolicy::network(),
            &cancel,
            None,
        )
        .await;
        assert!(matches!(result, Err(ChunkError::Cancelled)));
    }

    #[test]
    fn test_chunk_url_routes() {
        let fetcher = HttpChunkFetcher::new("http://api.local/").unwrap();
        assert_eq!(
            fetcher.chunk_url("/store/a b.bin", false),
            "http://api.local/d/store/a%20b.bin"
        );
        assert_eq!(
            fetcher.chunk_url("/store/a.bin", true),
            "http://api.local/p/store/a.bin"
        );

        let proxied = HttpChunkFetcher::new("http://api.local")
            .unwrap()
            .with_down_proxy("https://dl.example.com/\nhttps://backup.example.com");
        assert_eq!(
            proxied.chunk_url("/store/a.bin", true),
            "https://dl.example.com/store/a.bin"
        );
        assert_eq!(
            proxied.chunk_url("/store/a.bin", false),
            "http://api.local/d/store/a.bin"
        );
    }

    #[test]
    fn test_chunk_url_signed() {
        let fetcher = HttpChunkFetcher::new("http://api.local")
            .unwrap()
            .with_signer(Arc::new(StaticTokenSigner::new("tok=1")));
        assert_eq!(
            fetcher.chunk_url("/x", false),
            "http://api.local/d/x?sign=tok%3D1"
        );
    }

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("/a/b-c_d.e~f"), "/a/b-c_d.e~f");
        assert_eq!(encode_path("/视频/1#2"), "/%E8%A7%86%E9%A2%91/1%232");
        assert_eq!(encode_path("/a?b/c d/"), "/a%3Fb/c%20d/");
        assert_eq!(encode_path(""), "");
    }
}
