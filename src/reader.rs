//! Chunked Range Reader
//!
//! A session bound to one open of a logical file. Physical chunks are fetched
//! lazily, strictly in ascending order, and only once the previous chunk's bytes
//! have all been handed out.
//!
//! # State machine
//!
//! ```text
//! Open --read--> Reading --(cursor past last chunk)--> EOF
//!   |               |                                   |
//!   +----close------+---------------close---------------+--> Closed
//! ```
//!
//! Every `read` and `close` runs under one session lock, so a `close` issued
//! while a `read` is still fetching waits for that read to finish.

use crate::chunk_index::ChunkIndex;
use crate::error::{ChunkError, Result};
use crate::fetcher::{fetch_with_retry, ChunkFetcher, RetryPolicy};
use crate::integrity::IntegrityVerifier;
use crate::metrics::ReaderMetrics;
use crate::models::ChunkPlan;
use bytes::{Buf, Bytes};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct SessionState {
    /// Next chunk to fetch
    chunk_cursor: usize,
    /// Undelivered tail of the most recently fetched chunk
    remainder: Bytes,
    /// Bytes still to drop before the first delivered byte
    skip: u64,
    closed: bool,
    verifier: Option<IntegrityVerifier>,
    /// Logical offset the session was opened at
    start: u64,
    /// Bytes handed to the caller so far
    delivered: u64,
}

/// Byte-range reader over a logical file stored as physical chunks
pub struct ChunkedRangeReader {
    index: Arc<ChunkIndex>,
    addresses: Arc<Vec<String>>,
    fetcher: Arc<dyn ChunkFetcher>,
    retry_policy: RetryPolicy,
    needs_proxy: bool,
    cancel: CancellationToken,
    metrics: Option<Arc<ReaderMetrics>>,
    state: Mutex<SessionState>,
}

impl ChunkedRangeReader {
    /// Create a session positioned at the start of the file
    ///
    /// # Arguments
    /// * `index` - Extents of every physical chunk
    /// * `addresses` - Backend address of each chunk, in index order
    /// * `fetcher` - Backend capability used to fetch chunks
    ///
    /// # Returns
    /// * `Err(ChunkError::InternalError)` if addresses and index disagree in length
    pub fn new(
        index: Arc<ChunkIndex>,
        addresses: Arc<Vec<String>>,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Result<Self> {
        if addresses.len() != index.len() {
            return Err(ChunkError::InternalError(format!(
                "{} chunk addresses for {} indexed chunks",
                addresses.len(),
                index.len()
            )));
        }

        Ok(ChunkedRangeReader {
            index,
            addresses,
            fetcher,
            retry_policy: RetryPolicy::default(),
            needs_proxy: false,
            cancel: CancellationToken::new(),
            metrics: None,
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Create a session for a resolved chunk plan
    ///
    /// The retry policy follows the plan's routing and an integrity verifier is
    /// attached when the plan records a digest.
    pub fn from_plan(plan: &ChunkPlan, fetcher: Arc<dyn ChunkFetcher>) -> Result<Self> {
        let index = Arc::new(ChunkIndex::try_build(&plan.sizes())?);
        let addresses = Arc::new(plan.chunks.iter().map(|c| c.address.clone()).collect());

        let mut reader = Self::new(index, addresses, fetcher)?
            .with_proxy(plan.needs_proxy)
            .with_retry_policy(RetryPolicy::for_route(plan.needs_proxy));

        if let Some(digest) = &plan.expected_digest {
            reader = reader.with_verifier(IntegrityVerifier::new(digest.algorithm, &digest.hex)?);
        }
        Ok(reader)
    }

    /// Start delivering at logical offset `start`
    ///
    /// # Returns
    /// * `Err(ChunkError::InvalidRange)` if `start` is at or beyond the end of a
    ///   non-empty file
    pub fn with_skip(mut self, start: u64) -> Result<Self> {
        let total = self.index.total_size();
        if start > 0 && start >= total {
            return Err(ChunkError::InvalidRange(format!(
                "Range start {} is beyond file size {}",
                start, total
            )));
        }

        // Chunks wholly before `start` are never fetched
        let (cursor, skip) = self.index.locate(start).unwrap_or((0, 0));
        let state = self.state.get_mut();
        state.chunk_cursor = cursor;
        state.skip = skip;
        state.start = start;
        Ok(self)
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_proxy(mut self, needs_proxy: bool) -> Self {
        self.needs_proxy = needs_proxy;
        self
    }

    /// Abort in-flight and future fetches once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Verify the delivered bytes at close
    pub fn with_verifier(mut self, verifier: IntegrityVerifier) -> Self {
        self.state.get_mut().verifier = Some(verifier);
        self
    }

    /// Record into `metrics`; the session counts as opened from here on
    pub fn with_metrics(mut self, metrics: Arc<ReaderMetrics>) -> Self {
        metrics.record_session_opened();
        self.metrics = Some(metrics);
        self
    }

    /// Logical file size
    pub fn total_size(&self) -> u64 {
        self.index.total_size()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Logical offset of the next byte to be delivered
    pub async fn position(&self) -> u64 {
        let state = self.state.lock().await;
        state.start + state.delivered
    }

    /// Read up to `buf.len()` bytes
    ///
    /// # Returns
    /// * `Ok(0)` at end of file (or for an empty `buf`)
    /// * `Ok(n)` with `n` bytes copied into `buf`
    /// * `Err(ChunkError::SessionClosed)` after `close`
    /// * `Err(ChunkError::ChunkFetchFailed)` if a chunk could not be fetched
    /// * `Err(ChunkError::Cancelled)` if the session's token fired mid-fetch
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ChunkError::SessionClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // Whole chunks covered by the pending skip are never fetched
        while state.skip > 0 {
            let descriptor = self.index.get(state.chunk_cursor).ok_or_else(|| {
                ChunkError::InvalidRange(format!(
                    "Skip runs {} bytes past the end of a {} byte file",
                    state.skip,
                    self.index.total_size()
                ))
            })?;
            if state.skip < descriptor.size {
                break;
            }
            state.skip -= descriptor.size;
            state.chunk_cursor += 1;
        }

        while state.remainder.is_empty() {
            let index = state.chunk_cursor;
            let Some(descriptor) = self.index.get(index).copied() else {
                return Ok(0);
            };
            if descriptor.size == 0 {
                state.chunk_cursor += 1;
                continue;
            }

            let address = &self.addresses[index];
            let mut data = fetch_with_retry(
                self.fetcher.as_ref(),
                address,
                self.needs_proxy,
                &self.retry_policy,
                &self.cancel,
                self.metrics.as_deref(),
            )
            .await?;

            if data.len() as u64 != descriptor.size {
                warn!(
                    "Chunk {} ({}) returned {} bytes, expected {}",
                    index,
                    address,
                    data.len(),
                    descriptor.size
                );
                return Err(ChunkError::ChunkSizeMismatch {
                    index,
                    expected: descriptor.size,
                    actual: data.len() as u64,
                });
            }

            state.chunk_cursor += 1;
            if state.skip > 0 {
                // skip < descriptor.size after the skip phase
                data.advance(state.skip as usize);
                debug!("Dropped {} leading bytes of chunk {}", state.skip, index);
                state.skip = 0;
            }
            state.remainder = data;
        }

        let n = buf.len().min(state.remainder.len());
        buf[..n].copy_from_slice(&state.remainder[..n]);
        state.remainder.advance(n);

        if let Some(verifier) = state.verifier.as_mut() {
            verifier.update(&buf[..n]);
        }
        state.delivered += n as u64;
        if let Some(metrics) = &self.metrics {
            metrics.record_bytes_delivered(n as u64);
        }

        Ok(n)
    }

    /// Close the session
    ///
    /// Idempotent: later calls return `Ok(())`. When a verifier is attached and
    /// the whole file was delivered from offset 0, the digest is checked here.
    /// The session is closed even when that check fails.
    ///
    /// # Returns
    /// * `Err(ChunkError::IntegrityCheckFailed)` on digest mismatch
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }

        state.closed = true;
        state.remainder = Bytes::new();
        if let Some(metrics) = &self.metrics {
            metrics.record_session_closed();
        }

        let complete = state.start == 0 && state.delivered == self.index.total_size();
        info!(
            "Closing chunked session: delivered {} bytes from offset {} ({} chunks fetched)",
            state.delivered,
            state.start,
            state.chunk_cursor.min(self.index.len())
        );

        match state.verifier.take() {
            Some(verifier) if complete => verifier.verify().map_err(|e| {
                warn!("Integrity check failed: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_integrity_failure();
                }
                e
            }),
            Some(verifier) => {
                debug!(
                    "Skipping {} integrity check, only {} of {} bytes delivered",
                    verifier.algorithm(),
                    verifier.bytes_hashed(),
                    self.index.total_size()
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ChunkedRangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedRangeReader")
            .field("chunks", &self.index.len())
            .field("total_size", &self.index.total_size())
            .field("needs_proxy", &self.needs_proxy)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{digest_hex, HashAlgorithm};
    use crate::models::ChunkRef;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// In-memory backend recording which chunks were fetched
    struct MemoryFetcher {
        chunks: HashMap<String, Bytes>,
        fetched: StdMutex<Vec<String>>,
    }

    impl MemoryFetcher {
        fn new(plan: &ChunkPlan, data: &[&[u8]]) -> Self {
            let chunks = plan
                .chunks
                .iter()
                .zip(data)
                .map(|(c, d)| (c.address.clone(), Bytes::copy_from_slice(d)))
                .collect();
            MemoryFetcher {
                chunks,
                fetched: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChunkFetcher for MemoryFetcher {
        async fn fetch_chunk(&self, address: &str, _needs_proxy: bool) -> Result<Bytes> {
            self.fetched.lock().unwrap().push(address.to_string());
            self.chunks
                .get(address)
                .cloned()
                .ok_or_else(|| ChunkError::from_http_status(404, address.to_string()))
        }
    }

    fn plan_for(data: &[&[u8]]) -> ChunkPlan {
        ChunkPlan::new(
            data.iter()
                .enumerate()
                .map(|(i, d)| ChunkRef {
                    address: format!("/f.rclone_chunk.{:03}", i + 1),
                    size: d.len() as u64,
                })
                .collect(),
        )
    }

    fn reader_for(data: &[&[u8]]) -> (ChunkedRangeReader, Arc<MemoryFetcher>) {
        let plan = plan_for(data);
        let fetcher = Arc::new(MemoryFetcher::new(&plan, data));
        let reader = ChunkedRangeReader::from_plan(&plan, fetcher.clone())
            .unwrap()
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)));
        (reader, fetcher)
    }

    async fn read_all(reader: &ChunkedRangeReader, buf_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; buf_size];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_reads_whole_file_in_order() {
        let (reader, _) = reader_for(&[b"hello ", b"chunked ", b"world"]);
        let data = read_all(&reader, 4).await.unwrap();
        assert_eq!(data, b"hello chunked world");
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_never_spans_two_chunks() {
        let (reader, _) = reader_for(&[b"abc", b"def"]);
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"def");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_skip_does_not_fetch_skipped_chunks() {
        let (reader, fetcher) = reader_for(&[b"0123", b"4567", b"89"]);
        let reader = reader.with_skip(5).unwrap();

        let data = read_all(&reader, 8).await.unwrap();
        assert_eq!(data, b"56789");
        assert_eq!(
            *fetcher.fetched.lock().unwrap(),
            vec!["/f.rclone_chunk.002".to_string(), "/f.rclone_chunk.003".to_string()]
        );
    }

    #[tokio::test]
    async fn test_skip_to_chunk_boundary() {
        let (reader, fetcher) = reader_for(&[b"0123", b"4567"]);
        let reader = reader.with_skip(4).unwrap();
        assert_eq!(read_all(&reader, 3).await.unwrap(), b"4567");
        assert_eq!(fetcher.fetched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_beyond_end_is_invalid_range() {
        let (reader, _) = reader_for(&[b"0123"]);
        assert!(matches!(reader.with_skip(4), Err(ChunkError::InvalidRange(_))));
    }

    #[tokio::test]
    async fn test_zero_size_chunks_are_skipped() {
        let (reader, fetcher) = reader_for(&[b"ab", b"", b"cd"]);
        assert_eq!(read_all(&reader, 10).await.unwrap(), b"abcd");
        assert_eq!(fetcher.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_file_reads_eof() {
        let (reader, _) = reader_for(&[]);
        let reader = reader.with_skip(0).unwrap();
        assert_eq!(read_all(&reader, 10).await.unwrap(), Vec::<u8>::new());
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_after_close_fails() {
        let (reader, _) = reader_for(&[b"abc"]);
        reader.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(reader.read(&mut buf).await, Err(ChunkError::SessionClosed)));
        assert!(reader.is_closed().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_after_fetch_failure() {
        let plan = plan_for(&[b"abc"]);
        let fetcher = Arc::new(MemoryFetcher {
            chunks: HashMap::new(),
            fetched: StdMutex::new(Vec::new()),
        });
        let reader = ChunkedRangeReader::from_plan(&plan, fetcher)
            .unwrap()
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)));

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ChunkError::ChunkFetchFailed { status: Some(404), attempts: 3, .. }));

        assert!(reader.close().await.is_ok());
        assert!(reader.close().await.is_ok());
        assert!(reader.is_closed().await);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_reported() {
        let plan = ChunkPlan::new(vec![ChunkRef {
            address: "/short".to_string(),
            size: 10,
        }]);
        let fetcher = Arc::new(MemoryFetcher::new(&plan, &[b"tiny"]));
        let reader = ChunkedRangeReader::from_plan(&plan, fetcher).unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(ChunkError::ChunkSizeMismatch { index: 0, expected: 10, actual: 4 })
        ));
    }

    #[tokio::test]
    async fn test_integrity_verified_over_delivered_bytes() {
        let data: [&[u8]; 2] = [b"integrity ", b"matters"];
        let plan = plan_for(&data).with_digest(
            HashAlgorithm::Sha1,
            digest_hex(HashAlgorithm::Sha1, b"integrity matters"),
        );
        let fetcher = Arc::new(MemoryFetcher::new(&plan, &data));
        let reader = ChunkedRangeReader::from_plan(&plan, fetcher).unwrap();

        read_all(&reader, 3).await.unwrap();
        assert!(reader.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_integrity_mismatch_still_closes() {
        let data: [&[u8]; 1] = [b"corrupted"];
        let plan = plan_for(&data).with_digest(
            HashAlgorithm::Md5,
            digest_hex(HashAlgorithm::Md5, b"original!"),
        );
        let fetcher = Arc::new(MemoryFetcher::new(&plan, &data));
        let metrics = Arc::new(ReaderMetrics::new());
        let reader = ChunkedRangeReader::from_plan(&plan, fetcher)
            .unwrap()
            .with_metrics(metrics.clone());

        read_all(&reader, 64).await.unwrap();
        assert!(matches!(
            reader.close().await,
            Err(ChunkError::IntegrityCheckFailed { .. })
        ));
        assert!(reader.is_closed().await);
        assert!(reader.close().await.is_ok());
        assert_eq!(metrics.get_stats().integrity_failures, 1);
        assert_eq!(metrics.get_stats().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_partial_read_skips_integrity_check() {
        let data: [&[u8]; 2] = [b"first", b"second"];
        let plan = plan_for(&data).with_digest(
            HashAlgorithm::Sha256,
            digest_hex(HashAlgorithm::Sha256, b"firstsecond"),
        );
        let fetcher = Arc::new(MemoryFetcher::new(&plan, &data));
        let reader = ChunkedRangeReader::from_plan(&plan, fetcher).unwrap();

        let mut buf = [0u8; 2];
        reader.read(&mut buf).await.unwrap();
        assert!(reader.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_position_tracks_delivery() {
        let (reader, _) = reader_for(&[b"0123", b"4567"]);
        let reader = reader.with_skip(2).unwrap();
        assert_eq!(reader.position().await, 2);

        let mut buf = [0u8; 1];
        reader.read(&mut buf).await.unwrap();
        assert_eq!(reader.position().await, 3);
    }

    #[test]
    fn test_mismatched_addresses_rejected() {
        let index = Arc::new(ChunkIndex::build(&[1, 2]));
        let fetcher: Arc<dyn ChunkFetcher> = Arc::new(MemoryFetcher {
            chunks: HashMap::new(),
            fetched: StdMutex::new(Vec::new()),
        });
        let result = ChunkedRangeReader::new(index, Arc::new(vec!["/a".to_string()]), fetcher);
        assert!(result.is_err());
    }
}
