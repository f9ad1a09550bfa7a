//! Range-Stream Adapter
//!
//! Turns a requested byte range of a chunked logical file into a bounded
//! stream plus a release handle for the file-serving layer.

use crate::chunk_index::ChunkIndex;
use crate::error::{ChunkError, Result};
use crate::fetcher::{ChunkFetcher, RetryPolicy};
use crate::integrity::IntegrityVerifier;
use crate::metrics::ReaderMetrics;
use crate::models::{ByteRange, ChunkPlan, ExpectedDigest};
use crate::reader::ChunkedRangeReader;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Something that must be released once a response is finished
#[async_trait]
pub trait Release: Send + Sync {
    async fn release(&self) -> Result<()>;
}

#[async_trait]
impl Release for ChunkedRangeReader {
    async fn release(&self) -> Result<()> {
        self.close().await
    }
}

/// Resources to release when serving a response finishes
///
/// Clones share the same set. `release` closes every registered resource
/// exactly once; calling it again only releases what was added since.
#[derive(Clone, Default)]
pub struct ReleaseSet {
    resources: Arc<Mutex<Vec<Arc<dyn Release>>>>,
}

impl ReleaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, resource: Arc<dyn Release>) {
        self.lock().push(resource);
    }

    /// Number of resources still waiting to be released
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Release everything registered so far
    ///
    /// Every resource is released even if an earlier one fails; the first
    /// failure is returned.
    pub async fn release(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.lock());

        let mut first_error = None;
        for resource in pending {
            if let Err(e) = resource.release().await {
                warn!("Failed to release resource: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Release>>> {
        // A panic while holding this lock cannot leave the Vec half-updated
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ReleaseSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseSet").field("pending", &self.len()).finish()
    }
}

/// Bounded byte stream over one reader session
#[derive(Debug)]
pub struct RangeStream {
    reader: Arc<ChunkedRangeReader>,
    /// Bytes left before the range is exhausted, `None` for "until EOF"
    remaining: Option<u64>,
}

impl RangeStream {
    pub fn new(reader: Arc<ChunkedRangeReader>, length: Option<u64>) -> Self {
        RangeStream {
            reader,
            remaining: length,
        }
    }

    /// Bytes left in the range, if bounded
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// Read up to `buf.len()` bytes, never past the end of the range
    ///
    /// # Returns
    /// `Ok(0)` once the range or the file is exhausted
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let limit = match self.remaining {
            Some(0) => return Ok(0),
            Some(remaining) => buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => buf.len(),
        };

        let n = self.reader.read(&mut buf[..limit]).await?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= n as u64;
        }
        Ok(n)
    }

    /// Drain the rest of the range into memory
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Convert into a stream of byte blocks of at most `block_size` bytes
    ///
    /// The stream ends after the first error.
    pub fn into_byte_stream(self, block_size: usize) -> impl Stream<Item = Result<Bytes>> + Send {
        let block_size = block_size.max(1);
        stream::unfold(Some(self), move |state| async move {
            let Some(mut range_stream) = state else {
                return None;
            };
            let mut buf = vec![0u8; block_size];
            match range_stream.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(range_stream)))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// A resolved chunked file that byte ranges can be opened against
///
/// One link serves any number of concurrent opens; each open is an
/// independent reader session.
pub struct ChunkedLink {
    index: Arc<ChunkIndex>,
    addresses: Arc<Vec<String>>,
    fetcher: Arc<dyn ChunkFetcher>,
    retry_policy: RetryPolicy,
    needs_proxy: bool,
    expected_digest: Option<ExpectedDigest>,
    verify: bool,
    metrics: Option<Arc<ReaderMetrics>>,
}

impl ChunkedLink {
    /// Resolve a link for `plan`
    ///
    /// # Returns
    /// * `Err(ChunkError::ParseError)` if the plan's chunk sizes overflow
    pub fn new(plan: &ChunkPlan, fetcher: Arc<dyn ChunkFetcher>) -> Result<Self> {
        Ok(ChunkedLink {
            index: Arc::new(ChunkIndex::try_build(&plan.sizes())?),
            addresses: Arc::new(plan.chunks.iter().map(|c| c.address.clone()).collect()),
            fetcher,
            retry_policy: RetryPolicy::for_route(plan.needs_proxy),
            needs_proxy: plan.needs_proxy,
            expected_digest: plan.expected_digest.clone(),
            verify: true,
            metrics: None,
        })
    }

    /// Turn digest verification of whole-file reads on or off
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ReaderMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Logical file size
    pub fn size(&self) -> u64 {
        self.index.total_size()
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Open `range` as a bounded stream
    ///
    /// A length reaching past the end of the file is served to EOF. The
    /// returned release set holds the new session; releasing it closes the
    /// session and runs integrity verification when the range was the whole
    /// file.
    ///
    /// # Returns
    /// * `Err(ChunkError::InvalidRange)` if `range.start` is beyond the file
    pub fn open(
        &self,
        range: ByteRange,
        cancel: CancellationToken,
    ) -> Result<(RangeStream, ReleaseSet)> {
        let size = self.size();
        let length = match range.length {
            Some(length) if range.start.saturating_add(length) >= size => None,
            other => other,
        };

        let mut reader = ChunkedRangeReader::new(
            Arc::clone(&self.index),
            Arc::clone(&self.addresses),
            Arc::clone(&self.fetcher),
        )?
        .with_skip(range.start)?
        .with_proxy(self.needs_proxy)
        .with_retry_policy(self.retry_policy.clone())
        .with_cancellation(cancel);

        if let Some(digest) = self.expected_digest.as_ref().filter(|_| self.verify) {
            if range.start == 0 && length.is_none() {
                reader = reader.with_verifier(IntegrityVerifier::new(digest.algorithm, &digest.hex)?);
            }
        }
        if let Some(metrics) = &self.metrics {
            reader = reader.with_metrics(Arc::clone(metrics));
        }

        debug!(
            "Opened range start={} length={:?} over {} chunks ({} bytes)",
            range.start,
            length,
            self.index.len(),
            size
        );

        let reader = Arc::new(reader);
        let releases = ReleaseSet::new();
        releases.add(reader.clone());
        Ok((RangeStream::new(reader, length), releases))
    }
}

impl std::fmt::Debug for ChunkedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedLink")
            .field("chunks", &self.index.len())
            .field("size", &self.index.total_size())
            .field("needs_proxy", &self.needs_proxy)
            .finish()
    }
}
