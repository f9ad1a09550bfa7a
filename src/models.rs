//! Core data models for chunked logical files

use crate::error::{ChunkError, Result};
use crate::integrity::HashAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extent of one physical chunk inside the logical file
///
/// The extent is half-open: `[position, position + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Offset of the first byte of this chunk in the logical file
    pub position: u64,
    /// Number of bytes stored in this chunk
    pub size: u64,
}

impl ChunkDescriptor {
    pub fn new(position: u64, size: u64) -> Self {
        ChunkDescriptor { position, size }
    }

    /// Offset one past the last byte of this chunk
    pub fn end(&self) -> u64 {
        self.position.saturating_add(self.size)
    }

    /// Whether `offset` falls inside this chunk
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.position && offset < self.end()
    }
}

/// A requested range of a logical file
///
/// `length == None` means "until the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte requested
    pub start: u64,
    /// Number of bytes requested, or `None` for the rest of the file
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, length: Option<u64>) -> Self {
        ByteRange { start, length }
    }

    /// The whole file
    pub fn full() -> Self {
        ByteRange { start: 0, length: None }
    }

    /// Build a range from the signed wire form where a negative length means
    /// "to end of file"
    pub fn from_signed(start: i64, length: i64) -> Result<Self> {
        if start < 0 {
            return Err(ChunkError::InvalidRange(format!(
                "start must not be negative, got {}",
                start
            )));
        }
        let length = if length < 0 { None } else { Some(length as u64) };
        Ok(ByteRange::new(start as u64, length))
    }

    /// Parse a single-range HTTP Range header value
    ///
    /// Accepts `bytes=start-end` and the open form `bytes=start-`.
    pub fn from_header(header: &str) -> Result<Self> {
        let header = header.trim();

        let range_part = header.strip_prefix("bytes=").ok_or_else(|| {
            ChunkError::ParseError(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        let (start, end) = range_part.split_once('-').ok_or_else(|| {
            ChunkError::ParseError(format!(
                "Invalid range format, expected 'start-end', got: {}",
                range_part
            ))
        })?;

        let start = start
            .trim()
            .parse::<u64>()
            .map_err(|e| ChunkError::ParseError(format!("Invalid start value: {}", e)))?;

        let end = end.trim();
        if end.is_empty() {
            return Ok(ByteRange::new(start, None));
        }

        let end = end
            .parse::<u64>()
            .map_err(|e| ChunkError::ParseError(format!("Invalid end value: {}", e)))?;
        if end < start {
            return Err(ChunkError::InvalidRange(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }

        Ok(ByteRange::new(start, Some((end - start).saturating_add(1))))
    }

    /// Number of bytes this range yields against a file of `file_size` bytes
    pub fn effective_length(&self, file_size: u64) -> u64 {
        let available = file_size.saturating_sub(self.start);
        match self.length {
            Some(length) => length.min(available),
            None => available,
        }
    }
}

/// One entry of a backend directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalEntry {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub is_dir: bool,
}

impl PhysicalEntry {
    /// A plain file entry with both timestamps set to `time`
    pub fn file(name: impl Into<String>, size: u64, time: DateTime<Utc>) -> Self {
        PhysicalEntry {
            name: name.into(),
            size,
            modified: time,
            created: time,
            is_dir: false,
        }
    }

    /// A directory entry with both timestamps set to `time`
    pub fn dir(name: impl Into<String>, time: DateTime<Utc>) -> Self {
        PhysicalEntry {
            name: name.into(),
            size: 0,
            modified: time,
            created: time,
            is_dir: true,
        }
    }
}

/// A client-visible entry after fragments have been merged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalEntry {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub is_folder: bool,
}

impl From<&PhysicalEntry> for LogicalEntry {
    fn from(entry: &PhysicalEntry) -> Self {
        LogicalEntry {
            name: entry.name.clone(),
            // directories report no size of their own
            size: if entry.is_dir { 0 } else { entry.size },
            modified: entry.modified,
            created: entry.created,
            is_folder: entry.is_dir,
        }
    }
}

/// Address and size of one physical chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub address: String,
    pub size: u64,
}

/// Digest the fully delivered logical file must match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedDigest {
    pub algorithm: HashAlgorithm,
    /// Hex-encoded digest
    pub hex: String,
}

/// Everything needed to read one logical file, resolved at link time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    /// Physical chunks in concatenation order
    pub chunks: Vec<ChunkRef>,
    #[serde(default)]
    pub expected_digest: Option<ExpectedDigest>,
    /// Whether fetches have to go through the proxy route
    #[serde(default)]
    pub needs_proxy: bool,
}

impl ChunkPlan {
    pub fn new(chunks: Vec<ChunkRef>) -> Self {
        ChunkPlan {
            chunks,
            expected_digest: None,
            needs_proxy: false,
        }
    }

    /// Build a plan from an explicit list of chunk sizes recorded as metadata,
    /// pairing each size with its address
    pub fn from_sizes(addresses: Vec<String>, sizes: &[u64]) -> Result<Self> {
        if addresses.len() != sizes.len() {
            return Err(ChunkError::ParseError(format!(
                "{} chunk addresses but {} chunk sizes",
                addresses.len(),
                sizes.len()
            )));
        }
        let chunks = addresses
            .into_iter()
            .zip(sizes.iter().copied())
            .map(|(address, size)| ChunkRef { address, size })
            .collect();
        let plan = ChunkPlan::new(chunks);
        plan.validate()?;
        Ok(plan)
    }

    /// Decode a plan stored as JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: ChunkPlan = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Check that the chunk sizes add up to a representable file size
    ///
    /// # Returns
    /// * `Ok(u64)` with the logical file size
    /// * `Err(ChunkError::ParseError)` if the sizes overflow `u64`
    pub fn validate(&self) -> Result<u64> {
        self.chunks.iter().try_fold(0u64, |total, chunk| {
            total.checked_add(chunk.size).ok_or_else(|| {
                ChunkError::ParseError(format!(
                    "chunk sizes overflow at {} ({} bytes)",
                    chunk.address, chunk.size
                ))
            })
        })
    }

    pub fn with_digest(mut self, algorithm: HashAlgorithm, hex: impl Into<String>) -> Self {
        self.expected_digest = Some(ExpectedDigest {
            algorithm,
            hex: hex.into(),
        });
        self
    }

    pub fn with_proxy(mut self, needs_proxy: bool) -> Self {
        self.needs_proxy = needs_proxy;
        self
    }

    /// Chunk sizes in concatenation order
    pub fn sizes(&self) -> Vec<u64> {
        self.chunks.iter().map(|c| c.size).collect()
    }

    /// Logical file size, saturating for plans that fail [`ChunkPlan::validate`]
    pub fn total_size(&self) -> u64 {
        self.chunks
            .iter()
            .fold(0u64, |total, c| total.saturating_add(c.size))
    }
}

/// How the chunks of a logical file are recorded, before a connector turns
/// the record into a [`ChunkPlan`]
///
/// Addresses and directories are relative to the connector's remote path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanLayout {
    /// Explicit chunk addresses with their sizes
    Chunks { chunks: Vec<ChunkRef> },
    /// Fixed-size parts of a file whose total size is known
    Uniform { parts: Vec<String>, size: u64 },
    /// A directory listing holding the fragments of `name`
    Listing {
        directory: String,
        name: String,
        entries: Vec<PhysicalEntry>,
    },
}

/// Chunk layout of a logical file plus the metadata recorded alongside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSource {
    #[serde(flatten)]
    pub layout: PlanLayout,
    /// Hex digest of the whole file
    #[serde(default)]
    pub digest: Option<String>,
    /// Algorithm of `digest`, the connector's default when absent
    #[serde(default)]
    pub digest_algorithm: Option<HashAlgorithm>,
    #[serde(default)]
    pub needs_proxy: bool,
}

impl PlanSource {
    pub fn new(layout: PlanLayout) -> Self {
        PlanSource {
            layout,
            digest: None,
            digest_algorithm: None,
            needs_proxy: false,
        }
    }

    /// Decode a plan source stored as JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
