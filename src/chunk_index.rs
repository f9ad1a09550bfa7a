//! Chunk Index
//!
//! Maps physical chunk sizes to their positions in the logical file

use crate::error::{ChunkError, Result};
use crate::fragment::MAX_SAFE_CHUNK_NUMBER;
use crate::models::ChunkDescriptor;
use tracing::debug;

/// Ordered, contiguous extents of every physical chunk of one logical file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkIndex {
    descriptors: Vec<ChunkDescriptor>,
    total_size: u64,
}

impl ChunkIndex {
    /// Build the index from chunk sizes in concatenation order
    ///
    /// Positions are cumulative: chunk `i` starts where chunk `i - 1` ends.
    /// Zero-size chunks are kept so indices line up with chunk addresses.
    /// Positions saturate at `u64::MAX`; use [`ChunkIndex::try_build`] for sizes
    /// that have not been validated.
    pub fn build(sizes: &[u64]) -> Self {
        let mut descriptors = Vec::with_capacity(sizes.len());
        let mut position = 0u64;

        for &size in sizes {
            descriptors.push(ChunkDescriptor::new(position, size));
            position = position.saturating_add(size);
        }

        debug!(
            "Built chunk index: {} chunks, {} bytes",
            descriptors.len(),
            position
        );

        ChunkIndex {
            descriptors,
            total_size: position,
        }
    }

    /// Build the index, rejecting sizes whose sum does not fit in `u64`
    pub fn try_build(sizes: &[u64]) -> Result<Self> {
        sizes.iter().try_fold(0u64, |total, &size| {
            total.checked_add(size).ok_or_else(|| {
                ChunkError::ParseError(format!(
                    "{} chunk sizes add up past {} bytes",
                    sizes.len(),
                    u64::MAX
                ))
            })
        })?;
        Ok(Self::build(sizes))
    }

    /// Index for a file uploaded in fixed `part_size` parts, where only the last
    /// part may be shorter
    ///
    /// # Returns
    /// * `Err(ChunkError::ConfigError)` if `part_size` is 0
    /// * `Err(ChunkError::ParseError)` if the file would need more than
    ///   [`MAX_SAFE_CHUNK_NUMBER`] parts
    pub fn uniform(total_size: u64, part_size: u64) -> Result<Self> {
        if part_size == 0 {
            return Err(ChunkError::ConfigError(
                "part_size must be greater than 0".to_string(),
            ));
        }

        let parts = total_size.div_ceil(part_size);
        if parts > MAX_SAFE_CHUNK_NUMBER {
            return Err(ChunkError::ParseError(format!(
                "{} bytes in {} byte parts needs {} parts, limit is {}",
                total_size, part_size, parts, MAX_SAFE_CHUNK_NUMBER
            )));
        }

        let full_parts = usize::try_from(total_size / part_size)
            .map_err(|e| ChunkError::ParseError(format!("Too many parts: {}", e)))?;
        let remainder = total_size % part_size;

        let mut sizes = vec![part_size; full_parts];
        if remainder > 0 {
            sizes.push(remainder);
        }
        Ok(Self::build(&sizes))
    }

    /// Number of chunks, including zero-size ones
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Logical file size
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn get(&self, index: usize) -> Option<&ChunkDescriptor> {
        self.descriptors.get(index)
    }

    pub fn descriptors(&self) -> &[ChunkDescriptor] {
        &self.descriptors
    }

    /// Find the chunk holding byte `offset`
    ///
    /// # Returns
    /// `(chunk index, offset within that chunk)`, or `None` when `offset` is at
    /// or past the end of the file. Zero-size chunks are never returned.
    pub fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        if offset >= self.total_size {
            return None;
        }

        // First chunk whose end lies beyond offset; zero-size chunks end where
        // they start so they are skipped naturally.
        let index = self.descriptors.partition_point(|d| d.end() <= offset);
        let descriptor = self.descriptors.get(index).filter(|d| d.contains(offset))?;
        Some((index, offset - descriptor.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_cumulative_positions() {
        let index = ChunkIndex::build(&[100, 50, 25]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(0), Some(&ChunkDescriptor::new(0, 100)));
        assert_eq!(index.get(1), Some(&ChunkDescriptor::new(100, 50)));
        assert_eq!(index.get(2), Some(&ChunkDescriptor::new(150, 25)));
        assert_eq!(index.total_size(), 175);
    }

    #[test]
    fn test_build_empty() {
        let index = ChunkIndex::build(&[]);
        assert!(index.is_empty());
        assert_eq!(index.total_size(), 0);
        assert_eq!(index.locate(0), None);
    }

    #[test]
    fn test_build_keeps_zero_size_chunks() {
        let index = ChunkIndex::build(&[10, 0, 5]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(1), Some(&ChunkDescriptor::new(10, 0)));
        assert_eq!(index.get(2), Some(&ChunkDescriptor::new(10, 5)));
    }

    #[test]
    fn test_uniform_with_remainder() {
        let index = ChunkIndex::uniform(2500, 1000).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(2), Some(&ChunkDescriptor::new(2000, 500)));
        assert_eq!(index.total_size(), 2500);
    }

    #[test]
    fn test_uniform_exact_multiple() {
        let index = ChunkIndex::uniform(3000, 1000).unwrap();
        assert_eq!(index.len(), 3);
        assert!(index.descriptors().iter().all(|d| d.size == 1000));
    }

    #[test]
    fn test_uniform_rejects_zero_part_size() {
        assert!(ChunkIndex::uniform(100, 0).is_err());
    }

    #[test]
    fn test_uniform_caps_part_count() {
        let result = ChunkIndex::uniform(u64::MAX, 1);
        assert!(matches!(result, Err(ChunkError::ParseError(_))));

        let result = ChunkIndex::uniform(MAX_SAFE_CHUNK_NUMBER * 1000 + 1, 1000);
        assert!(matches!(result, Err(ChunkError::ParseError(_))));

        let index = ChunkIndex::uniform(MAX_SAFE_CHUNK_NUMBER * 1000, 1_000_000).unwrap();
        assert_eq!(index.len() as u64, MAX_SAFE_CHUNK_NUMBER / 1000);
    }

    #[test]
    fn test_try_build_rejects_overflow() {
        let result = ChunkIndex::try_build(&[u64::MAX, 1]);
        assert!(matches!(result, Err(ChunkError::ParseError(_))));

        let index = ChunkIndex::build(&[u64::MAX, 1]);
        assert_eq!(index.total_size(), u64::MAX);

        assert_eq!(ChunkIndex::try_build(&[3, 4]).unwrap(), ChunkIndex::build(&[3, 4]));
    }

    #[test]
    fn test_locate() {
        let index = ChunkIndex::build(&[100, 0, 50]);
        assert_eq!(index.locate(0), Some((0, 0)));
        assert_eq!(index.locate(99), Some((0, 99)));
        assert_eq!(index.locate(100), Some((2, 0)));
        assert_eq!(index.locate(149), Some((2, 49)));
        assert_eq!(index.locate(150), None);
    }

    #[test]
    fn test_descriptors_are_contiguous() {
        let index = ChunkIndex::build(&[7, 3, 0, 11, 1]);
        let descriptors = index.descriptors();
        assert_eq!(descriptors[0].position, 0);
        for pair in descriptors.windows(2) {
            assert_eq!(pair[0].end(), pair[1].position);
        }
        assert_eq!(descriptors.last().unwrap().end(), index.total_size());
    }
}
