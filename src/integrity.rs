//! End-to-end integrity verification of delivered bytes
//!
//! A verifier hashes exactly the bytes handed to the caller, in order, and
//! compares the final digest against the expected value using lowercase hex on
//! both sides.

use crate::error::{ChunkError, Result};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Digest algorithms a chunk plan may record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Length of the hex-encoded digest
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(ChunkError::ConfigError(format!(
                "Unknown hash algorithm '{}', must be 'md5', 'sha1' or 'sha256'",
                other
            ))),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Running digest over a session's delivered bytes
pub struct IntegrityVerifier {
    algorithm: HashAlgorithm,
    expected_hex: String,
    hasher: Hasher,
    bytes_hashed: u64,
}

impl fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityVerifier")
            .field("algorithm", &self.algorithm)
            .field("expected_hex", &self.expected_hex)
            .field("bytes_hashed", &self.bytes_hashed)
            .finish()
    }
}

impl IntegrityVerifier {
    /// Create a verifier expecting `expected_hex` (case-insensitive)
    ///
    /// # Returns
    /// * `Err(ChunkError::ConfigError)` if the expected digest is not valid hex
    ///   of the algorithm's length
    pub fn new(algorithm: HashAlgorithm, expected_hex: &str) -> Result<Self> {
        let expected_hex = expected_hex.trim().to_ascii_lowercase();
        if expected_hex.len() != algorithm.hex_len() || hex::decode(&expected_hex).is_err() {
            return Err(ChunkError::ConfigError(format!(
                "Expected {} digest must be {} hex characters, got '{}'",
                algorithm,
                algorithm.hex_len(),
                expected_hex
            )));
        }

        Ok(IntegrityVerifier {
            algorithm,
            expected_hex,
            hasher: Hasher::new(algorithm),
            bytes_hashed: 0,
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Number of bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Feed bytes that were just delivered to the caller
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Finish hashing and compare against the expected digest
    pub fn verify(self) -> Result<()> {
        let actual = self.hasher.finalize_hex();
        if actual != self.expected_hex {
            return Err(ChunkError::IntegrityCheckFailed {
                expected: self.expected_hex,
                actual,
            });
        }
        Ok(())
    }
}

/// Hex digest of `data` under `algorithm`
pub fn digest_hex(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}
