//! Fragment Aggregator
//!
//! Reconciles a flat listing of physical objects into logical entries. Objects
//! named `<base>.<marker>.<ordinal>` are fragments of the logical file `<base>`;
//! everything else is passed through as-is.

use crate::error::{ChunkError, Result};
use crate::models::{ChunkPlan, ChunkRef, LogicalEntry, PhysicalEntry};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Marker used by rclone's chunker backend
pub const DEFAULT_FRAGMENT_MARKER: &str = "rclone_chunk";

/// Ordinals above this are not treated as fragments, so a crafted name cannot
/// make us plan millions of chunks
pub const MAX_SAFE_CHUNK_NUMBER: u64 = 10_000_000;

/// Matcher for the fragment naming convention
#[derive(Debug, Clone)]
pub struct FragmentPattern {
    marker: String,
    regex: Regex,
}

/// A listing entry recognised as a fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub base: &'a str,
    pub ordinal: u64,
    pub entry: &'a PhysicalEntry,
}

impl FragmentPattern {
    /// Create a pattern for `<base>.<marker>.<digits>`
    pub fn new(marker: &str) -> Result<Self> {
        if marker.is_empty() {
            return Err(ChunkError::ConfigError(
                "fragment marker must not be empty".to_string(),
            ));
        }

        let regex = Regex::new(&format!(r"^(.+)\.{}\.(\d+)$", regex::escape(marker)))
            .map_err(|e| ChunkError::ConfigError(format!("Invalid fragment marker: {}", e)))?;

        Ok(FragmentPattern {
            marker: marker.to_string(),
            regex,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Split a physical name into `(base, ordinal)` if it names a fragment
    pub fn parse<'a>(&self, name: &'a str) -> Option<(&'a str, u64)> {
        let captures = self.regex.captures(name)?;
        let base = captures.get(1)?.as_str();
        let ordinal = match captures.get(2)?.as_str().parse::<u64>() {
            Ok(n) if n <= MAX_SAFE_CHUNK_NUMBER => n,
            _ => {
                warn!("Ignoring fragment with oversized ordinal: {}", name);
                return None;
            }
        };
        Some((base, ordinal))
    }

    /// Name of fragment `ordinal` of `base`, zero-padded to three digits
    pub fn fragment_name(&self, base: &str, ordinal: u64) -> String {
        format!("{}.{}.{:03}", base, self.marker, ordinal)
    }
}

impl Default for FragmentPattern {
    fn default() -> Self {
        let regex = Regex::new(r"^(.+)\.rclone_chunk\.(\d+)$").expect("static fragment regex");
        FragmentPattern {
            marker: DEFAULT_FRAGMENT_MARKER.to_string(),
            regex,
        }
    }
}

/// Merges fragments of one logical file into a single entry
#[derive(Debug, Clone, Default)]
pub struct FragmentAggregator {
    pattern: FragmentPattern,
}

impl FragmentAggregator {
    pub fn new(pattern: FragmentPattern) -> Self {
        FragmentAggregator { pattern }
    }

    pub fn pattern(&self) -> &FragmentPattern {
        &self.pattern
    }

    /// All fragments in `entries`, sorted by base name and then ordinal
    pub fn fragments<'a>(&self, entries: &'a [PhysicalEntry]) -> Vec<Fragment<'a>> {
        let mut fragments: Vec<Fragment<'a>> = entries
            .iter()
            .filter(|entry| !entry.is_dir)
            .filter_map(|entry| {
                self.pattern
                    .parse(&entry.name)
                    .map(|(base, ordinal)| Fragment { base, ordinal, entry })
            })
            .collect();

        // Listing order is whatever the backend returned
        fragments.sort_by(|a, b| a.base.cmp(b.base).then(a.ordinal.cmp(&b.ordinal)));
        fragments
    }

    /// Turn a flat listing into logical entries
    ///
    /// Directories and non-fragment files pass through unchanged. Fragments of
    /// one base are merged: sizes are summed, the modified time is the latest
    /// and the created time the earliest across the group. Output is ordered by
    /// name, but callers should not rely on that.
    ///
    /// # Returns
    /// * `Err(ChunkError::NameCollision)` if a fragment group's base name is
    ///   also the name of a literal entry in the same listing
    pub fn aggregate(&self, entries: &[PhysicalEntry]) -> Result<Vec<LogicalEntry>> {
        let mut literals: BTreeMap<&str, LogicalEntry> = BTreeMap::new();
        for entry in entries {
            if entry.is_dir || self.pattern.parse(&entry.name).is_none() {
                literals.insert(entry.name.as_str(), LogicalEntry::from(entry));
            }
        }

        let mut groups: BTreeMap<&str, LogicalEntry> = BTreeMap::new();
        for fragment in self.fragments(entries) {
            if literals.contains_key(fragment.base) {
                warn!(
                    "Fragment {} collides with literal entry {}",
                    fragment.entry.name, fragment.base
                );
                return Err(ChunkError::NameCollision(fragment.base.to_string()));
            }

            match groups.get_mut(fragment.base) {
                Some(existing) => {
                    existing.size += fragment.entry.size;
                    existing.modified = existing.modified.max(fragment.entry.modified);
                    existing.created = existing.created.min(fragment.entry.created);
                }
                None => {
                    groups.insert(
                        fragment.base,
                        LogicalEntry {
                            name: fragment.base.to_string(),
                            size: fragment.entry.size,
                            modified: fragment.entry.modified,
                            created: fragment.entry.created,
                            is_folder: false,
                        },
                    );
                }
            }
        }

        debug!(
            "Aggregated {} physical entries into {} literal and {} chunked entries",
            entries.len(),
            literals.len(),
            groups.len()
        );

        let mut result: Vec<LogicalEntry> = literals.into_values().collect();
        result.extend(groups.into_values());
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    /// Fragments of one logical file in concatenation order
    pub fn fragments_of<'a>(
        &self,
        entries: &'a [PhysicalEntry],
        logical_name: &str,
    ) -> Vec<&'a PhysicalEntry> {
        self.fragments(entries)
            .into_iter()
            .filter(|f| f.base == logical_name)
            .map(|f| f.entry)
            .collect()
    }

    /// Resolve the chunk plan of `logical_name` from the listing of its parent
    /// container at `parent_address`
    ///
    /// A logical file without fragments but with a literal entry of that name
    /// is a one-chunk plan.
    ///
    /// # Returns
    /// * `Ok(None)` if the listing holds neither fragments nor a file by that name
    pub fn chunk_plan(
        &self,
        entries: &[PhysicalEntry],
        parent_address: &str,
        logical_name: &str,
    ) -> Result<Option<ChunkPlan>> {
        let fragments = self.fragments_of(entries, logical_name);
        let literal = entries
            .iter()
            .find(|e| !e.is_dir && e.name == logical_name);

        let chunks: Vec<ChunkRef> = match (fragments.is_empty(), literal) {
            (false, Some(_)) => {
                return Err(ChunkError::NameCollision(logical_name.to_string()));
            }
            (false, None) => fragments
                .iter()
                .map(|entry| ChunkRef {
                    address: join_address(parent_address, &entry.name),
                    size: entry.size,
                })
                .collect(),
            (true, Some(entry)) => vec![ChunkRef {
                address: join_address(parent_address, &entry.name),
                size: entry.size,
            }],
            (true, None) => return Ok(None),
        };

        debug!(
            "Resolved chunk plan for {}: {} chunks",
            logical_name,
            chunks.len()
        );
        Ok(Some(ChunkPlan::new(chunks)))
    }
}

fn join_address(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
