// Property: fragment aggregation does not depend on listing order
//
// For any set of logical files split into fragments, and any permutation of
// the listing, the aggregator yields one entry per logical file whose size is
// the sum of its fragments, and chunk plans list fragments by ascending ordinal.

use chrono::{TimeZone, Utc};
use chunked_storage::fragment::{FragmentAggregator, FragmentPattern};
use chunked_storage::models::PhysicalEntry;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn listing_strategy() -> impl Strategy<Value = (BTreeMap<String, Vec<u64>>, Vec<PhysicalEntry>)> {
    prop::collection::btree_map(
        "[a-z]{1,8}\\.(bin|mp4)",
        prop::collection::vec(0u64..1_000_000, 1..12),
        1..6,
    )
    .prop_flat_map(|files| {
        let pattern = FragmentPattern::default();
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let entries: Vec<PhysicalEntry> = files
            .iter()
            .flat_map(|(base, sizes)| {
                let pattern = pattern.clone();
                sizes.iter().enumerate().map(move |(i, size)| {
                    PhysicalEntry::file(pattern.fragment_name(base, i as u64 + 1), *size, time)
                })
            })
            .collect();
        (Just(files), Just(entries).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_aggregate_sums_fragments((files, entries) in listing_strategy()) {
        let logical = FragmentAggregator::default().aggregate(&entries).unwrap();

        prop_assert_eq!(logical.len(), files.len());
        for entry in &logical {
            let sizes = files.get(&entry.name).unwrap();
            prop_assert_eq!(entry.size, sizes.iter().sum::<u64>());
            prop_assert!(!entry.is_folder);
        }
    }

    #[test]
    fn prop_chunk_plan_follows_ordinals((files, entries) in listing_strategy()) {
        let aggregator = FragmentAggregator::default();
        for (base, sizes) in &files {
            let plan = aggregator.chunk_plan(&entries, "/store", base).unwrap().unwrap();
            prop_assert_eq!(&plan.sizes(), sizes);
            prop_assert_eq!(plan.total_size(), sizes.iter().sum::<u64>());
            for (i, chunk) in plan.chunks.iter().enumerate() {
                let expected = format!("/store/{}", aggregator.pattern().fragment_name(base, i as u64 + 1));
                prop_assert_eq!(&chunk.address, &expected);
            }
        }
    }
}

#[test]
fn test_aggregate_mixed_listing() {
    let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let entries = vec![
        PhysicalEntry::file("movie.mp4.rclone_chunk.002", 50, time),
        PhysicalEntry::file("notes.txt", 10, time),
        PhysicalEntry::dir("archive", time),
        PhysicalEntry::file("movie.mp4.rclone_chunk.001", 100, time),
    ];

    let mut logical = FragmentAggregator::default().aggregate(&entries).unwrap();
    logical.sort_by(|a, b| a.name.cmp(&b.name));

    let summary: Vec<(&str, u64, bool)> = logical
        .iter()
        .map(|e| (e.name.as_str(), e.size, e.is_folder))
        .collect();
    assert_eq!(
        summary,
        vec![("archive", 0, true), ("movie.mp4", 150, false), ("notes.txt", 10, false)]
    );
}

#[test]
fn test_aggregate_short_marker_example() {
    let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let entries = vec![
        PhysicalEntry::file("movie.mp4.chunk.001", 100, time),
        PhysicalEntry::file("movie.mp4.chunk.002", 50, time),
        PhysicalEntry::file("notes.txt", 10, time),
    ];

    let aggregator = FragmentAggregator::new(FragmentPattern::new("chunk").unwrap());
    let logical = aggregator.aggregate(&entries).unwrap();
    let summary: Vec<(&str, u64)> = logical.iter().map(|e| (e.name.as_str(), e.size)).collect();
    assert_eq!(summary, vec![("movie.mp4", 150), ("notes.txt", 10)]);
    assert!(logical.iter().all(|e| !e.is_folder && e.modified == time));
}

#[test]
fn test_custom_marker_ignores_default_fragments() {
    let time = Utc.timestamp_opt(0, 0).unwrap();
    let entries = vec![
        PhysicalEntry::file("a.bin.part.1", 4, time),
        PhysicalEntry::file("a.bin.part.2", 4, time),
        PhysicalEntry::file("b.bin.rclone_chunk.001", 7, time),
    ];

    let aggregator = FragmentAggregator::new(FragmentPattern::new("part").unwrap());
    let logical = aggregator.aggregate(&entries).unwrap();
    let names: Vec<&str> = logical.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.bin", "b.bin.rclone_chunk.001"]);
    assert_eq!(logical[0].size, 8);
}
