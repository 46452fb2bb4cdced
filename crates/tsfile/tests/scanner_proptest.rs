//! Property-based tests for the recovery scanner.
//!
//! Builds container images in memory from arbitrary chunk groups, cuts them at
//! arbitrary offsets, and checks that recovery only ever keeps whole groups.

use alopex_tsfile::format::{MetaMarker, Preamble, PREAMBLE_SIZE};
use alopex_tsfile::recovery::scan;
use alopex_tsfile::{Chunk, ChunkGroupFooter};
use proptest::prelude::*;
use std::io::Cursor;

/// One chunk group: per-measurement point counts, and whether a separator follows.
type GroupShape = (Vec<usize>, bool);

fn group_strategy() -> impl Strategy<Value = GroupShape> {
    (prop::collection::vec(1usize..20, 1..4), any::<bool>())
}

/// Returns the image and, per group, its end offset and whether a separator follows.
fn build_image(groups: &[GroupShape]) -> (Vec<u8>, Vec<(u64, bool)>) {
    let mut bytes = Vec::new();
    Preamble::new().write_to(&mut bytes).unwrap();

    let mut ends = Vec::new();
    for (g, (counts, separator)) in groups.iter().enumerate() {
        let start = bytes.len() as u64;
        for (m, count) in counts.iter().enumerate() {
            let points: Vec<(i64, f64)> = (0..*count)
                .map(|i| (1_000 * g as i64 + i as i64, i as f64 * 0.5))
                .collect();
            Chunk::from_points(format!("s{}", m), &points)
                .write_to(&mut bytes)
                .unwrap();
        }
        let data_size = bytes.len() as u64 - start;
        ChunkGroupFooter::new(format!("root.d{}", g), data_size, counts.len() as u32)
            .write_to(&mut bytes)
            .unwrap();
        ends.push((bytes.len() as u64, *separator));
        if *separator {
            MetaMarker::Separator.write_to(&mut bytes).unwrap();
        }
    }
    (bytes, ends)
}

fn image_and_cut() -> impl Strategy<Value = (Vec<u8>, Vec<(u64, bool)>, usize)> {
    prop::collection::vec(group_strategy(), 1..6).prop_flat_map(|groups| {
        let (bytes, ends) = build_image(&groups);
        let len = bytes.len();
        (Just(bytes), Just(ends), PREAMBLE_SIZE..=len)
    })
}

proptest! {
    /// Recovery never keeps bytes past the cut, and only stops on group boundaries.
    #[test]
    fn test_truncation_lands_on_group_boundary((bytes, ends, cut) in image_and_cut()) {
        let outcome = scan(Cursor::new(bytes[..cut].to_vec())).unwrap();
        let confirmed = outcome.confirmed_offset;

        prop_assert!(confirmed <= cut as u64);
        prop_assert!(outcome.can_write());

        let boundaries: Vec<u64> = ends.iter().map(|(end, _)| *end).collect();
        prop_assert!(
            confirmed == PREAMBLE_SIZE as u64 || boundaries.contains(&confirmed),
            "confirmed offset {} is not a group boundary", confirmed
        );

        let kept = boundaries.iter().filter(|end| **end <= confirmed).count();
        prop_assert_eq!(outcome.device_index.group_count(), kept);
    }

    /// A group whose separator survived the cut is always kept.
    #[test]
    fn test_surviving_separator_keeps_group((bytes, ends, cut) in image_and_cut()) {
        let outcome = scan(Cursor::new(bytes[..cut].to_vec())).unwrap();

        for (end, separator) in &ends {
            if *separator && *end < cut as u64 {
                prop_assert!(outcome.confirmed_offset >= *end);
            }
        }
    }

    /// Cutting later never confirms less.
    #[test]
    fn test_confirmed_offset_is_monotonic((bytes, _ends, cut) in image_and_cut()) {
        let shorter = scan(Cursor::new(bytes[..cut].to_vec())).unwrap();
        let full = scan(Cursor::new(bytes)).unwrap();
        prop_assert!(shorter.confirmed_offset <= full.confirmed_offset);
    }
}
