mod common;

use common::{drain, mem_store, open_log, play_event, total_for};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tallylog::{AggregationEngine, CoverageRange, CoverageTracker};

fn arb_intervals() -> impl Strategy<Value = Vec<(u64, u64)>> {
    proptest::collection::vec(
        (0u64..300, 0u64..40).prop_map(|(start, len)| (start, start + len)),
        0..20,
    )
}

proptest! {
    // The tracker's list stays sorted, disjoint and non-adjacent, and
    // covers exactly the inserted points (with the origin-adjacency
    // normalization for intervals touching id 1).
    #[test]
    fn prop_coverage_matches_point_model(intervals in arb_intervals()) {
        let mut tracker = CoverageTracker::new();
        for &(start, end) in &intervals {
            tracker.insert(start, end);
        }

        let ranges = tracker.ranges();
        for r in ranges {
            prop_assert!(r.start <= r.end);
        }
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].end + 1 < pair[1].start);
        }

        let mut model = vec![false; 400];
        for &(start, end) in &intervals {
            let start = if start <= 1 { 0 } else { start };
            for p in start..=end {
                model[p as usize] = true;
            }
        }
        for p in 0..400u64 {
            let covered = ranges.iter().any(|r| r.start <= p && p <= r.end);
            prop_assert_eq!(covered, model[p as usize], "point {}", p);
        }
    }

    // Insert order never matters: any permutation converges to the same
    // list.
    #[test]
    fn prop_insert_order_invariance(
        intervals in arb_intervals().prop_flat_map(|v| {
            let shuffled = Just(v.clone()).prop_shuffle();
            (Just(v), shuffled)
        })
    ) {
        let (original, shuffled) = intervals;

        let mut a = CoverageTracker::new();
        for &(start, end) in &original {
            a.insert(start, end);
        }
        let mut b = CoverageTracker::new();
        for &(start, end) in &shuffled {
            b.insert(start, end);
        }
        prop_assert_eq!(a, b);
    }

    // Chunks that jointly cover [0, K], inserted in any order and with
    // duplicates, converge to the single interval [0, K].
    #[test]
    fn prop_full_cover_converges_to_one_interval(
        k in 1u64..200,
        seed_chunks in proptest::collection::vec((0u64..200, 0u64..30), 1..30)
    ) {
        let mut tracker = CoverageTracker::new();
        // Arbitrary noise chunks clamped into [0, k]...
        for &(start, len) in &seed_chunks {
            let start = start.min(k);
            let end = (start + len).min(k);
            tracker.insert(start, end);
        }
        // ...plus a sweep guaranteeing every point is inserted at least
        // once.
        let mut p = 0;
        while p <= k {
            let end = (p + 7).min(k);
            tracker.insert(p, end);
            p = end + 1;
        }

        prop_assert_eq!(tracker.ranges().to_vec(), vec![CoverageRange::new(0, k)]);
    }

    // For any event sequence and any backlog/live split, every event is
    // folded into the aggregate exactly once: the totals equal a plain
    // sequential count.
    #[test]
    fn prop_interleaving_is_exactly_once(
        tracks in proptest::collection::vec(0u8..4, 0..40),
        split in 0usize..41,
        batch_size in 1usize..8,
    ) {
        let split = split.min(tracks.len());
        let track_name = |t: u8| format!("track-{t}");

        let mut expected: BTreeMap<String, u64> = BTreeMap::new();
        for &t in &tracks {
            *expected.entry(track_name(t)).or_default() += 1;
        }

        let store = mem_store();
        let log = open_log(&store);

        // Backlog: appended before the engine exists, reached only by
        // the catch-up path.
        for &t in &tracks[..split] {
            log.append(play_event(&track_name(t))).unwrap();
        }

        let engine = AggregationEngine::builder(
            Arc::clone(&store),
            Arc::clone(&log),
            common::count_fold(),
        )
        .upgrade(common::count_upgrade())
        .default_record(Arc::new(|_| json!({"total": 0})))
        .batch_size(batch_size)
        .build();
        engine.initialize().unwrap();

        // Live tail, interleaved with catch-up ticks over the backlog.
        for &t in &tracks[split..] {
            log.append(play_event(&track_name(t))).unwrap();
            engine.catch_up_once().unwrap();
        }
        drain(&engine);

        for track in (0u8..4).map(track_name) {
            let got = total_for(&engine, &track);
            prop_assert_eq!(got, expected.get(&track).copied().unwrap_or(0));
        }
    }
}
