mod common;

use common::{count_fold, count_upgrade, drain, mem_store, open_log, play_event, total_for};
use serde_json::json;
use std::sync::Arc;
use tallylog::{AggregationEngine, CoverageRange};

#[test]
fn test_compacted_backlog_does_not_stall_catch_up() {
    let store = mem_store();
    let log = open_log(&store);
    for _ in 0..10 {
        log.append(play_event("t-1")).unwrap();
    }
    // Retention runs before anything was folded: only the newest four
    // records survive.
    log.compact(4).unwrap();

    let engine = AggregationEngine::builder(Arc::clone(&store), Arc::clone(&log), count_fold())
        .upgrade(count_upgrade())
        .default_record(Arc::new(|_| json!({"total": 0})))
        .build();
    engine.initialize().unwrap();
    drain(&engine);

    // Only surviving events fold; the deleted ids are written off as
    // covered instead of being waited on forever.
    assert_eq!(total_for(&engine, "t-1"), 4);
    assert_eq!(engine.coverage(), vec![CoverageRange::new(0, 10)]);
}

#[test]
fn test_bounded_gap_over_deleted_records_is_closed() {
    let store = mem_store();
    let log = open_log(&store);
    for _ in 0..10 {
        log.append(play_event("t-1")).unwrap();
    }

    let engine = AggregationEngine::builder(Arc::clone(&store), Arc::clone(&log), count_fold())
        .upgrade(count_upgrade())
        .default_record(Arc::new(|_| json!({"total": 0})))
        .batch_size(3)
        .build();
    engine.initialize().unwrap();

    // One batch covers [8, 10]; then retention deletes everything the
    // tracker still marks uncovered.
    assert!(!engine.catch_up_once().unwrap());
    assert_eq!(engine.coverage(), vec![CoverageRange::new(8, 10)]);
    log.compact(3).unwrap();

    // The next tick finds a bounded gap with no surviving records and
    // closes it rather than stalling on deleted data.
    assert!(!engine.catch_up_once().unwrap());
    assert_eq!(engine.coverage(), vec![CoverageRange::new(0, 10)]);
    assert!(engine.catch_up_once().unwrap());

    assert_eq!(total_for(&engine, "t-1"), 3);
}

#[test]
fn test_partial_compaction_inside_gap() {
    let store = mem_store();
    let log = open_log(&store);
    for _ in 0..10 {
        log.append(play_event("t-1")).unwrap();
    }

    let engine = AggregationEngine::builder(Arc::clone(&store), Arc::clone(&log), count_fold())
        .upgrade(count_upgrade())
        .default_record(Arc::new(|_| json!({"total": 0})))
        .batch_size(3)
        .build();
    engine.initialize().unwrap();

    assert!(!engine.catch_up_once().unwrap());
    assert_eq!(engine.coverage(), vec![CoverageRange::new(8, 10)]);

    // Keep 5: ids 6..=10 survive, the gap [0, 7] is half deleted.
    log.compact(5).unwrap();
    drain(&engine);

    // The surviving uncovered ids (6, 7) folded; the deleted ones were
    // skipped without stalling.
    assert_eq!(total_for(&engine, "t-1"), 5);
    assert_eq!(engine.coverage(), vec![CoverageRange::new(0, 10)]);
}
