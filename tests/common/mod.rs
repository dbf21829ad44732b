#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tallylog::{
    AGGREGATES_TABLE, AggregateChange, AggregationEngine, Error, EventLog, FoldFn, KvStore,
    MemStore, UpgradeFn,
};

/// Side table holding one marker per folded local id, so the counting
/// fold stays safe to re-apply. Created by the upgrade hook.
pub const COUNTED_TABLE: &str = "counted";

pub fn mem_store() -> Arc<dyn KvStore> {
    Arc::new(MemStore::new())
}

pub fn open_log(store: &Arc<dyn KvStore>) -> Arc<EventLog> {
    Arc::new(EventLog::open(Arc::clone(store)).unwrap())
}

pub fn play_event(track: &str) -> Value {
    json!({"track": track, "action": "played"})
}

pub fn like_event(track: &str, liked: bool, at: u64) -> Value {
    json!({"track": track, "liked": liked, "at": at})
}

pub fn count_upgrade() -> UpgradeFn {
    Arc::new(|txn, _from, _to| txn.create_table(COUNTED_TABLE))
}

/// Count plays per track. Idempotent per id via a marker in
/// `COUNTED_TABLE`: a re-delivered event is a no-change fold.
pub fn count_fold() -> FoldFn {
    Arc::new(|txn, event| {
        let Some(track) = event.payload["track"].as_str() else {
            return Ok(None);
        };
        let marker = event.local_id.to_be_bytes();
        if txn.get(COUNTED_TABLE, &marker)?.is_some() {
            return Ok(None);
        }
        txn.put(COUNTED_TABLE, &marker, &[1])?;

        let total = match txn.get(AGGREGATES_TABLE, track.as_bytes())? {
            Some(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap()["total"]
                .as_u64()
                .unwrap_or(0),
            None => 0,
        };
        Ok(Some(AggregateChange {
            key: track.to_string(),
            record: json!({"total": total + 1}),
        }))
    })
}

/// Track a boolean "liked" flag where the freshest `at` stamp wins.
/// Idempotence falls out of the data: a stale or re-applied event is
/// superseded by the already-applied record and folds to no change.
pub fn latest_flag_fold() -> FoldFn {
    Arc::new(|txn, event| {
        let Some(track) = event.payload["track"].as_str() else {
            return Ok(None);
        };
        let at = event.payload["at"].as_u64().unwrap_or(0);
        let liked = event.payload["liked"].as_bool().unwrap_or(false);

        if let Some(bytes) = txn.get(AGGREGATES_TABLE, track.as_bytes())? {
            let current: Value = serde_json::from_slice(&bytes).unwrap();
            if current["at"].as_u64().unwrap_or(0) >= at {
                return Ok(None);
            }
        }
        Ok(Some(AggregateChange {
            key: track.to_string(),
            record: json!({"liked": liked, "at": at}),
        }))
    })
}

/// Counting fold that fails the first delivery of each listed id, then
/// succeeds on retry.
pub fn fail_once_count_fold(fail_ids: &[u64]) -> FoldFn {
    let pending: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(fail_ids.iter().copied().collect()));
    let base = count_fold();
    Arc::new(move |txn, event| {
        if pending.lock().remove(&event.local_id) {
            return Err(Error::Fold(format!(
                "injected failure for event {}",
                event.local_id
            )));
        }
        base(txn, event)
    })
}

pub fn count_engine(store: &Arc<dyn KvStore>, log: &Arc<EventLog>) -> AggregationEngine {
    count_engine_with(store, log, count_fold())
}

pub fn count_engine_with(
    store: &Arc<dyn KvStore>,
    log: &Arc<EventLog>,
    fold: FoldFn,
) -> AggregationEngine {
    AggregationEngine::builder(Arc::clone(store), Arc::clone(log), fold)
        .upgrade(count_upgrade())
        .default_record(Arc::new(|_| json!({"total": 0})))
        .tick_interval(Duration::from_millis(10))
        .build()
}

/// Drive catch-up synchronously until the engine reports full coverage.
pub fn drain(engine: &AggregationEngine) {
    for _ in 0..1000 {
        if engine.catch_up_once().unwrap() {
            return;
        }
    }
    panic!("catch-up did not converge within 1000 ticks");
}

pub fn total_for(engine: &AggregationEngine, track: &str) -> u64 {
    engine.get_aggregated([track]).unwrap()[track]["total"]
        .as_u64()
        .unwrap()
}

/// Poll until `cond` holds, failing after `timeout`.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within {timeout:?}");
}
