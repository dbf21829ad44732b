use crate::error::{Error, Result};
use crate::event::{self, Event};
use crate::notify::{ChangeNotifier, SubscriptionId};
use crate::store::{KvStore, META, ScanDirection};
use serde_json::Value;
use std::sync::Arc;

/// Primary table: big-endian `u64` local id -> serialized [`Event`].
pub(crate) const EVENTS: &str = "events";
/// Secondary unique index: global id bytes -> big-endian local id.
pub(crate) const EVENT_INDEX: &str = "event_index";

/// Meta key for the next local id. Persisted rather than derived from
/// the newest record so ids stay monotonic across compaction.
const NEXT_ID_KEY: &[u8] = b"next_local_id";

/// Big-endian encoding so lexicographic key order equals id order.
pub(crate) fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_event(value: &[u8]) -> Result<Event> {
    Ok(serde_json::from_slice(value)?)
}

/// Append-only, locally ordered store of immutable event records.
///
/// `append` assigns the next local id and a fresh global id, persists the
/// record in one transaction, and only after durable commit invokes
/// subscribers synchronously with the stored event. Records are immutable
/// once appended; the only removal path is [`compact`](EventLog::compact).
pub struct EventLog {
    store: Arc<dyn KvStore>,
    subscribers: ChangeNotifier<Event>,
}

impl EventLog {
    /// Open the log on a store, creating its tables if needed.
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut txn = store.begin()?;
        txn.create_table(EVENTS)?;
        txn.create_table(EVENT_INDEX)?;
        txn.create_table(META)?;
        txn.commit()?;
        Ok(EventLog {
            store,
            subscribers: ChangeNotifier::new(),
        })
    }

    /// Append a payload as the next event.
    ///
    /// The record and its global-id index entry commit in one
    /// transaction. On a global id collision the append fails and records
    /// nothing. Subscribers run synchronously after the commit, on the
    /// caller's thread.
    pub fn append(&self, payload: Value) -> Result<Event> {
        let mut txn = self.store.begin()?;

        let local_id = match txn.get(META, NEXT_ID_KEY)? {
            Some(bytes) => decode_id_bytes(&bytes)?,
            None => 1,
        };
        let global_id = event::fresh_global_id();
        if txn.get(EVENT_INDEX, global_id.as_bytes())?.is_some() {
            // Dropping the transaction aborts it: nothing is recorded.
            return Err(Error::GlobalIdCollision { global_id });
        }

        let event = Event {
            local_id,
            global_id,
            ts: event::unix_now(),
            payload,
        };
        txn.put(EVENTS, &id_key(local_id), &serde_json::to_vec(&event)?)?;
        txn.put(EVENT_INDEX, event.global_id.as_bytes(), &id_key(local_id))?;
        txn.put(META, NEXT_ID_KEY, &id_key(local_id + 1))?;
        txn.commit()?;

        self.subscribers.emit(std::slice::from_ref(&event));
        Ok(event)
    }

    /// Events with id strictly greater than `after_id`, ascending,
    /// at most `limit`.
    pub fn query_forward(&self, after_id: u64, limit: Option<usize>) -> Result<Vec<Event>> {
        let txn = self.store.begin()?;
        let lo = after_id.saturating_add(1);
        let entries = txn.scan(
            EVENTS,
            Some(&id_key(lo)),
            None,
            ScanDirection::Ascending,
            limit,
        )?;
        entries.iter().map(|(_, v)| decode_event(v)).collect()
    }

    /// Events with id strictly less than `before_id`, descending,
    /// at most `limit`.
    pub fn query_backward(&self, before_id: u64, limit: Option<usize>) -> Result<Vec<Event>> {
        if before_id <= 1 {
            return Ok(Vec::new());
        }
        let txn = self.store.begin()?;
        let entries = txn.scan(
            EVENTS,
            None,
            Some(&id_key(before_id - 1)),
            ScanDirection::Descending,
            limit,
        )?;
        entries.iter().map(|(_, v)| decode_event(v)).collect()
    }

    /// True if the log holds at least one record.
    pub fn exists_any(&self) -> Result<bool> {
        let txn = self.store.begin()?;
        let entries = txn.scan(EVENTS, None, None, ScanDirection::Ascending, Some(1))?;
        Ok(!entries.is_empty())
    }

    /// Delete all but the newest `keep_latest` records by id, returning
    /// the number deleted.
    ///
    /// Retention has no awareness of coverage state — the engine's
    /// catch-up path detects and closes holes left by compaction.
    pub fn compact(&self, keep_latest: usize) -> Result<u64> {
        let mut txn = self.store.begin()?;
        let all = txn.scan(EVENTS, None, None, ScanDirection::Descending, None)?;
        let mut deleted = 0u64;
        for (key, value) in all.iter().skip(keep_latest) {
            let event = decode_event(value)?;
            txn.delete(EVENTS, key)?;
            txn.delete(EVENT_INDEX, event.global_id.as_bytes())?;
            deleted += 1;
        }
        txn.commit()?;
        Ok(deleted)
    }

    /// Register a listener invoked synchronously after each durable
    /// append. Never errors.
    pub fn subscribe(&self, listener: Box<dyn Fn(&Event) + Send>) -> SubscriptionId {
        self.subscribers.subscribe(listener)
    }

    /// Remove a listener. Never errors; unknown tokens are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe(id)
    }

    /// The shared store handle this log was opened on.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }
}

fn decode_id_bytes(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Corrupt("id is not 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}
