//! Transactional key-value capability shared by the log and the engine.
//!
//! Both [`EventLog`](crate::EventLog) and
//! [`AggregationEngine`](crate::AggregationEngine) are built exclusively on
//! the [`KvStore`] / [`KvTxn`] contract: named tables holding byte keys and
//! byte values, with scoped transactions that either fully commit or fully
//! abort. Two implementations ship with the crate — [`MemStore`] for tests
//! and ephemeral use, [`FileStore`] for single-file persistence.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemStore;

use crate::error::Result;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Metadata table shared by the log (id counter) and the engine
/// (coverage record, schema version).
pub(crate) const META: &str = "meta";

/// Cursor scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Keys in ascending lexicographic order.
    Ascending,
    /// Keys in descending lexicographic order.
    Descending,
}

/// A scoped transaction over a [`KvStore`].
///
/// All reads observe committed state plus this transaction's own pending
/// writes. Nothing becomes visible to other readers until [`commit`]
/// succeeds; dropping a transaction without committing discards every
/// pending write.
///
/// [`commit`]: KvTxn::commit
pub trait KvTxn {
    /// Create a table if it does not exist. Idempotent.
    fn create_table(&mut self, table: &str) -> Result<()>;

    /// Read the value stored under `key`, if any.
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or replace the value stored under `key`.
    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key` if present.
    fn delete(&mut self, table: &str, key: &[u8]) -> Result<()>;

    /// Number of entries in `table` as seen by this transaction.
    fn count(&self, table: &str) -> Result<u64>;

    /// Bounded cursor scan.
    ///
    /// `lo` and `hi` are inclusive key bounds (`None` = unbounded). Entries
    /// are returned in `direction` order, at most `limit` of them.
    fn scan(
        &self,
        table: &str,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically apply every pending write.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Handle to a transactional store shared by the log and the engine.
pub trait KvStore: Send + Sync {
    /// Open a new transaction.
    fn begin(&self) -> Result<Box<dyn KvTxn + '_>>;
}

/// Committed table state: table name -> ordered key/value map.
pub(crate) type Tables = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Pending writes buffered inside a transaction, applied atomically at
/// commit. `None` marks a delete. Reads overlay this set on top of the
/// committed tables so a transaction observes its own writes.
#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    created: BTreeSet<String>,
    writes: BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl WriteSet {
    pub(crate) fn create_table(&mut self, table: &str) {
        self.created.insert(table.to_string());
    }

    pub(crate) fn put(&mut self, table: &str, key: &[u8], value: &[u8]) {
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
    }

    pub(crate) fn delete(&mut self, table: &str, key: &[u8]) {
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), None);
    }

    pub(crate) fn get(&self, base: &Tables, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(pending) = self.writes.get(table).and_then(|t| t.get(key)) {
            return pending.clone();
        }
        base.get(table).and_then(|t| t.get(key)).cloned()
    }

    pub(crate) fn count(&self, base: &Tables, table: &str) -> u64 {
        self.merged(base, table, None, None).len() as u64
    }

    pub(crate) fn scan(
        &self,
        base: &Tables,
        table: &str,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let merged = self.merged(base, table, lo, hi);
        let limit = limit.unwrap_or(usize::MAX);
        match direction {
            ScanDirection::Ascending => merged.into_iter().take(limit).collect(),
            ScanDirection::Descending => merged.into_iter().rev().take(limit).collect(),
        }
    }

    /// Committed entries with the pending overlay applied, restricted to
    /// the inclusive `[lo, hi]` key window.
    fn merged(
        &self,
        base: &Tables,
        table: &str,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let lo_bound = lo.map_or(Bound::Unbounded, |k| Bound::Included(k.to_vec()));
        let hi_bound = hi.map_or(Bound::Unbounded, |k| Bound::Included(k.to_vec()));
        let in_window = |key: &[u8]| {
            lo.is_none_or(|l| key >= l) && hi.is_none_or(|h| key <= h)
        };

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = match base.get(table) {
            Some(t) => t
                .range((lo_bound, hi_bound))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => BTreeMap::new(),
        };
        if let Some(pending) = self.writes.get(table) {
            for (key, value) in pending {
                if !in_window(key) {
                    continue;
                }
                match value {
                    Some(v) => {
                        merged.insert(key.clone(), v.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        merged
    }

    /// Apply this write set to the committed tables.
    pub(crate) fn apply(self, base: &mut Tables) {
        for table in self.created {
            base.entry(table).or_default();
        }
        for (table, pending) in self.writes {
            let entries = base.entry(table).or_default();
            for (key, value) in pending {
                match value {
                    Some(v) => {
                        entries.insert(key, v);
                    }
                    None => {
                        entries.remove(&key);
                    }
                }
            }
        }
    }
}
