//! In-memory store for tests and ephemeral aggregates.

use super::{KvStore, KvTxn, ScanDirection, Tables, WriteSet};
use crate::error::Result;
use parking_lot::RwLock;

/// An in-memory [`KvStore`].
///
/// Tables live in a `BTreeMap` behind a read-write lock. Transactions
/// buffer their writes in a [`WriteSet`] and apply them in one step under
/// the write lock at commit, so readers never observe a partially-applied
/// transaction.
#[derive(Debug, Default)]
pub struct MemStore {
    tables: RwLock<Tables>,
}

impl MemStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemStore {
    fn begin(&self) -> Result<Box<dyn KvTxn + '_>> {
        Ok(Box::new(MemTxn {
            store: self,
            writes: WriteSet::default(),
        }))
    }
}

struct MemTxn<'a> {
    store: &'a MemStore,
    writes: WriteSet,
}

impl KvTxn for MemTxn<'_> {
    fn create_table(&mut self, table: &str) -> Result<()> {
        self.writes.create_table(table);
        Ok(())
    }

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.writes.get(&self.store.tables.read(), table, key))
    }

    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.put(table, key, value);
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> Result<()> {
        self.writes.delete(table, key);
        Ok(())
    }

    fn count(&self, table: &str) -> Result<u64> {
        Ok(self.writes.count(&self.store.tables.read(), table))
    }

    fn scan(
        &self,
        table: &str,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .writes
            .scan(&self.store.tables.read(), table, lo, hi, direction, limit))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.writes.apply(&mut self.store.tables.write());
        Ok(())
    }
}
