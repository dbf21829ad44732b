//! Single-file persistent store.

use super::{KvStore, KvTxn, ScanDirection, Tables, WriteSet};
use crate::error::{Error, Result};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Hex-encoded xxh64 hash of a serialized store document.
fn document_hash(bytes: &[u8]) -> String {
    let hash = xxhash_rust::xxh64::xxh64(bytes, 0);
    format!("{hash:016x}")
}

// JSON object keys must be strings, so tables are flattened to entry
// lists for the on-disk document.
#[derive(Serialize, Deserialize)]
struct StoreDocument {
    tables: Vec<TableDocument>,
}

#[derive(Serialize, Deserialize)]
struct TableDocument {
    name: String,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl StoreDocument {
    fn from_tables(tables: &Tables) -> Self {
        StoreDocument {
            tables: tables
                .iter()
                .map(|(name, entries)| TableDocument {
                    name: name.clone(),
                    entries: entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                })
                .collect(),
        }
    }

    fn into_tables(self) -> Tables {
        self.tables
            .into_iter()
            .map(|t| (t.name, t.entries.into_iter().collect()))
            .collect()
    }
}

/// A [`KvStore`] persisted as one JSON document on disk.
///
/// The file starts with a hex xxh64 hash line followed by the JSON body;
/// the hash is verified on open and a mismatch is reported as
/// [`Error::Corrupt`] rather than silently resetting the store. Every
/// commit rewrites the document atomically (`.tmp` + `sync_data` +
/// rename), so a crash mid-commit leaves the previous document intact.
///
/// An exclusive `.lock` file enforces the single-process, single-writer
/// model; a second open fails with [`Error::Locked`].
pub struct FileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
    // Held for the lifetime of the store; the lock releases on drop.
    _lock_file: File,
}

impl FileStore {
    /// Open or create a store at the given file path.
    ///
    /// Creates parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = path.with_extension("lock");
        let lock_file = File::create(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::Locked)?;

        let tables = match fs::read(&path) {
            Ok(bytes) => Self::parse_document(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(FileStore {
            path,
            tables: RwLock::new(tables),
            _lock_file: lock_file,
        })
    }

    fn parse_document(bytes: &[u8]) -> Result<Tables> {
        let newline = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::Corrupt("missing hash header".to_string()))?;
        let (header, body) = bytes.split_at(newline);
        let body = &body[1..];

        let expected = std::str::from_utf8(header)
            .map_err(|_| Error::Corrupt("hash header is not utf-8".to_string()))?;
        let actual = document_hash(body);
        if expected != actual {
            return Err(Error::Corrupt(format!(
                "hash mismatch: header {expected}, body {actual}"
            )));
        }

        let doc: StoreDocument = serde_json::from_slice(body)?;
        Ok(doc.into_tables())
    }

    /// Write the full document atomically: serialize, hash, write to a
    /// `.tmp` sibling, sync, rename over the live file.
    fn persist(&self, tables: &Tables) -> Result<()> {
        let body = serde_json::to_vec(&StoreDocument::from_tables(tables))?;
        let mut contents = document_hash(&body).into_bytes();
        contents.push(b'\n');
        contents.extend_from_slice(&body);

        let tmp_path = self.path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_data()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn begin(&self) -> Result<Box<dyn KvTxn + '_>> {
        Ok(Box::new(FileTxn {
            store: self,
            writes: WriteSet::default(),
        }))
    }
}

struct FileTxn<'a> {
    store: &'a FileStore,
    writes: WriteSet,
}

impl KvTxn for FileTxn<'_> {
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
        let mut tables = self.store.tables.write();
        let mut next = tables.clone();
        self.writes.apply(&mut next);
        // Durability first: only adopt the new state in memory once the
        // document is on disk.
        self.store.persist(&next)?;
        *tables = next;
        Ok(())
    }
}
