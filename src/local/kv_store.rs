use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{internal_error, FirestoreResult};

/// One component of an ordered row key. Keys compare component-wise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Int(value as i64)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<Vec<u8>> for KeyPart {
    fn from(value: Vec<u8>) -> Self {
        KeyPart::Bytes(value)
    }
}

pub type DbKey = Vec<KeyPart>;

/// Logical tables of the persisted layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// `[user, batch_id]` → mutation batch.
    Mutations,
    /// `[user, path segments.., batch_id]` → empty.
    DocumentMutations,
    /// `[user]` → mutation queue metadata.
    MutationQueues,
    /// `[user, batch_id]` → acknowledgement state written by the primary.
    MutationResults,
    /// `[path segments..]` → remote document.
    RemoteDocuments,
    /// `[user, path segments..]` → overlay.
    DocumentOverlays,
    /// `[user, batch_id, path]` → empty.
    OverlaysByBatch,
    /// `[target_id]` → target data.
    Targets,
    /// `[canonical_id, target_id]` → empty.
    TargetsByCanonicalId,
    /// `[target_id, path]` → empty.
    TargetDocuments,
    /// `[path, target_id]` → sequence number; target id 0 is the sentinel row.
    DocumentTargets,
    /// `[index_id]` → field index definition.
    IndexConfiguration,
    /// `[index_id, user]` → index state.
    IndexState,
    /// `[index_id, user, array value, directional values.., path]` → values.
    IndexEntries,
    /// `[index_id, user, path segments..]` → the document's entry keys.
    DocumentIndexEntries,
    /// `[collection_id, parent path]` → empty.
    CollectionParents,
    /// `[name]` → metadata value.
    Globals,
    /// `[]` → primary lease record.
    PrimaryClient,
    /// `[client_id]` → client metadata.
    ClientMetadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, only while holding the primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// Key range for scans: every key with `prefix`, starting at `start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    prefix: DbKey,
    start: Bound<DbKey>,
}

impl KeyRange {
    pub fn prefix(prefix: DbKey) -> Self {
        Self {
            start: Bound::Included(prefix.clone()),
            prefix,
        }
    }

    /// Keys with `prefix` that sort strictly after `key`.
    pub fn after(prefix: DbKey, key: DbKey) -> Self {
        Self {
            prefix,
            start: Bound::Excluded(key),
        }
    }

    pub fn all() -> Self {
        Self::prefix(Vec::new())
    }

    pub fn contains(&self, key: &DbKey) -> bool {
        if !key.starts_with(&self.prefix) {
            return false;
        }
        match &self.start {
            Bound::Included(start) => key >= start,
            Bound::Excluded(start) => key > start,
            Bound::Unbounded => true,
        }
    }

    fn bounds(&self) -> (Bound<DbKey>, Bound<DbKey>) {
        (self.start.clone(), Bound::Unbounded)
    }
}

/// Ordered, transactional key/value substrate.
///
/// Transactions are serialized: `begin` blocks other transactions until the
/// returned handle is committed or dropped. Dropping without commit aborts.
pub trait KvStore: Send + Sync {
    fn begin(&self, mode: TransactionMode) -> FirestoreResult<Box<dyn KvTransaction + '_>>;
}

pub trait KvTransaction {
    fn get(&self, table: Table, key: &DbKey) -> FirestoreResult<Option<Vec<u8>>>;
    fn put(&mut self, table: Table, key: DbKey, value: Vec<u8>) -> FirestoreResult<()>;
    fn delete(&mut self, table: Table, key: &DbKey) -> FirestoreResult<()>;
    /// Rows in `range`, in key order.
    fn scan(&self, table: Table, range: &KeyRange) -> FirestoreResult<Vec<(DbKey, Vec<u8>)>>;
    fn commit(self: Box<Self>) -> FirestoreResult<()>;
}

type Tables = BTreeMap<Table, BTreeMap<DbKey, Vec<u8>>>;

/// Process-local store. Several clients may share one instance to model
/// multiple instances over the same persisted state.
#[derive(Default)]
pub struct MemoryKvStore {
    tables: Mutex<Tables>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self, mode: TransactionMode) -> FirestoreResult<Box<dyn KvTransaction + '_>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| internal_error("memory store lock poisoned"))?;
        Ok(Box::new(MemoryKvTransaction {
            tables,
            staged: BTreeMap::new(),
            read_only: mode.is_read_only(),
        }))
    }
}

struct MemoryKvTransaction<'a> {
    tables: MutexGuard<'a, Tables>,
    staged: BTreeMap<(Table, DbKey), Option<Vec<u8>>>,
    read_only: bool,
}

impl MemoryKvTransaction<'_> {
    fn check_writable(&self) -> FirestoreResult<()> {
        if self.read_only {
            return Err(internal_error("write attempted in a read-only transaction"));
        }
        Ok(())
    }
}

impl KvTransaction for MemoryKvTransaction<'_> {
    fn get(&self, table: Table, key: &DbKey) -> FirestoreResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(table, key.clone())) {
            return Ok(staged.clone());
        }
        Ok(self.tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    fn put(&mut self, table: Table, key: DbKey, value: Vec<u8>) -> FirestoreResult<()> {
        self.check_writable()?;
        self.staged.insert((table, key), Some(value));
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &DbKey) -> FirestoreResult<()> {
        self.check_writable()?;
        self.staged.insert((table, key.clone()), None);
        Ok(())
    }

    fn scan(&self, table: Table, range: &KeyRange) -> FirestoreResult<Vec<(DbKey, Vec<u8>)>> {
        let mut merged: BTreeMap<DbKey, Vec<u8>> = BTreeMap::new();
        if let Some(rows) = self.tables.get(&table) {
            for (key, value) in rows.range(range.bounds()) {
                if !key.starts_with(&range.prefix) {
                    break;
                }
                merged.insert(key.clone(), value.clone());
            }
        }
        for ((staged_table, key), value) in &self.staged {
            if *staged_table != table || !range.contains(key) {
                continue;
            }
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    fn commit(mut self: Box<Self>) -> FirestoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        for ((table, key), value) in staged {
            let rows = self.tables.entry(table).or_default();
            match value {
                Some(value) => rows.insert(key, value),
                None => rows.remove(&key),
            };
        }
        Ok(())
    }
}
