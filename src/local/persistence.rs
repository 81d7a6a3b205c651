use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::INVALID_SEQUENCE_NUMBER;
use crate::error::{data_loss, internal_error, FirestoreErrorCode, FirestoreResult};
use crate::local::client_lease::{ClientLease, LeaseSettings};
use crate::local::kv_store::{
    DbKey, KeyPart, KeyRange, KvStore, KvTransaction, MemoryKvStore, Table, TransactionMode,
};
use crate::model::{ListenSequenceNumber, ResourcePath};
use crate::platform::runtime;

const MAX_TRANSACTION_ATTEMPTS: usize = 3;

pub(crate) const GLOBAL_HIGHEST_SEQUENCE_NUMBER: &str = "highest_sequence_number";

/// Row key for a resource path: one string part per segment.
pub(crate) fn path_key(path: &ResourcePath) -> DbKey {
    path.iter().map(|segment| KeyPart::Str(segment.clone())).collect()
}

/// `prefix` followed by the segments of `path`.
pub(crate) fn prefixed_path_key(prefix: DbKey, path: &ResourcePath) -> DbKey {
    let mut key = prefix;
    key.extend(path_key(path));
    key
}

/// Rebuilds a path from string parts, skipping the first `skip` parts.
pub(crate) fn path_from_key(key: &[KeyPart], skip: usize) -> ResourcePath {
    ResourcePath::from_segments(key.iter().skip(skip).filter_map(|part| match part {
        KeyPart::Str(segment) => Some(segment.clone()),
        _ => None,
    }))
}

/// Scoped handle passed to transaction bodies. Rows are serde_json encoded.
pub struct Transaction<'a> {
    kv: Box<dyn KvTransaction + 'a>,
    mode: TransactionMode,
    sequence_number: ListenSequenceNumber,
}

impl<'a> Transaction<'a> {
    /// Listen sequence number stamped on every reference touched by this
    /// transaction.
    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &DbKey) -> FirestoreResult<Option<T>> {
        match self.kv.get(table, key)? {
            Some(bytes) => decode_row(table, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&self, table: Table, key: &DbKey) -> FirestoreResult<bool> {
        Ok(self.kv.get(table, key)?.is_some())
    }

    pub fn put<T: Serialize>(&mut self, table: Table, key: DbKey, value: &T) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| internal_error(format!("failed to encode {table:?} row: {err}")))?;
        self.kv.put(table, key, bytes)
    }

    pub fn delete(&mut self, table: Table, key: &DbKey) -> FirestoreResult<()> {
        self.kv.delete(table, key)
    }

    pub fn scan<T: DeserializeOwned>(&self, table: Table, range: &KeyRange) -> FirestoreResult<Vec<(DbKey, T)>> {
        self.kv
            .scan(table, range)?
            .into_iter()
            .map(|(key, bytes)| decode_row(table, &bytes).map(|value| (key, value)))
            .collect()
    }

    pub fn scan_keys(&self, table: Table, range: &KeyRange) -> FirestoreResult<Vec<DbKey>> {
        Ok(self.kv.scan(table, range)?.into_iter().map(|(key, _)| key).collect())
    }

    pub fn delete_range(&mut self, table: Table, range: &KeyRange) -> FirestoreResult<usize> {
        let keys = self.scan_keys(table, range)?;
        for key in &keys {
            self.kv.delete(table, key)?;
        }
        Ok(keys.len())
    }

    pub(crate) fn get_global<T: DeserializeOwned>(&self, name: &str) -> FirestoreResult<Option<T>> {
        self.get(Table::Globals, &vec![KeyPart::from(name)])
    }

    pub(crate) fn put_global<T: Serialize>(&mut self, name: &str, value: &T) -> FirestoreResult<()> {
        self.put(Table::Globals, vec![KeyPart::from(name)], value)
    }

    fn commit(self) -> FirestoreResult<()> {
        self.kv.commit()
    }
}

fn decode_row<T: DeserializeOwned>(table: Table, bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes).map_err(|err| data_loss(format!("corrupt {table:?} row: {err}")))
}

/// Runs transactions against a [`KvStore`], stamping listen sequence
/// numbers and enforcing the primary lease.
pub struct Persistence {
    store: Arc<dyn KvStore>,
    lease: ClientLease,
    highest_sequence_number: AtomicI64,
}

impl Persistence {
    /// Opens persistence over `store`. Fails with the store's error when the
    /// store cannot be read.
    pub fn open(store: Arc<dyn KvStore>, client_id: impl Into<String>, lease: LeaseSettings) -> FirestoreResult<Self> {
        let highest = {
            let kv = store.begin(TransactionMode::ReadOnly)?;
            let txn = Transaction {
                kv,
                mode: TransactionMode::ReadOnly,
                sequence_number: INVALID_SEQUENCE_NUMBER,
            };
            txn.get_global::<ListenSequenceNumber>(GLOBAL_HIGHEST_SEQUENCE_NUMBER)?
                .unwrap_or(0)
        };
        Ok(Self {
            store,
            lease: ClientLease::new(client_id, lease),
            highest_sequence_number: AtomicI64::new(highest),
        })
    }

    pub fn memory(client_id: impl Into<String>) -> Self {
        Self {
            store: Arc::new(MemoryKvStore::new()),
            lease: ClientLease::new(client_id, LeaseSettings::default()),
            highest_sequence_number: AtomicI64::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        self.lease.client_id()
    }

    pub fn lease(&self) -> &ClientLease {
        &self.lease
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number.load(Ordering::SeqCst)
    }

    /// Runs `body` in one store transaction.
    ///
    /// Aborted transactions are retried a bounded number of times; the body
    /// must tolerate re-execution. `ReadWritePrimary` transactions fail with
    /// the primary-lease-lost error when this client is not the primary.
    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, mut body: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut Transaction<'_>) -> FirestoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.attempt_transaction(mode, &mut body);
            match result {
                Err(err) if err.code == FirestoreErrorCode::Aborted && attempt < MAX_TRANSACTION_ATTEMPTS => {
                    log::debug!("transaction '{action}' aborted (attempt {attempt}), retrying: {err}");
                }
                Err(err) => {
                    log::debug!("transaction '{action}' failed: {err}");
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    fn attempt_transaction<T, F>(&self, mode: TransactionMode, body: &mut F) -> FirestoreResult<T>
    where
        F: FnMut(&mut Transaction<'_>) -> FirestoreResult<T>,
    {
        let kv = self.store.begin(mode)?;
        let mut txn = Transaction {
            kv,
            mode,
            sequence_number: INVALID_SEQUENCE_NUMBER,
        };
        let sequence_number = if mode.is_read_only() {
            INVALID_SEQUENCE_NUMBER
        } else {
            // Other clients sharing the store advance the persisted counter too.
            let stored = txn
                .get_global::<ListenSequenceNumber>(GLOBAL_HIGHEST_SEQUENCE_NUMBER)?
                .unwrap_or(0);
            stored.max(self.highest_sequence_number.load(Ordering::SeqCst)) + 1
        };
        txn.sequence_number = sequence_number;
        if mode == TransactionMode::ReadWritePrimary {
            self.lease.verify_primary(&txn, runtime::now_millis())?;
        }
        let value = body(&mut txn)?;
        if !mode.is_read_only() {
            txn.put_global(GLOBAL_HIGHEST_SEQUENCE_NUMBER, &sequence_number)?;
        }
        txn.commit()?;
        if !mode.is_read_only() {
            self.highest_sequence_number.fetch_max(sequence_number, Ordering::SeqCst);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::error::aborted;

    #[test]
    fn sequence_numbers_increase_per_write_transaction() {
        let persistence = Persistence::memory("client");
        let first = persistence
            .run_transaction("a", TransactionMode::ReadWrite, |txn| Ok(txn.sequence_number()))
            .unwrap();
        let second = persistence
            .run_transaction("b", TransactionMode::ReadWrite, |txn| Ok(txn.sequence_number()))
            .unwrap();
        assert!(second > first);
        let read = persistence
            .run_transaction("c", TransactionMode::ReadOnly, |txn| Ok(txn.sequence_number()))
            .unwrap();
        assert_eq!(read, INVALID_SEQUENCE_NUMBER);
    }

    #[test]
    fn aborted_transactions_are_retried_then_surfaced() {
        let persistence = Persistence::memory("client");
        let attempts = AtomicUsize::new(0);
        let result = persistence.run_transaction("flaky", TransactionMode::ReadWrite, |txn| {
            txn.put_global("k", &1)?;
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(aborted("conflict"));
            }
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let always = persistence.run_transaction("broken", TransactionMode::ReadWrite, |_| -> FirestoreResult<()> {
            Err(aborted("conflict"))
        });
        assert_eq!(always.unwrap_err().code, FirestoreErrorCode::Aborted);
    }

    #[test]
    fn failed_body_discards_writes() {
        let persistence = Persistence::memory("client");
        let _ = persistence.run_transaction("fail", TransactionMode::ReadWrite, |txn| -> FirestoreResult<()> {
            txn.put_global("k", &1)?;
            Err(internal_error("boom"))
        });
        let value = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| txn.get_global::<i32>("k"))
            .unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn reopening_restores_highest_sequence_number() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let persistence = Persistence::open(Arc::clone(&store), "a", LeaseSettings::default()).unwrap();
        for _ in 0..3 {
            persistence.run_transaction("tick", TransactionMode::ReadWrite, |_| Ok(())).unwrap();
        }
        let reopened = Persistence::open(store, "b", LeaseSettings::default()).unwrap();
        assert_eq!(reopened.current_sequence_number(), 3);
    }

    #[test]
    fn path_keys_round_trip() {
        let path = ResourcePath::from_string("rooms/a/messages/m").unwrap();
        let key = prefixed_path_key(vec![KeyPart::from("user")], &path);
        assert_eq!(path_from_key(&key, 1), path);
    }
}
