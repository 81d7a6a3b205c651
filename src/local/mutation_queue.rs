use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constants::BATCH_ID_UNKNOWN;
use crate::core::Query;
use crate::error::{FirestoreErrorCode, FirestoreResult};
use crate::local::kv_store::{DbKey, KeyPart, KeyRange, Table};
use crate::local::persistence::{path_from_key, prefixed_path_key, Transaction};
use crate::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, User};
use crate::util::hard_assert;

const GLOBAL_HIGHEST_BATCH_ID: &str = "highest_batch_id";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MutationQueueMetadata {
    last_acknowledged_batch_id: BatchId,
    last_stream_token: Vec<u8>,
}

/// Outcome of a batch as recorded by the primary client, so the client that
/// wrote the batch can resolve its callback even when it is a secondary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Acknowledged,
    Rejected { code: FirestoreErrorCode, message: String },
}

/// Per-user ordered log of pending write batches.
pub struct MutationQueue {
    user_key: String,
}

impl MutationQueue {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.storage_key(),
        }
    }

    fn user_prefix(&self) -> DbKey {
        vec![KeyPart::from(self.user_key.as_str())]
    }

    fn batch_key(&self, batch_id: BatchId) -> DbKey {
        vec![KeyPart::from(self.user_key.as_str()), KeyPart::from(batch_id)]
    }

    fn metadata(&self, txn: &Transaction<'_>) -> FirestoreResult<MutationQueueMetadata> {
        Ok(txn
            .get(Table::MutationQueues, &self.user_prefix())?
            .unwrap_or_else(|| MutationQueueMetadata {
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: Vec::new(),
            }))
    }

    fn put_metadata(&self, txn: &mut Transaction<'_>, metadata: &MutationQueueMetadata) -> FirestoreResult<()> {
        txn.put(Table::MutationQueues, self.user_prefix(), metadata)
    }

    /// Registers the queue's user. An empty queue drops its stale stream
    /// token, since the write stream will hand out a new one.
    pub fn start(&self, txn: &mut Transaction<'_>) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        if self.is_empty(txn)? && !metadata.last_stream_token.is_empty() {
            metadata.last_stream_token.clear();
        }
        self.put_metadata(txn, &metadata)
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> FirestoreResult<bool> {
        Ok(txn
            .scan_keys(Table::Mutations, &KeyRange::prefix(self.user_prefix()))?
            .is_empty())
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut Transaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let batch_id = txn.get_global::<BatchId>(GLOBAL_HIGHEST_BATCH_ID)?.unwrap_or(0) + 1;
        txn.put_global(GLOBAL_HIGHEST_BATCH_ID, &batch_id)?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        txn.put(Table::Mutations, self.batch_key(batch_id), &batch)?;
        for key in batch.keys() {
            let mut row = prefixed_path_key(self.user_prefix(), key.path());
            row.push(KeyPart::from(batch_id));
            txn.put(Table::DocumentMutations, row, &())?;
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(&self, txn: &Transaction<'_>, batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        txn.get(Table::Mutations, &self.batch_key(batch_id))
    }

    /// First batch with an id larger than `batch_id`.
    pub fn next_mutation_batch_after_batch_id(
        &self,
        txn: &Transaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let range = KeyRange::after(self.user_prefix(), self.batch_key(batch_id));
        Ok(txn
            .scan::<MutationBatch>(Table::Mutations, &range)?
            .into_iter()
            .next()
            .map(|(_, batch)| batch))
    }

    pub fn highest_unacknowledged_batch_id(&self, txn: &Transaction<'_>) -> FirestoreResult<BatchId> {
        Ok(self
            .all_mutation_batches(txn)?
            .last()
            .map(MutationBatch::batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn all_mutation_batches(&self, txn: &Transaction<'_>) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(txn
            .scan::<MutationBatch>(Table::Mutations, &KeyRange::prefix(self.user_prefix()))?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    /// Ids of batches touching `key`, ascending.
    fn batch_ids_for_key(&self, txn: &Transaction<'_>, key: &DocumentKey) -> FirestoreResult<Vec<BatchId>> {
        let prefix = prefixed_path_key(self.user_prefix(), key.path());
        let depth = prefix.len() + 1;
        Ok(txn
            .scan_keys(Table::DocumentMutations, &KeyRange::prefix(prefix))?
            .into_iter()
            .filter(|row| row.len() == depth)
            .filter_map(|row| match row.last() {
                Some(KeyPart::Int(id)) => Some(*id as BatchId),
                _ => None,
            })
            .collect())
    }

    fn lookup_all(&self, txn: &Transaction<'_>, ids: BTreeSet<BatchId>) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(batch) = self.lookup_mutation_batch(txn, id)? {
                batches.push(batch);
            }
        }
        Ok(batches)
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        txn: &Transaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let ids = self.batch_ids_for_key(txn, key)?.into_iter().collect();
        self.lookup_all(txn, ids)
    }

    pub fn all_mutation_batches_affecting_document_keys<'k, I>(
        &self,
        txn: &Transaction<'_>,
        keys: I,
    ) -> FirestoreResult<Vec<MutationBatch>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut ids = BTreeSet::new();
        for key in keys {
            ids.extend(self.batch_ids_for_key(txn, key)?);
        }
        self.lookup_all(txn, ids)
    }

    /// Batches touching documents directly inside the query's collection.
    /// Collection group queries are fanned out by the caller.
    pub fn all_mutation_batches_affecting_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "collection group queries must be resolved per collection",
        );
        let prefix = prefixed_path_key(self.user_prefix(), query.path());
        // Immediate children: one id segment plus the batch id.
        let depth = prefix.len() + 2;
        let mut ids = BTreeSet::new();
        for row in txn.scan_keys(Table::DocumentMutations, &KeyRange::prefix(prefix))? {
            if row.len() != depth {
                continue;
            }
            if let Some(KeyPart::Int(id)) = row.last() {
                ids.insert(*id as BatchId);
            }
        }
        self.lookup_all(txn, ids)
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut Transaction<'_>,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        hard_assert(
            batch.batch_id() > metadata.last_acknowledged_batch_id,
            "mutation batches must be acknowledged in order",
        );
        metadata.last_acknowledged_batch_id = batch.batch_id();
        metadata.last_stream_token = stream_token;
        self.put_metadata(txn, &metadata)
    }

    pub fn last_stream_token(&self, txn: &Transaction<'_>) -> FirestoreResult<Vec<u8>> {
        Ok(self.metadata(txn)?.last_stream_token)
    }

    pub fn set_last_stream_token(&self, txn: &mut Transaction<'_>, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = stream_token;
        self.put_metadata(txn, &metadata)
    }

    /// Removes an acknowledged or rejected batch. It must be the oldest
    /// pending batch for each of its documents.
    pub fn remove_mutation_batch(&self, txn: &mut Transaction<'_>, batch: &MutationBatch) -> FirestoreResult<()> {
        let batch_id = batch.batch_id();
        for key in batch.keys() {
            let ids = self.batch_ids_for_key(txn, &key)?;
            hard_assert(
                ids.first() == Some(&batch_id),
                format!("batch {batch_id} is not the oldest pending batch for {key}"),
            );
            let mut row = prefixed_path_key(self.user_prefix(), key.path());
            row.push(KeyPart::from(batch_id));
            txn.delete(Table::DocumentMutations, &row)?;
        }
        txn.delete(Table::Mutations, &self.batch_key(batch_id))
    }

    /// Whether any user's queue holds a mutation for `key`.
    pub fn any_queue_contains_key(txn: &Transaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        for user_row in txn.scan_keys(Table::MutationQueues, &KeyRange::all())? {
            let prefix = prefixed_path_key(user_row.clone(), key.path());
            let depth = prefix.len() + 1;
            let found = txn
                .scan_keys(Table::DocumentMutations, &KeyRange::prefix(prefix))?
                .into_iter()
                .any(|row| row.len() == depth);
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn record_batch_state(
        &self,
        txn: &mut Transaction<'_>,
        batch_id: BatchId,
        state: &BatchState,
    ) -> FirestoreResult<()> {
        txn.put(Table::MutationResults, self.batch_key(batch_id), state)
    }

    /// Removes and returns the recorded outcome of `batch_id`, if any.
    pub fn take_batch_state(&self, txn: &mut Transaction<'_>, batch_id: BatchId) -> FirestoreResult<Option<BatchState>> {
        let key = self.batch_key(batch_id);
        let state = txn.get(Table::MutationResults, &key)?;
        if state.is_some() {
            txn.delete(Table::MutationResults, &key)?;
        }
        Ok(state)
    }

    /// Keys with pending mutations in this queue.
    pub fn pending_keys(&self, txn: &Transaction<'_>) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let mut keys = BTreeSet::new();
        for row in txn.scan_keys(Table::DocumentMutations, &KeyRange::prefix(self.user_prefix()))? {
            keys.insert(DocumentKey::from_path(path_from_key(&row, 1))?);
        }
        Ok(keys)
    }

    /// Verifies that an empty queue carries no dangling document rows.
    pub fn perform_consistency_check(&self, txn: &Transaction<'_>) -> FirestoreResult<()> {
        if self.is_empty(txn)? {
            let dangling = txn.scan_keys(Table::DocumentMutations, &KeyRange::prefix(self.user_prefix()))?;
            hard_assert(
                dangling.is_empty(),
                format!("document mutation rows remain for an empty queue: {}", dangling.len()),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::kv_store::TransactionMode;
    use crate::local::persistence::Persistence;
    use crate::model::{FieldPath, Precondition, ResourcePath};
    use crate::value::{FirestoreValue, MapValue};

    fn set(path: &str) -> Mutation {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("x").unwrap(), FirestoreValue::from_integer(1));
        Mutation::set(DocumentKey::from_string(path).unwrap(), data, Precondition::None)
    }

    fn write<T>(persistence: &Persistence, f: impl FnMut(&mut Transaction<'_>) -> FirestoreResult<T>) -> T {
        persistence.run_transaction("test", TransactionMode::ReadWrite, f).unwrap()
    }

    #[test]
    fn batches_get_increasing_ids_and_are_found_by_key() {
        let persistence = Persistence::memory("c");
        let queue = MutationQueue::new(&User::anonymous());
        let (a, b) = write(&persistence, |txn| {
            queue.start(txn)?;
            let a = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
            let b = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a/msgs/m"), set("rooms/b")])?;
            Ok((a, b))
        });
        assert!(b.batch_id() > a.batch_id());

        write(&persistence, |txn| {
            let key = DocumentKey::from_string("rooms/a").unwrap();
            let affecting = queue.all_mutation_batches_affecting_document_key(txn, &key)?;
            assert_eq!(affecting.len(), 1);
            let query = Query::new(ResourcePath::from_string("rooms").unwrap());
            assert_eq!(queue.all_mutation_batches_affecting_query(txn, &query)?.len(), 2);
            let next = queue.next_mutation_batch_after_batch_id(txn, a.batch_id())?;
            assert_eq!(next.map(|batch| batch.batch_id()), Some(b.batch_id()));
            assert_eq!(queue.highest_unacknowledged_batch_id(txn)?, b.batch_id());
            Ok(())
        });
    }

    #[test]
    fn queues_are_isolated_per_user() {
        let persistence = Persistence::memory("c");
        let alice = MutationQueue::new(&User::authenticated("alice"));
        let bob = MutationQueue::new(&User::authenticated("bob"));
        write(&persistence, |txn| {
            alice.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
            assert!(bob.is_empty(txn)?);
            assert!(!alice.is_empty(txn)?);
            Ok(())
        });
    }

    #[test]
    fn removing_batches_clears_key_rows() {
        let persistence = Persistence::memory("c");
        let queue = MutationQueue::new(&User::anonymous());
        write(&persistence, |txn| {
            queue.start(txn)?;
            let batch = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
            let key = DocumentKey::from_string("rooms/a").unwrap();
            assert!(MutationQueue::any_queue_contains_key(txn, &key)?);
            queue.acknowledge_batch(txn, &batch, vec![7])?;
            queue.remove_mutation_batch(txn, &batch)?;
            assert!(!MutationQueue::any_queue_contains_key(txn, &key)?);
            assert_eq!(queue.last_stream_token(txn)?, vec![7]);
            queue.perform_consistency_check(txn)
        });
    }

    #[test]
    #[should_panic(expected = "not the oldest pending batch")]
    fn removing_out_of_order_is_fatal() {
        let persistence = Persistence::memory("c");
        let queue = MutationQueue::new(&User::anonymous());
        write(&persistence, |txn| {
            queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
            let second = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
            queue.remove_mutation_batch(txn, &second)
        });
    }

    #[test]
    fn batch_states_are_taken_once() {
        let persistence = Persistence::memory("c");
        let queue = MutationQueue::new(&User::anonymous());
        write(&persistence, |txn| {
            queue.record_batch_state(txn, 4, &BatchState::Acknowledged)?;
            assert_eq!(queue.take_batch_state(txn, 4)?, Some(BatchState::Acknowledged));
            assert_eq!(queue.take_batch_state(txn, 4)?, None);
            Ok(())
        });
    }
}
