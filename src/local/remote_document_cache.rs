use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::index_manager::IndexManager;
use crate::local::kv_store::{KeyRange, Table};
use crate::local::query_engine::QueryContext;
use crate::local::persistence::{path_from_key, path_key, Transaction};
use crate::model::{
    DocumentKey, DocumentKeySet, IndexOffset, MutableDocument, MutableDocumentMap, ResourcePath,
    SnapshotVersion,
};
use crate::util::hard_assert;
use crate::value::estimate_map_byte_size;

const GLOBAL_REMOTE_DOCUMENT_SIZE: &str = "remote_document_size";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RemoteDocumentRow {
    document: MutableDocument,
    size: i64,
}

fn document_size(document: &MutableDocument) -> i64 {
    let key_size: usize = document.key().path().iter().map(String::len).sum();
    (key_size + estimate_map_byte_size(document.data())) as i64
}

/// Last known backend state of each document, with byte-size accounting.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self
    }

    /// Stores `document` as read at `read_time`, replacing any previous entry.
    pub fn add_entry(
        &self,
        txn: &mut Transaction<'_>,
        document: &MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        hard_assert(!read_time.is_min(), "cannot add a document with a read time of zero");
        let key = path_key(document.key().path());
        let previous_size = txn
            .get::<RemoteDocumentRow>(Table::RemoteDocuments, &key)?
            .map(|row| row.size)
            .unwrap_or(0);

        let mut stored = document.clone();
        stored.set_read_time(read_time);
        let size = document_size(&stored);
        txn.put(Table::RemoteDocuments, key, &RemoteDocumentRow { document: stored, size })?;
        self.adjust_size(txn, size - previous_size)?;
        IndexManager::add_to_collection_parent_index(txn, &document.key().collection_path())
    }

    pub fn remove_entry(&self, txn: &mut Transaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        let row_key = path_key(key.path());
        if let Some(row) = txn.get::<RemoteDocumentRow>(Table::RemoteDocuments, &row_key)? {
            txn.delete(Table::RemoteDocuments, &row_key)?;
            self.adjust_size(txn, -row.size)?;
        }
        Ok(())
    }

    fn adjust_size(&self, txn: &mut Transaction<'_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let current = self.byte_size(txn)?;
        txn.put_global(GLOBAL_REMOTE_DOCUMENT_SIZE, &(current + delta))
    }

    /// Cached entry for `key`, or an invalid document when nothing is known.
    pub fn get_entry(&self, txn: &Transaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        Ok(txn
            .get::<RemoteDocumentRow>(Table::RemoteDocuments, &path_key(key.path()))?
            .map(|row| row.document)
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone())))
    }

    pub fn get_entries<'k, I>(&self, txn: &Transaction<'_>, keys: I) -> FirestoreResult<MutableDocumentMap>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut documents = BTreeMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(documents)
    }

    fn collection_documents(&self, txn: &Transaction<'_>, collection: &ResourcePath) -> FirestoreResult<Vec<MutableDocument>> {
        let prefix = path_key(collection);
        let depth = prefix.len() + 1;
        Ok(txn
            .scan::<RemoteDocumentRow>(Table::RemoteDocuments, &KeyRange::prefix(prefix))?
            .into_iter()
            .filter(|(key, _)| key.len() == depth)
            .map(|(_, row)| row.document)
            .collect())
    }

    /// Documents of the query's collection read after `offset` that match
    /// the query, plus every document in `mutated_keys` regardless of match.
    pub fn get_documents_matching_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &DocumentKeySet,
        mut context: Option<&mut QueryContext>,
    ) -> FirestoreResult<MutableDocumentMap> {
        hard_assert(
            !query.is_collection_group_query(),
            "collection group queries must be resolved per collection",
        );
        let mut results = BTreeMap::new();
        for document in self.collection_documents(txn, query.path())? {
            if IndexOffset::from_document(&document) <= *offset {
                continue;
            }
            if let Some(context) = context.as_deref_mut() {
                context.documents_read_count += 1;
            }
            if mutated_keys.contains(document.key()) || query.matches(&document) {
                results.insert(document.key().clone(), document);
            }
        }
        Ok(results)
    }

    /// Up to `limit` documents of a collection group read after `offset`,
    /// in offset order.
    pub fn get_all_from_collection_group(
        &self,
        txn: &Transaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut candidates = Vec::new();
        for parent in IndexManager::get_collection_parents(txn, collection_group)? {
            let collection = parent.child(collection_group);
            for document in self.collection_documents(txn, &collection)? {
                let document_offset = IndexOffset::from_document(&document);
                if document_offset > *offset {
                    candidates.push((document_offset, document));
                }
            }
        }
        candidates.sort_by(|(left, _), (right, _)| left.cmp(right));
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, document)| (document.key().clone(), document))
            .collect())
    }

    pub fn document_keys(&self, txn: &Transaction<'_>) -> FirestoreResult<Vec<DocumentKey>> {
        txn.scan_keys(Table::RemoteDocuments, &KeyRange::all())?
            .into_iter()
            .map(|key| DocumentKey::from_path(path_from_key(&key, 0)))
            .collect()
    }

    /// Estimated total size of cached documents in bytes.
    pub fn byte_size(&self, txn: &Transaction<'_>) -> FirestoreResult<i64> {
        Ok(txn.get_global::<i64>(GLOBAL_REMOTE_DOCUMENT_SIZE)?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::local::kv_store::TransactionMode;
    use crate::local::persistence::Persistence;
    use crate::model::FieldPath;
    use crate::value::{FirestoreValue, MapValue};

    fn doc(path: &str, value: i64, version: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("v").unwrap(), FirestoreValue::from_integer(value));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            data,
        )
    }

    #[test]
    fn tracks_entries_and_size() {
        let persistence = Persistence::memory("c");
        let cache = RemoteDocumentCache::new();
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                let a = doc("rooms/a", 1, 10);
                cache.add_entry(txn, &a, SnapshotVersion::from_micros(10))?;
                let size = cache.byte_size(txn)?;
                assert!(size > 0);

                let read = cache.get_entry(txn, a.key())?;
                assert_eq!(read.read_time(), SnapshotVersion::from_micros(10));
                assert!(read.is_found_document());

                let missing = cache.get_entry(txn, &DocumentKey::from_string("rooms/z").unwrap())?;
                assert!(!missing.is_valid_document());

                cache.remove_entry(txn, a.key())?;
                assert_eq!(cache.byte_size(txn)?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn query_scan_respects_offset_and_mutated_keys() {
        let persistence = Persistence::memory("c");
        let cache = RemoteDocumentCache::new();
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &doc("rooms/a", 1, 1), SnapshotVersion::from_micros(1))?;
                cache.add_entry(txn, &doc("rooms/b", 2, 2), SnapshotVersion::from_micros(2))?;
                cache.add_entry(txn, &doc("rooms/b/msgs/m", 3, 3), SnapshotVersion::from_micros(3))?;

                let query = Query::new(ResourcePath::from_string("rooms").unwrap());
                let mut context = QueryContext::default();
                let all = cache.get_documents_matching_query(
                    txn,
                    &query,
                    &IndexOffset::none(),
                    &BTreeSet::new(),
                    Some(&mut context),
                )?;
                assert_eq!(all.len(), 2);
                assert_eq!(context.documents_read_count, 2);

                let offset = IndexOffset::successor_of_read_time(SnapshotVersion::from_micros(1), -1);
                let recent = cache.get_documents_matching_query(txn, &query, &offset, &BTreeSet::new(), None)?;
                assert_eq!(recent.keys().map(|k| k.to_string()).collect::<Vec<_>>(), vec!["rooms/b"]);

                let group = cache.get_all_from_collection_group(txn, "msgs", &IndexOffset::none(), 10)?;
                assert_eq!(group.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
