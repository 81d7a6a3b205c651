use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::FirestoreResult;
use crate::local::local_documents_view::{LocalDocumentsResult, LocalDocumentsView};
use crate::local::persistence::Transaction;
use crate::model::IndexOffset;

pub const INITIAL_BACKFILL_DELAY: Duration = Duration::from_secs(15);
pub const REGULAR_BACKFILL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_DOCUMENTS_TO_PROCESS: usize = 50;

/// Writes index entries for documents cached before their index existed,
/// a bounded number of documents per pass.
#[derive(Clone, Copy, Debug)]
pub struct IndexBackfiller {
    max_documents_to_process: usize,
}

impl Default for IndexBackfiller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DOCUMENTS_TO_PROCESS)
    }
}

impl IndexBackfiller {
    pub fn new(max_documents_to_process: usize) -> Self {
        Self { max_documents_to_process }
    }

    /// Indexes up to the configured number of documents, visiting the
    /// collection group updated least recently first. Returns the number of
    /// documents processed.
    pub fn backfill(&self, txn: &mut Transaction<'_>, local_documents: &LocalDocumentsView) -> FirestoreResult<usize> {
        let index_manager = local_documents.index_manager();
        let mut processed_groups = BTreeSet::new();
        let mut remaining = self.max_documents_to_process;

        while remaining > 0 {
            let Some(group) = index_manager.get_next_collection_group_to_update(txn)? else {
                break;
            };
            if !processed_groups.insert(group.clone()) {
                break;
            }
            log::debug!("processing collection group {group} for index backfill");
            remaining -= self.write_entries_for_collection_group(txn, local_documents, &group, remaining)?;
        }

        let processed = self.max_documents_to_process - remaining;
        if processed > 0 {
            log::debug!("index backfill processed {processed} documents");
        }
        Ok(processed)
    }

    fn write_entries_for_collection_group(
        &self,
        txn: &mut Transaction<'_>,
        local_documents: &LocalDocumentsView,
        collection_group: &str,
        limit: usize,
    ) -> FirestoreResult<usize> {
        let index_manager = local_documents.index_manager();
        let existing_offset = index_manager.get_min_offset_for_group(txn, collection_group)?;
        let next_batch = local_documents.get_next_documents(txn, collection_group, &existing_offset, limit)?;
        index_manager.update_index_entries(txn, next_batch.documents.values())?;
        let new_offset = new_offset(existing_offset, &next_batch);
        index_manager.update_collection_group(txn, collection_group, new_offset)?;
        Ok(next_batch.documents.len())
    }
}

fn new_offset(existing: IndexOffset, result: &LocalDocumentsResult) -> IndexOffset {
    let max_offset = result
        .documents
        .values()
        .map(IndexOffset::from_document)
        .fold(existing.clone(), |max, offset| if offset > max { offset } else { max });
    IndexOffset::new(
        max_offset.read_time,
        max_offset.document_key,
        result.batch_id.max(existing.largest_batch_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Filter, FilterOperator, Query};
    use crate::local::kv_store::TransactionMode;
    use crate::local::persistence::Persistence;
    use crate::model::{
        DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, MutableDocument, ResourcePath, SnapshotVersion, User,
    };
    use crate::value::{FirestoreValue, MapValue};

    fn add_document(txn: &mut Transaction<'_>, view: &LocalDocumentsView, path: &str, micros: i64, value: i64) {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("rank").unwrap(), FirestoreValue::from_integer(value));
        let version = SnapshotVersion::from_micros(micros);
        let document = MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), version, data);
        view.remote_documents().add_entry(txn, &document, version).unwrap();
    }

    #[test]
    fn backfills_in_bounded_passes() {
        let persistence = Persistence::memory("c");
        let view = LocalDocumentsView::new(&User::anonymous());
        let backfiller = IndexBackfiller::new(2);
        let rank = FieldPath::from_dot_separated("rank").unwrap();

        persistence
            .run_transaction("setup", TransactionMode::ReadWrite, |txn| {
                let index = FieldIndex::new("rooms", vec![IndexSegment::new(rank.clone(), IndexKind::Ascending)]);
                view.index_manager().add_field_index(txn, &index)?;
                for (i, path) in ["rooms/a", "rooms/b", "rooms/c"].into_iter().enumerate() {
                    add_document(txn, &view, path, 10 + i as i64, 1);
                }
                Ok(())
            })
            .unwrap();

        let first = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| backfiller.backfill(txn, &view))
            .unwrap();
        assert_eq!(first, 2);
        let second = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| backfiller.backfill(txn, &view))
            .unwrap();
        assert_eq!(second, 1);
        let third = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| backfiller.backfill(txn, &view))
            .unwrap();
        assert_eq!(third, 0);

        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_filter(Filter::field(rank, FilterOperator::Equal, FirestoreValue::from_integer(1)).unwrap());
        let keys = persistence
            .run_transaction("lookup", TransactionMode::ReadOnly, |txn| {
                view.index_manager().get_documents_matching_target(txn, &query.to_target())
            })
            .unwrap()
            .unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn offset_keeps_largest_batch_id() {
        let existing = IndexOffset::new(SnapshotVersion::from_micros(5), DocumentKey::empty(), 7);
        let result = LocalDocumentsResult {
            batch_id: 3,
            documents: Default::default(),
        };
        let offset = new_offset(existing.clone(), &result);
        assert_eq!(offset, existing);
    }
}
