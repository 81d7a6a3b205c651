use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::document_overlay_cache::DocumentOverlayCache;
use crate::local::index_manager::IndexManager;
use crate::local::mutation_queue::MutationQueue;
use crate::local::persistence::Transaction;
use crate::local::query_engine::QueryContext;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, DocumentKeySet, FieldMask, IndexOffset, MutableDocument,
    MutableDocumentMap, MutationKind, Overlay, OverlayedDocument, Timestamp, User,
};

/// Documents read for the index backfiller, with the largest batch id whose
/// overlays they include.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalDocumentsResult {
    pub batch_id: BatchId,
    pub documents: MutableDocumentMap,
}

/// Local view of documents: remote documents with their overlays applied.
///
/// Owns the per-user caches, so a user change builds a new view.
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(user: &User) -> Self {
        Self {
            remote_documents: RemoteDocumentCache::new(),
            mutation_queue: MutationQueue::new(user),
            overlays: DocumentOverlayCache::new(user),
            index_manager: IndexManager::new(user),
        }
    }

    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.remote_documents
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn overlays(&self) -> &DocumentOverlayCache {
        &self.overlays
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    /// Local view of one document.
    pub fn get_document(&self, txn: &Transaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let overlay = self.overlays.get_overlay(txn, key)?;
        let mut document = self.base_document(txn, key, overlay.as_ref())?;
        if let Some(overlay) = overlay {
            overlay
                .mutation()
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    pub fn get_documents<'k, I>(&self, txn: &mut Transaction<'_>, keys: I) -> FirestoreResult<MutableDocumentMap>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        Ok(self
            .get_local_view_of_documents(txn, documents, &BTreeSet::new())?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Local views of the given remote documents.
    ///
    /// Documents in `existence_state_changed` whose overlay depends on the
    /// committed state get their overlays recalculated first.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut Transaction<'_>,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlays.get_overlays(txn, documents.keys())?;
        self.compute_views(txn, documents, overlays, existence_state_changed)
    }

    fn compute_views(
        &self,
        txn: &mut Transaction<'_>,
        documents: MutableDocumentMap,
        overlays: BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut to_recalculate = MutableDocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut views = BTreeMap::new();
        let now = Timestamp::now();

        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let depends_on_base = overlay.map_or(true, |overlay| {
                matches!(overlay.mutation().kind(), MutationKind::Patch { .. })
            });
            if existence_state_changed.contains(&key) && depends_on_base {
                to_recalculate.insert(key, document);
                continue;
            }
            match overlay {
                Some(overlay) => {
                    mutated_fields.insert(key.clone(), overlay.mutation().field_mask());
                    overlay
                        .mutation()
                        .apply_to_local_view(&mut document, overlay.mutation().field_mask(), now);
                }
                None => {
                    mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
                }
            }
            views.insert(key, document);
        }

        let recalculated_fields = self.recalculate_and_save_overlays(txn, &mut to_recalculate)?;
        mutated_fields.extend(recalculated_fields);
        views.extend(to_recalculate);

        Ok(views
            .into_iter()
            .map(|(key, document)| {
                let mutated = mutated_fields.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                (
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields: mutated,
                    },
                )
            })
            .collect())
    }

    /// Replays every pending batch over `documents` (remote state in, local
    /// view out) and stores the squashed overlay of each document under the
    /// largest batch id touching it. Returns the mutated fields per document.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut Transaction<'_>,
        documents: &mut MutableDocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(txn, documents.keys())?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                masks.insert(key.clone(), batch.apply_to_local_view(document, mask));
                keys_by_batch.entry(batch.batch_id()).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, keys) in keys_by_batch.into_iter().rev() {
            let mut batch_overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(&key) else {
                    continue;
                };
                let mask = masks.get(&key).cloned().flatten();
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    batch_overlays.insert(key, mutation);
                }
            }
            self.overlays.save_overlays(txn, batch_id, &batch_overlays)?;
        }
        Ok(masks)
    }

    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut Transaction<'_>,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys)?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Local documents matching `query` among those changed after `offset`.
    pub fn get_documents_matching_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mut context: Option<&mut QueryContext>,
    ) -> FirestoreResult<MutableDocumentMap> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key)?;
            let mut results = MutableDocumentMap::new();
            if document.is_found_document() {
                results.insert(key, document);
            }
            return Ok(results);
        }
        if let Some(group) = query.collection_group_id() {
            let mut results = MutableDocumentMap::new();
            for parent in IndexManager::get_collection_parents(txn, group)? {
                let collection_query = query.as_collection_query_at_path(parent.child(group));
                results.extend(self.get_documents_matching_collection_query(
                    txn,
                    &collection_query,
                    offset,
                    context.as_deref_mut(),
                )?);
            }
            return Ok(results);
        }
        self.get_documents_matching_collection_query(txn, query, offset, context)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut overlays = self
            .overlays
            .get_overlays_for_collection(txn, query.path(), offset.largest_batch_id)?;
        let overlay_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut candidates = self
            .remote_documents
            .get_documents_matching_query(txn, query, offset, &overlay_keys, context)?;

        // Documents may match only through their overlay.
        for key in overlay_keys {
            candidates
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key));
        }
        // Older overlays still apply to documents read after the offset.
        let missing: Vec<DocumentKey> = candidates
            .keys()
            .filter(|key| !overlays.contains_key(*key))
            .cloned()
            .collect();
        overlays.extend(self.overlays.get_overlays(txn, missing.iter())?);

        let now = Timestamp::now();
        let mut results = MutableDocumentMap::new();
        for (key, mut document) in candidates {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation()
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), now);
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        Ok(results)
    }

    /// Up to `count` documents of `collection_group` changed after `offset`,
    /// for index backfill.
    pub fn get_next_documents(
        &self,
        txn: &mut Transaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> FirestoreResult<LocalDocumentsResult> {
        let mut documents = self
            .remote_documents
            .get_all_from_collection_group(txn, collection_group, offset, count)?;
        let mut overlays = if count > documents.len() {
            self.overlays.get_overlays_for_collection_group(
                txn,
                collection_group,
                offset.largest_batch_id,
                count - documents.len(),
            )?
        } else {
            BTreeMap::new()
        };

        let mut largest_batch_id = offset.largest_batch_id;
        for (key, overlay) in &overlays {
            if !documents.contains_key(key) {
                let document = self.base_document(txn, key, Some(overlay))?;
                documents.insert(key.clone(), document);
            }
            largest_batch_id = largest_batch_id.max(overlay.largest_batch_id());
        }
        let missing: Vec<DocumentKey> = documents
            .keys()
            .filter(|key| !overlays.contains_key(*key))
            .cloned()
            .collect();
        overlays.extend(self.overlays.get_overlays(txn, missing.iter())?);

        let views = self.compute_views(txn, documents, overlays, &BTreeSet::new())?;
        Ok(LocalDocumentsResult {
            batch_id: largest_batch_id,
            documents: views
                .into_iter()
                .map(|(key, overlayed)| (key, overlayed.document))
                .collect(),
        })
    }

    /// Remote document an overlay applies to. Set and delete overlays
    /// replace the document, so it is not read.
    fn base_document(
        &self,
        txn: &Transaction<'_>,
        key: &DocumentKey,
        overlay: Option<&Overlay>,
    ) -> FirestoreResult<MutableDocument> {
        match overlay.map(|overlay| overlay.mutation().kind()) {
            None | Some(MutationKind::Patch { .. }) => self.remote_documents.get_entry(txn, key),
            Some(_) => Ok(MutableDocument::new_invalid_document(key.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::kv_store::TransactionMode;
    use crate::local::persistence::Persistence;
    use crate::model::{FieldPath, Mutation, Precondition, ResourcePath, SnapshotVersion};
    use crate::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(fields: &[(&str, i64)]) -> MapValue {
        let mut data = MapValue::empty();
        for (name, value) in fields {
            data.set(&FieldPath::from_dot_separated(name).unwrap(), FirestoreValue::from_integer(*value));
        }
        data
    }

    fn patch(path: &str, fields: &[(&str, i64)]) -> Mutation {
        let mask = FieldMask::new(fields.iter().map(|(name, _)| FieldPath::from_dot_separated(name).unwrap()));
        Mutation::patch(key(path), map(fields), mask, Precondition::None)
    }

    fn write(view: &LocalDocumentsView, txn: &mut Transaction<'_>, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let batch = view
            .mutation_queue()
            .add_mutation_batch(txn, Timestamp::now(), Vec::new(), mutations)?;
        let mut documents = view.remote_documents().get_entries(txn, batch.keys().iter())?;
        view.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    #[test]
    fn consecutive_patches_squash_into_one_overlay() {
        let persistence = Persistence::memory("c");
        let view = LocalDocumentsView::new(&User::anonymous());
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                view.mutation_queue().start(txn)?;
                let base = MutableDocument::new_found_document(key("rooms/a"), SnapshotVersion::from_micros(1), map(&[("z", 0)]));
                view.remote_documents().add_entry(txn, &base, SnapshotVersion::from_micros(1))?;

                write(&view, txn, vec![patch("rooms/a", &[("x", 1)])])?;
                write(&view, txn, vec![patch("rooms/a", &[("y", 2)])])?;

                let overlay = view.overlays().get_overlay(txn, &key("rooms/a"))?.unwrap();
                assert_eq!(overlay.largest_batch_id(), 2);
                match overlay.mutation().kind() {
                    MutationKind::Patch { data, field_mask } => {
                        assert_eq!(data, &map(&[("x", 1), ("y", 2)]));
                        assert_eq!(field_mask.fields().len(), 2);
                    }
                    other => panic!("unexpected overlay {other:?}"),
                }

                let local = view.get_document(txn, &key("rooms/a"))?;
                assert_eq!(local.data(), &map(&[("x", 1), ("y", 2), ("z", 0)]));
                assert!(local.has_local_mutations());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn query_includes_documents_matching_only_through_overlays() {
        let persistence = Persistence::memory("c");
        let view = LocalDocumentsView::new(&User::anonymous());
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                view.mutation_queue().start(txn)?;
                let remote = MutableDocument::new_found_document(key("rooms/a"), SnapshotVersion::from_micros(1), map(&[("n", 1)]));
                view.remote_documents().add_entry(txn, &remote, SnapshotVersion::from_micros(1))?;
                write(
                    &view,
                    txn,
                    vec![Mutation::set(key("rooms/b"), map(&[("n", 2)]), Precondition::None)],
                )?;

                let query = Query::new(ResourcePath::from_string("rooms").unwrap());
                let results = view.get_documents_matching_query(txn, &query, &IndexOffset::none(), None)?;
                assert_eq!(results.len(), 2);
                assert!(results[&key("rooms/b")].has_local_mutations());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn next_documents_include_overlay_only_documents() {
        let persistence = Persistence::memory("c");
        let view = LocalDocumentsView::new(&User::anonymous());
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                view.mutation_queue().start(txn)?;
                write(
                    &view,
                    txn,
                    vec![Mutation::set(key("rooms/a"), map(&[("n", 1)]), Precondition::None)],
                )?;
                let result = view.get_next_documents(txn, "rooms", &IndexOffset::none(), 10)?;
                assert_eq!(result.batch_id, 1);
                assert_eq!(result.documents.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
