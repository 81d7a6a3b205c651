use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::constants::RESUME_TOKEN_MAX_AGE_MICROS;
use crate::core::{Query, Target, TargetData, TargetIdGenerator, TargetPurpose};
use crate::error::{FirestoreError, FirestoreResult};
use crate::local::index_backfiller::IndexBackfiller;
use crate::local::kv_store::TransactionMode;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::local::mutation_queue::BatchState;
use crate::local::persistence::{Persistence, Transaction};
use crate::local::query_engine::{IndexAutoCreationSettings, QueryEngine};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_cache::TargetCache;
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, FieldIndex, FieldMask, MutableDocument, MutableDocumentMap, Mutation,
    MutationBatch, MutationBatchResult, Precondition, SnapshotVersion, TargetId, Timestamp, User,
};
use crate::remote::{RemoteEvent, TargetChange};
use crate::util::hard_assert;

/// Tunables of the local store.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStoreSettings {
    pub lru_params: LruParams,
    pub index_auto_creation: IndexAutoCreationSettings,
}

/// Result of a local write: the new batch and the local views it changed.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: MutableDocumentMap,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: MutableDocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Batches that disappeared and appeared with a user change, and the local
/// views of every document they touch.
#[derive(Clone, Debug)]
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
    pub affected_documents: MutableDocumentMap,
}

/// Documents that entered or left a view, reported so that the local store
/// keeps them from being collected while a view shows them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

/// Coordinates the local caches. Every operation runs in one persistence
/// transaction.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    user: User,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    target_cache: TargetCache,
    garbage_collector: LruGarbageCollector,
    index_backfiller: IndexBackfiller,
    /// Targets with active listeners.
    target_data_by_id: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
    local_view_references: ReferenceSet,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, user: User, settings: LocalStoreSettings) -> Self {
        Self {
            persistence,
            local_documents: LocalDocumentsView::new(&user),
            user,
            query_engine: QueryEngine::new(settings.index_auto_creation),
            target_cache: TargetCache::new(),
            garbage_collector: LruGarbageCollector::new(settings.lru_params),
            index_backfiller: IndexBackfiller::default(),
            target_data_by_id: BTreeMap::new(),
            target_id_by_canonical_id: BTreeMap::new(),
            local_view_references: ReferenceSet::new(),
        }
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn start(&self) -> FirestoreResult<()> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Start MutationQueue", TransactionMode::ReadWrite, |txn| queue.start(txn))
    }

    /// Switches to `user`'s mutation queue and overlays.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_batches = self.all_mutation_batches()?;
        self.local_documents = LocalDocumentsView::new(&user);
        self.user = user;
        self.start()?;

        let local_documents = &self.local_documents;
        self.persistence
            .run_transaction("Handle user change", TransactionMode::ReadWrite, |txn| {
                let new_batches = local_documents.mutation_queue().all_mutation_batches(txn)?;
                let mut changed_keys = DocumentKeySet::new();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    changed_keys.extend(batch.keys());
                }
                Ok(UserChangeResult {
                    removed_batch_ids: old_batches.iter().map(MutationBatch::batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(MutationBatch::batch_id).collect(),
                    affected_documents: local_documents.get_documents(txn, &changed_keys)?,
                })
            })
    }

    /// Enqueues `mutations` as one batch and returns the resulting local
    /// views.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key().clone()).collect();
        let local_documents = &self.local_documents;

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote_documents = local_documents.remote_documents().get_entries(txn, &keys)?;
                let without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = local_documents.get_local_view_of_documents(txn, remote_documents, &BTreeSet::new())?;

                // Non-idempotent transforms remember the value they were applied
                // to, so that later local views replay them consistently.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(view) = overlayed.get(mutation.key()) else {
                        continue;
                    };
                    if let Some(base_value) = mutation.extract_transform_base_value(&view.document) {
                        let mask = FieldMask::new(base_value.field_mask());
                        base_mutations.push(Mutation::patch(
                            mutation.key().clone(),
                            base_value,
                            mask,
                            Precondition::Exists(true),
                        ));
                    }
                }

                let batch = local_documents.mutation_queue().add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                )?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                local_documents.overlays().save_overlays(txn, batch.batch_id(), &overlays)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id(),
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
    }

    /// Applies an acknowledged batch to the remote document cache and removes
    /// it from the queue. Returns the affected local views.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> FirestoreResult<MutableDocumentMap> {
        let local_documents = &self.local_documents;
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &result.batch;
                let queue = local_documents.mutation_queue();
                queue.acknowledge_batch(txn, batch, result.stream_token.clone())?;
                apply_write_to_remote_documents(txn, local_documents, result)?;
                queue.remove_mutation_batch(txn, batch)?;
                queue.record_batch_state(txn, batch.batch_id(), &BatchState::Acknowledged)?;
                queue.perform_consistency_check(txn)?;

                let keys = batch.keys();
                for key in &keys {
                    target_cache.update_sentinel(txn, key)?;
                }
                local_documents.overlays().remove_overlays_for_batch_id(txn, &keys, batch.batch_id())?;
                local_documents.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                local_documents.get_documents(txn, &keys)
            })
    }

    /// Removes a batch the backend rejected. Returns the affected local views.
    pub fn reject_batch(&mut self, batch_id: BatchId, error: &FirestoreError) -> FirestoreResult<MutableDocumentMap> {
        let local_documents = &self.local_documents;
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let queue = local_documents.mutation_queue();
                let batch = queue.lookup_mutation_batch(txn, batch_id)?;
                hard_assert(batch.is_some(), format!("attempt to reject nonexistent batch {batch_id}"));
                let Some(batch) = batch else {
                    return Ok(MutableDocumentMap::new());
                };
                queue.remove_mutation_batch(txn, &batch)?;
                queue.record_batch_state(
                    txn,
                    batch_id,
                    &BatchState::Rejected {
                        code: error.code,
                        message: error.message().to_string(),
                    },
                )?;
                queue.perform_consistency_check(txn)?;

                let keys = batch.keys();
                for key in &keys {
                    target_cache.update_sentinel(txn, key)?;
                }
                local_documents.overlays().remove_overlays_for_batch_id(txn, &keys, batch_id)?;
                local_documents.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                local_documents.get_documents(txn, &keys)
            })
    }

    /// Outcome recorded for `batch_id` by the primary client, removed once
    /// read.
    pub fn take_batch_state(&self, batch_id: BatchId) -> FirestoreResult<Option<BatchState>> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Take batch state", TransactionMode::ReadWrite, |txn| {
                queue.take_batch_state(txn, batch_id)
            })
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                queue.last_stream_token(txn)
            })
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                queue.set_last_stream_token(txn, stream_token.clone())
            })
    }

    /// First pending batch after `after_batch_id`.
    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.next_mutation_batch_after_batch_id(txn, after_batch_id)
            })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                queue.highest_unacknowledged_batch_id(txn)
            })
    }

    pub fn all_mutation_batches(&self) -> FirestoreResult<Vec<MutationBatch>> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Get all mutation batches", TransactionMode::ReadOnly, |txn| {
                queue.all_mutation_batches(txn)
            })
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                target_cache.last_remote_snapshot_version(txn)
            })
    }

    /// Applies a watch snapshot: target membership, resume tokens and the
    /// new remote documents. Returns the local views of changed documents.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<MutableDocumentMap> {
        let remote_version = event.snapshot_version;
        let local_documents = &self.local_documents;
        let target_cache = self.target_cache;
        let active_targets = &self.target_data_by_id;

        let (changes, updated_targets) =
            self.persistence
                .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                    let mut updated_targets = Vec::new();
                    for (target_id, change) in &event.target_changes {
                        let Some(old) = active_targets.get(target_id) else {
                            // Released while the event was in flight.
                            continue;
                        };
                        target_cache.remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                        target_cache.add_matching_keys(txn, &change.added_documents, *target_id)?;

                        let mut updated = old.clone().with_sequence_number(txn.sequence_number());
                        if event.target_mismatches.contains_key(target_id) {
                            updated = updated
                                .with_resume_token(Vec::new(), SnapshotVersion::min())
                                .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                        } else if !change.resume_token.is_empty() {
                            updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                        }
                        if should_persist_target_data(old, &updated, change) {
                            target_cache.update_target_data(txn, &updated)?;
                        }
                        updated_targets.push(updated);
                    }

                    let mut existence_changed = DocumentKeySet::new();
                    for key in &event.resolved_limbo_documents {
                        if event.document_updates.contains_key(key) {
                            target_cache.update_sentinel(txn, key)?;
                        }
                    }
                    let changed = populate_document_changes(
                        txn,
                        local_documents,
                        &event.document_updates,
                        remote_version,
                        &mut existence_changed,
                    )?;

                    if remote_version != SnapshotVersion::min() {
                        let last = target_cache.last_remote_snapshot_version(txn)?;
                        hard_assert(
                            remote_version >= last,
                            format!("watch stream reverted to an older snapshot version {remote_version:?} < {last:?}"),
                        );
                        target_cache.set_last_remote_snapshot_version(txn, remote_version)?;
                    }

                    let views = local_documents.get_local_view_of_documents(txn, changed, &existence_changed)?;
                    Ok((
                        views
                            .into_iter()
                            .map(|(key, overlayed)| (key, overlayed.document))
                            .collect::<MutableDocumentMap>(),
                        updated_targets,
                    ))
                })?;

        for target_data in updated_targets {
            self.target_data_by_id.insert(target_data.target_id, target_data);
        }
        Ok(changes)
    }

    /// Records which documents views show, pinning them against collection.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let references = &mut self.local_view_references;
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                for changes in view_changes {
                    references.add_references(&changes.added_keys, changes.target_id);
                    references.remove_references(&changes.removed_keys, changes.target_id);
                    for key in &changes.removed_keys {
                        if !references.contains_key(key) {
                            target_cache.update_sentinel(txn, key)?;
                        }
                    }
                }
                Ok(())
            })?;

        for changes in view_changes.iter().filter(|changes| !changes.from_cache) {
            if let Some(target_data) = self.target_data_by_id.get_mut(&changes.target_id) {
                // Views without pending limbo resolutions mark a safe resume
                // point for the query engine.
                target_data.last_limbo_free_snapshot_version = target_data.snapshot_version;
            }
        }
        Ok(())
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let local_documents = &self.local_documents;
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                local_documents.get_document(txn, key)
            })
    }

    pub fn read_documents(&self, keys: &DocumentKeySet) -> FirestoreResult<MutableDocumentMap> {
        let local_documents = &self.local_documents;
        self.persistence
            .run_transaction("Read documents", TransactionMode::ReadWrite, |txn| {
                local_documents.get_documents(txn, keys)
            })
    }

    /// Target data for `target`, reusing the persisted entry when the target
    /// was listened to before.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_cache = self.target_cache;
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = TargetIdGenerator::for_target_cache(target_cache.highest_target_id(txn)?).next();
                let target_data =
                    TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.sequence_number());
                target_cache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })?;

        let target_id = target_data.target_id;
        let keep_existing = self
            .target_data_by_id
            .get(&target_id)
            .is_some_and(|existing| existing.snapshot_version >= target_data.snapshot_version);
        if !keep_existing {
            self.target_data_by_id.insert(target_id, target_data.clone());
            self.target_id_by_canonical_id
                .insert(target_data.target.canonical_id(), target_id);
        }
        Ok(self.target_data_by_id.get(&target_id).cloned().unwrap_or(target_data))
    }

    /// Active or persisted target data for `target`.
    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|id| self.target_data_by_id.get(id))
            .filter(|target_data| &target_data.target == target)
        {
            return Ok(Some(target_data.clone()));
        }
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                target_cache.get_target_data(txn, target)
            })
    }

    pub fn active_target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_id.get(&target_id)
    }

    /// Stops tracking a target. Its persisted data stays for resumption and
    /// for the garbage collector to age out; `keep_persisted_target_data`
    /// also leaves its sequence number untouched.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_id.remove(&target_id) else {
            log::debug!("releasing target {target_id} that is not active");
            return Ok(());
        };
        if self.target_id_by_canonical_id.get(&target_data.target.canonical_id()) == Some(&target_id) {
            self.target_id_by_canonical_id.remove(&target_data.target.canonical_id());
        }

        let references = &mut self.local_view_references;
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Release target", TransactionMode::ReadWrite, |txn| {
                for key in references.remove_references_for_id(target_id) {
                    if !references.contains_key(&key) {
                        target_cache.update_sentinel(txn, &key)?;
                    }
                }
                if !keep_persisted_target_data {
                    let updated = target_data.clone().with_sequence_number(txn.sequence_number());
                    target_cache.update_target_data(txn, &updated)?;
                }
                Ok(())
            })
    }

    /// Runs `query` against the local caches. With `use_previous_results`
    /// the last limbo-free result set of the query's target seeds the
    /// execution.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target())?;
        let local_documents = &self.local_documents;
        let query_engine = &mut self.query_engine;
        let target_cache = self.target_cache;

        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        target_cache.get_matching_keys_for_target_id(txn, target_data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), DocumentKeySet::new()),
                };
                let documents = if use_previous_results {
                    query_engine.get_documents_matching_query(txn, local_documents, query, last_limbo_free, &remote_keys)?
                } else {
                    query_engine.get_documents_matching_query(
                        txn,
                        local_documents,
                        query,
                        SnapshotVersion::min(),
                        &DocumentKeySet::new(),
                    )?
                };
                Ok(QueryResult { documents, remote_keys })
            })
    }

    /// Keys the backend reported for `target_id`.
    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                target_cache.get_matching_keys_for_target_id(txn, target_id)
            })
    }

    pub fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let active: BTreeSet<TargetId> = self.target_data_by_id.keys().copied().collect();
        let collector = &self.garbage_collector;
        let references = &self.local_view_references;
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                collector.collect(txn, &active, references)
            })
    }

    pub fn backfill_indexes(&self) -> FirestoreResult<usize> {
        let backfiller = self.index_backfiller;
        let local_documents = &self.local_documents;
        self.persistence
            .run_transaction("Backfill indexes", TransactionMode::ReadWrite, |txn| {
                backfiller.backfill(txn, local_documents)
            })
    }

    /// Replaces the configured field indexes with `indexes`. Indexes that
    /// already exist keep their entries.
    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let index_manager = self.local_documents.index_manager();
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                let existing = index_manager.get_field_indexes(txn, None)?;
                for index in &existing {
                    if !indexes.iter().any(|wanted| wanted.semantic_cmp(index).is_eq()) {
                        index_manager.delete_field_index(txn, index)?;
                    }
                }
                for index in &indexes {
                    if !existing.iter().any(|present| present.semantic_cmp(index).is_eq()) {
                        index_manager.add_field_index(txn, index)?;
                    }
                }
                Ok(())
            })
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.query_engine.set_index_auto_creation_enabled(enabled);
    }
}

fn apply_write_to_remote_documents(
    txn: &mut Transaction<'_>,
    local_documents: &LocalDocumentsView,
    result: &MutationBatchResult,
) -> FirestoreResult<()> {
    let cache = local_documents.remote_documents();
    for key in result.batch.keys() {
        let mut document = cache.get_entry(txn, &key)?;
        let Some(ack_version) = result.doc_versions.get(&key).copied() else {
            hard_assert(false, format!("doc_versions should contain every mutated key ({key})"));
            continue;
        };
        if document.version() < ack_version {
            result.batch.apply_to_remote_document(&mut document, result);
            if document.is_valid_document() {
                cache.add_entry(txn, &document, result.commit_version)?;
            }
        }
    }
    Ok(())
}

/// Writes newer remote documents to the cache and returns the ones that
/// changed. Keys whose existence flipped go into `existence_changed`.
fn populate_document_changes(
    txn: &mut Transaction<'_>,
    local_documents: &LocalDocumentsView,
    updates: &MutableDocumentMap,
    remote_version: SnapshotVersion,
    existence_changed: &mut DocumentKeySet,
) -> FirestoreResult<MutableDocumentMap> {
    let cache = local_documents.remote_documents();
    let existing = cache.get_entries(txn, updates.keys())?;
    let mut changed = MutableDocumentMap::new();

    for (key, document) in updates {
        let Some(current) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != current.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version() == SnapshotVersion::min() {
            // A limbo resolution without a version: the document is gone and
            // nothing is known about when.
            cache.remove_entry(txn, key)?;
            changed.insert(key.clone(), document.clone());
        } else if !current.is_valid_document()
            || document.version() > current.version()
            || (document.version() == current.version() && current.has_pending_writes())
        {
            let read_time = if document.read_time().is_min() {
                remote_version
            } else {
                document.read_time()
            };
            hard_assert(!read_time.is_min(), "cannot add a document when the remote version is zero");
            cache.add_entry(txn, document, read_time)?;
            let mut stored = document.clone();
            stored.set_read_time(read_time);
            changed.insert(key.clone(), stored);
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}: current version {:?}, watch version {:?}",
                current.version(),
                document.version()
            );
        }
    }
    Ok(changed)
}

/// Whether the new target data is worth a write. Resume tokens are
/// persisted only every so often unless documents changed.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    if new.resume_token == old.resume_token && new.snapshot_version == old.snapshot_version {
        return change.change_count() > 0;
    }
    let time_delta = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.change_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{failed_precondition, FirestoreErrorCode};
    use crate::model::{FieldPath, FieldTransform, MutationResult, ResourcePath, TransformOperation};
    use crate::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut value = MapValue::empty();
        for (name, number) in entries {
            value.set(&field(name), FirestoreValue::from_integer(*number));
        }
        value
    }

    fn store() -> LocalStore {
        let persistence = Arc::new(Persistence::memory("client"));
        let store = LocalStore::new(persistence, User::anonymous(), LocalStoreSettings::default());
        store.start().unwrap();
        store
    }

    fn acknowledge(store: &mut LocalStore, batch_id: BatchId, micros: i64) -> MutableDocumentMap {
        let batch = store.next_mutation_batch(batch_id - 1).unwrap().unwrap();
        let results = batch
            .mutations()
            .iter()
            .map(|_| MutationResult {
                version: SnapshotVersion::from_micros(micros),
                transform_results: Vec::new(),
            })
            .collect();
        let result =
            MutationBatchResult::from(batch, SnapshotVersion::from_micros(micros), results, b"token".to_vec()).unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    fn remote_event(version: i64, target_id: TargetId, documents: &[MutableDocument]) -> RemoteEvent {
        let mut change = TargetChange::create_synthesized(true, format!("resume-{version}").into_bytes());
        change.added_documents = documents.iter().map(|doc| doc.key().clone()).collect();
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(version),
            ..Default::default()
        };
        event.target_changes.insert(target_id, change);
        event.document_updates = documents.iter().map(|doc| (doc.key().clone(), doc.clone())).collect();
        event
    }

    #[test]
    fn local_write_is_visible_until_acknowledged() {
        let mut store = store();
        let doc = key("rooms/a");
        let write = store
            .write_locally(vec![Mutation::set(doc.clone(), map(&[("x", 1)]), Precondition::None)])
            .unwrap();
        assert!(write.changes[&doc].has_local_mutations());

        let read = store.read_document(&doc).unwrap();
        assert_eq!(read.data(), &map(&[("x", 1)]));
        assert!(read.has_pending_writes());

        let changes = acknowledge(&mut store, write.batch_id, 10);
        assert!(changes[&doc].has_committed_mutations());
        let read = store.read_document(&doc).unwrap();
        assert_eq!(read.data(), &map(&[("x", 1)]));
        assert!(!read.has_local_mutations());
        assert_eq!(store.last_stream_token().unwrap(), b"token".to_vec());
        assert_eq!(store.take_batch_state(write.batch_id).unwrap(), Some(BatchState::Acknowledged));
    }

    #[test]
    fn rejected_write_reverts_local_view() {
        let mut store = store();
        let doc = key("rooms/a");
        let write = store
            .write_locally(vec![Mutation::set(doc.clone(), map(&[("x", 1)]), Precondition::None)])
            .unwrap();
        let changes = store
            .reject_batch(write.batch_id, &failed_precondition("stale"))
            .unwrap();
        assert!(!changes[&doc].is_valid_document() || changes[&doc].is_no_document());
        assert!(!store.read_document(&doc).unwrap().is_found_document());
        match store.take_batch_state(write.batch_id).unwrap() {
            Some(BatchState::Rejected { code, .. }) => assert_eq!(code, FirestoreErrorCode::FailedPrecondition),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn increments_record_base_values() {
        let mut store = store();
        let doc = key("rooms/a");
        let target = store.allocate_target(Query::new(ResourcePath::from_string("rooms").unwrap()).to_target()).unwrap();
        let remote = MutableDocument::new_found_document(doc.clone(), SnapshotVersion::from_micros(5), map(&[("n", 2)]));
        store.apply_remote_event(&remote_event(5, target.target_id, &[remote])).unwrap();

        let increment = Mutation::patch(doc.clone(), MapValue::empty(), FieldMask::empty(), Precondition::Exists(true))
            .with_transforms(vec![FieldTransform::new(
                field("n"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(3)),
            )]);
        store.write_locally(vec![increment]).unwrap();

        let batch = store.next_mutation_batch(crate::constants::BATCH_ID_UNKNOWN).unwrap().unwrap();
        assert_eq!(batch.base_mutations().len(), 1);
        assert_eq!(store.read_document(&doc).unwrap().data(), &map(&[("n", 5)]));
    }

    #[test]
    fn outdated_remote_documents_are_ignored() {
        let mut store = store();
        let doc = key("rooms/a");
        let target = store.allocate_target(Query::new(ResourcePath::from_string("rooms").unwrap()).to_target()).unwrap();
        let newer = MutableDocument::new_found_document(doc.clone(), SnapshotVersion::from_micros(20), map(&[("v", 2)]));
        let older = MutableDocument::new_found_document(doc.clone(), SnapshotVersion::from_micros(10), map(&[("v", 1)]));

        let changes = store.apply_remote_event(&remote_event(20, target.target_id, &[newer])).unwrap();
        assert_eq!(changes.len(), 1);
        let changes = store.apply_remote_event(&remote_event(30, target.target_id, &[older])).unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.read_document(&doc).unwrap().data(), &map(&[("v", 2)]));
        assert_eq!(store.remote_document_keys(target.target_id).unwrap().len(), 1);
    }

    #[test]
    fn allocate_target_reuses_persisted_data() {
        let mut store = store();
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let first = store.allocate_target(target.clone()).unwrap();
        assert_eq!(first.purpose, TargetPurpose::Listen);
        let change = remote_event(7, first.target_id, &[]);
        store.apply_remote_event(&change).unwrap();
        store.release_target(first.target_id, false).unwrap();

        let second = store.allocate_target(target).unwrap();
        assert_eq!(second.target_id, first.target_id);
        assert_eq!(second.resume_token, b"resume-7".to_vec());

        let other = store
            .allocate_target(Query::new(ResourcePath::from_string("users").unwrap()).to_target())
            .unwrap();
        assert_ne!(other.target_id, first.target_id);
    }

    #[test]
    fn execute_query_merges_overlays() {
        let mut store = store();
        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]), Precondition::None)])
            .unwrap();
        let result = store.execute_query(&query, true).unwrap();
        assert_eq!(result.documents.len(), 1);
        assert!(result.remote_keys.is_empty());
    }

    fn cached_entry(store: &LocalStore, key: &DocumentKey) -> MutableDocument {
        let remote_documents = store.local_documents.remote_documents();
        store
            .persistence
            .run_transaction("Read remote entry", TransactionMode::ReadOnly, |txn| {
                remote_documents.get_entry(txn, key)
            })
            .unwrap()
    }

    #[test]
    fn pending_mutation_keeps_document_through_garbage_collection() {
        let settings = LocalStoreSettings {
            lru_params: LruParams::with_cache_size(0).with_percentile_to_collect(100),
            ..LocalStoreSettings::default()
        };
        let mut store = LocalStore::new(Arc::new(Persistence::memory("client")), User::anonymous(), settings);
        store.start().unwrap();

        let (written, untouched) = (key("rooms/a"), key("rooms/b"));
        let target = store.allocate_target(Query::new(ResourcePath::from_string("rooms").unwrap()).to_target()).unwrap();
        let documents: Vec<MutableDocument> = [&written, &untouched]
            .into_iter()
            .map(|key| MutableDocument::new_found_document(key.clone(), SnapshotVersion::from_micros(5), map(&[("x", 0)])))
            .collect();
        store.apply_remote_event(&remote_event(5, target.target_id, &documents)).unwrap();
        store.release_target(target.target_id, false).unwrap();

        let write = store
            .write_locally(vec![Mutation::set(written.clone(), map(&[("x", 1)]), Precondition::None)])
            .unwrap();

        let results = store.collect_garbage().unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);
        assert!(cached_entry(&store, &written).is_found_document());
        assert!(!cached_entry(&store, &untouched).is_valid_document());

        acknowledge(&mut store, write.batch_id, 10);
        let results = store.collect_garbage().unwrap();
        assert_eq!(results.documents_removed, 1);
        assert!(!cached_entry(&store, &written).is_valid_document());
    }

    #[test]
    fn resume_tokens_are_throttled() {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let old = TargetData::new(target, 2, TargetPurpose::Listen, 1)
            .with_resume_token(b"a".to_vec(), SnapshotVersion::from_micros(1_000_000));
        let soon = old.clone().with_resume_token(b"b".to_vec(), SnapshotVersion::from_micros(2_000_000));
        let later = old
            .clone()
            .with_resume_token(b"c".to_vec(), SnapshotVersion::from_micros(1_000_000 + RESUME_TOKEN_MAX_AGE_MICROS));
        let empty = TargetChange::default();
        assert!(!should_persist_target_data(&old, &soon, &empty));
        assert!(should_persist_target_data(&old, &later, &empty));

        let mut with_changes = TargetChange::default();
        with_changes.added_documents.insert(key("rooms/a"));
        assert!(should_persist_target_data(&old, &soon, &with_changes));
    }
}
