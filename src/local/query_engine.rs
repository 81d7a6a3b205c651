use std::collections::HashMap;

use crate::constants::BATCH_ID_UNKNOWN;
use crate::core::{LimitType, Query};
use crate::error::FirestoreResult;
use crate::local::index_manager::IndexType;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::persistence::Transaction;
use crate::model::{DocumentKeySet, IndexOffset, MutableDocument, MutableDocumentMap, SnapshotVersion};

/// Controls when full collection scans turn into index creation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    /// Collections smaller than this are always scanned.
    pub min_collection_size: usize,
    /// Cost of reading one document through an index, relative to a scan.
    pub relative_index_read_cost_per_document: f64,
    /// Scans of the same query needed before an index is created.
    pub min_scans_before_creation: usize,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: 100,
            relative_index_read_cost_per_document: 8.0,
            min_scans_before_creation: 2,
        }
    }
}

impl IndexAutoCreationSettings {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_min_collection_size(mut self, size: usize) -> Self {
        self.min_collection_size = size;
        self
    }

    pub fn with_relative_index_read_cost_per_document(mut self, cost: f64) -> Self {
        self.relative_index_read_cost_per_document = cost;
        self
    }

    pub fn with_min_scans_before_creation(mut self, scans: usize) -> Self {
        self.min_scans_before_creation = scans;
        self
    }
}

/// Counters collected while executing a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub documents_read_count: usize,
}

/// Runs queries against the local store, preferring indexes, then the
/// previous limbo-free result set, then a full collection scan.
pub struct QueryEngine {
    settings: IndexAutoCreationSettings,
    scan_counts: HashMap<String, usize>,
}

impl QueryEngine {
    pub fn new(settings: IndexAutoCreationSettings) -> Self {
        Self {
            settings,
            scan_counts: HashMap::new(),
        }
    }

    pub fn settings(&self) -> IndexAutoCreationSettings {
        self.settings
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.settings.enabled = enabled;
    }

    pub fn get_documents_matching_query(
        &mut self,
        txn: &mut Transaction<'_>,
        documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<MutableDocumentMap> {
        if let Some(results) = self.perform_query_using_index(txn, documents, query)? {
            return Ok(results);
        }
        if let Some(results) =
            self.perform_query_using_remote_keys(txn, documents, query, remote_keys, last_limbo_free_snapshot_version)?
        {
            return Ok(results);
        }

        let mut context = QueryContext::default();
        let results = documents.get_documents_matching_query(txn, query, &IndexOffset::none(), Some(&mut context))?;
        if self.settings.enabled {
            self.create_cache_indexes(txn, documents, query, &context, results.len())?;
        }
        Ok(results)
    }

    fn create_cache_indexes(
        &mut self,
        txn: &mut Transaction<'_>,
        documents: &LocalDocumentsView,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        if context.documents_read_count < self.settings.min_collection_size {
            log::debug!(
                "skipping index creation for {}: only {} documents read",
                query.canonical_id(),
                context.documents_read_count
            );
            return Ok(());
        }
        let read_cost = self.settings.relative_index_read_cost_per_document * result_size as f64;
        if (context.documents_read_count as f64) <= read_cost {
            return Ok(());
        }
        let scans = self.scan_counts.entry(query.canonical_id()).or_insert(0);
        *scans += 1;
        if *scans < self.settings.min_scans_before_creation {
            return Ok(());
        }
        log::debug!(
            "creating index for {}: {} documents read, {} results",
            query.canonical_id(),
            context.documents_read_count,
            result_size
        );
        documents.index_manager().create_target_indexes(txn, &query.to_target())
    }

    fn perform_query_using_index(
        &self,
        txn: &mut Transaction<'_>,
        documents: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<Option<MutableDocumentMap>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        let target = query.to_target();
        let index_manager = documents.index_manager();
        match index_manager.get_index_type(txn, &target)? {
            IndexType::None => return Ok(None),
            IndexType::Partial if query.has_limit() => {
                // A partial index cannot order by the limit; run unlimited.
                return self.perform_query_using_index(txn, documents, &query.clone().without_limit());
            }
            _ => {}
        }

        let Some(keys) = index_manager.get_documents_matching_target(txn, &target)? else {
            return Ok(None);
        };
        let indexed = documents.get_documents(txn, keys.iter())?;
        let offset = index_manager.get_min_offset(txn, &target)?;
        let previous = apply_query(query, indexed);
        let key_count = keys.len();
        if needs_refill(query, &previous, key_count, offset.read_time) {
            return self.perform_query_using_index(txn, documents, &query.clone().without_limit());
        }
        self.append_remaining_results(txn, documents, previous, query, &offset)
            .map(Some)
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut Transaction<'_>,
        documents: &LocalDocumentsView,
        query: &Query,
        remote_keys: &DocumentKeySet,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<MutableDocumentMap>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }
        let known = documents.get_documents(txn, remote_keys.iter())?;
        let previous = apply_query(query, known);
        if needs_refill(query, &previous, remote_keys.len(), last_limbo_free_snapshot_version) {
            return Ok(None);
        }
        log::debug!(
            "re-using previous result from {last_limbo_free_snapshot_version} to execute {}",
            query.canonical_id()
        );
        let offset = IndexOffset::successor_of_read_time(last_limbo_free_snapshot_version, BATCH_ID_UNKNOWN);
        self.append_remaining_results(txn, documents, previous, query, &offset)
            .map(Some)
    }

    fn append_remaining_results(
        &self,
        txn: &Transaction<'_>,
        documents: &LocalDocumentsView,
        indexed: Vec<MutableDocument>,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut results: MutableDocumentMap = indexed
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();
        results.extend(documents.get_documents_matching_query(txn, query, offset, None)?);
        Ok(results)
    }
}

/// Matching documents in query order, with the limit applied.
fn apply_query(query: &Query, documents: MutableDocumentMap) -> Vec<MutableDocument> {
    let mut matching: Vec<MutableDocument> = documents
        .into_values()
        .filter(|document| query.matches(document))
        .collect();
    matching.sort_by(|left, right| query.compare_documents(left, right));
    if let Some(limit) = query.limit() {
        let limit = limit.max(0) as usize;
        if matching.len() > limit {
            match query.limit_type() {
                LimitType::First => matching.truncate(limit),
                LimitType::Last => {
                    matching.drain(..matching.len() - limit);
                }
            }
        }
    }
    matching
}

/// Whether a limited result set computed from a previous snapshot may have
/// lost documents at its edge and must be recomputed.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    previous_key_count: usize,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if previous_key_count != sorted_previous_results.len() {
        // A document left the result set; the next one is unknown.
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}
