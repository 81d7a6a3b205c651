use std::cmp::Ordering;

use crate::core::document_set::DocumentSet;
use crate::core::query::{LimitType, Query};
use crate::core::view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
use crate::local::QueryResult;
use crate::model::{DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap};
use crate::remote::{OnlineState, TargetChange};
use crate::util::hard_assert;

/// A document entered or left limbo: it is shown locally but the backend no
/// longer confirms it for the view's target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Document changes computed against a view but not yet applied to it.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limited view lost documents it cannot replace from the changes
    /// alone; the caller must re-run the query locally.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Materialized result of one query, maintained incrementally from local
/// changes and remote target changes.
pub struct View {
    query: Query,
    sync_state: SyncState,
    /// The backend marked the target current at the last target change.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend reported for the target.
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        Self {
            document_set: DocumentSet::for_query(&query),
            query,
            sync_state: SyncState::None,
            current: false,
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Computes how `changes` alter the view without applying them. Pass the
    /// result of a previous call to continue it after a refill.
    pub fn compute_doc_changes(
        &self,
        changes: &MutableDocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;
        let comparator = old_document_set.comparator().clone();

        let full_limit = self
            .query
            .limit()
            .is_some_and(|limit| old_document_set.len() as i64 == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if full_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if full_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !Self::should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()));
                            change_applied = true;

                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| comparator(new_doc, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator(new_doc, first) == Ordering::Less);
                            if past_last || before_first {
                                // The document moved past the edge of the limit; a document
                                // outside the view may now belong in it.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() as i64 > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last(),
                    LimitType::Last => document_set.first(),
                }
                .cloned();
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// A locally modified document whose write was just acknowledged is
    /// held back until the backend sends the committed version, so the view
    /// does not flicker back to the pre-write state.
    fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
        old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
    }

    /// Applies computed changes and an optional target change. Returns the
    /// snapshot to raise, if anything a listener can observe changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        hard_assert(!doc_changes.needs_refill, "cannot apply changes that need a refill");
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        let comparator = self.document_set.comparator().clone();
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| comparator(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            document_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline drops the current flag so the view is marked as coming
    /// from cache.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Replaces the view's synced state with what another client persisted
    /// and recomputes the documents.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents = DocumentKeySet::new();
        let doc_changes = self.compute_doc_changes(&query_result.documents, None);
        self.apply_changes(doc_changes, true, None, false)
    }

    /// The current state of the view as an initial snapshot.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == SyncState::Local,
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(target_change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(target_change.added_documents.iter().cloned());
        for key in &target_change.modified_documents {
            hard_assert(
                self.synced_documents.contains(key),
                format!("modified document {key} not found in view"),
            );
        }
        for key in &target_change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = target_change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes are expected to be missing from the backend.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: DocumentKeySet = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&new_limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            new_limbo
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = new_limbo;
        changes
    }
}
