use std::collections::BTreeMap;

use crate::core::document_set::DocumentSet;
use crate::core::query::Query;
use crate::model::{DocumentKey, DocumentKeySet, MutableDocument};
use crate::util::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Order in which changes are raised: removals, then additions, then
    /// everything else.
    pub(crate) fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: MutableDocument) -> Self {
        Self { change_type, document }
    }
}

/// Collapses successive changes to one document into the single change a
/// listener should see.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(DocumentViewChange::new(new_type, change.document)),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange::new(old_type, change.document)),
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => fail(&format!(
                "unsupported combination of changes {new_type:?} after {old_type:?} for {key}"
            )),
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Whether a view reflects the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No snapshot raised yet.
    None,
    /// Built at least partly from the local cache.
    Local,
    /// The backend marked the target current and no document is in limbo.
    Synced,
}

/// State of one query's view after a batch of changes.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    /// Documents with local writes not yet acknowledged by the backend.
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    /// Set once metadata-only changes were filtered out for a listener.
    pub excludes_metadata_changes: bool,
    /// The target was synced with the backend at some point in the past.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot presenting every document as added, used for the first event
    /// a listener receives.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        Self {
            old_documents: DocumentSet::new(documents.comparator().clone()),
            query,
            documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SnapshotVersion;
    use crate::value::MapValue;

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::empty(),
        )
    }

    fn collapse(types: &[ChangeType]) -> Vec<ChangeType> {
        let mut set = DocumentChangeSet::new();
        for change_type in types {
            set.track(DocumentViewChange::new(*change_type, doc("rooms/a")));
        }
        set.into_changes().into_iter().map(|c| c.change_type).collect()
    }

    #[test]
    fn collapses_change_sequences() {
        use ChangeType::*;
        assert_eq!(collapse(&[Added, Modified]), vec![Added]);
        assert_eq!(collapse(&[Added, Removed]), vec![]);
        assert_eq!(collapse(&[Modified, Removed]), vec![Removed]);
        assert_eq!(collapse(&[Removed, Added]), vec![Modified]);
        assert_eq!(collapse(&[Metadata, Modified]), vec![Modified]);
        assert_eq!(collapse(&[Added, Metadata]), vec![Added]);
        assert_eq!(collapse(&[Metadata, Metadata]), vec![Metadata]);
    }

    #[test]
    #[should_panic]
    fn rejects_double_add() {
        collapse(&[ChangeType::Added, ChangeType::Added]);
    }
}
