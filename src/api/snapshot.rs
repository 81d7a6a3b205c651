use std::collections::BTreeMap;

use crate::core::{ChangeType, DocumentSet, Query, ViewSnapshot};
use crate::model::{DocumentKey, FieldPath, MutableDocument};
use crate::value::{FirestoreValue, MapValue};

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// Whether the snapshot was built from the local cache without an
    /// up-to-date answer from the backend.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Whether the snapshot includes local writes the backend has not
    /// acknowledged yet.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    data: Option<MapValue>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn new(key: DocumentKey, data: Option<MapValue>, metadata: SnapshotMetadata) -> Self {
        Self { key, data, metadata }
    }

    /// Snapshot of a cached document. Documents known not to exist produce a
    /// snapshot without data.
    pub(crate) fn from_document(document: &MutableDocument, from_cache: bool, has_pending_writes: bool) -> Self {
        let data = document.is_found_document().then(|| document.data().clone());
        Self::new(
            document.key().clone(),
            data,
            SnapshotMetadata::new(from_cache, has_pending_writes),
        )
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&BTreeMap<String, FirestoreValue>> {
        self.data.as_ref().map(|map| map.fields())
    }

    /// Value at `path`, `None` when the document or the field is missing.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.as_ref().and_then(|map| map.get(path))
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// One document change between two consecutive query snapshots.
///
/// `old_index` is the position in the previous snapshot (absent for
/// additions) and `new_index` the position in this one (absent for
/// removals). Applying the changes in order to the previous snapshot's
/// documents yields the current documents.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub change_type: DocumentChangeType,
    pub document: DocumentSnapshot,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// Result of a query listener event or a cache read.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    documents: Vec<DocumentSnapshot>,
    changes: Vec<DocumentChange>,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub fn from_view_snapshot(snapshot: ViewSnapshot) -> Self {
        let from_cache = snapshot.from_cache;
        let to_snapshot = |document: &MutableDocument| {
            DocumentSnapshot::from_document(document, from_cache, snapshot.mutated_keys.contains(document.key()))
        };
        let documents = snapshot.documents.iter().map(to_snapshot).collect();
        let changes = if snapshot.old_documents.is_empty() {
            initial_changes(&snapshot, &to_snapshot)
        } else {
            incremental_changes(&snapshot, &to_snapshot)
        };
        Self {
            metadata: SnapshotMetadata::new(from_cache, snapshot.has_pending_writes()),
            query: snapshot.query,
            documents,
            changes,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    pub fn doc_changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn into_documents(self) -> Vec<DocumentSnapshot> {
        self.documents
    }
}

impl IntoIterator for QuerySnapshot {
    type Item = DocumentSnapshot;
    type IntoIter = std::vec::IntoIter<DocumentSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.into_iter()
    }
}

fn initial_changes(
    snapshot: &ViewSnapshot,
    to_snapshot: &impl Fn(&MutableDocument) -> DocumentSnapshot,
) -> Vec<DocumentChange> {
    let mut added: Vec<&MutableDocument> = snapshot
        .document_changes
        .iter()
        .map(|change| &change.document)
        .collect();
    added.sort_by(|left, right| (snapshot.documents.comparator())(left, right));
    added
        .into_iter()
        .enumerate()
        .map(|(index, document)| DocumentChange {
            change_type: DocumentChangeType::Added,
            document: to_snapshot(document),
            old_index: None,
            new_index: Some(index),
        })
        .collect()
}

fn incremental_changes(
    snapshot: &ViewSnapshot,
    to_snapshot: &impl Fn(&MutableDocument) -> DocumentSnapshot,
) -> Vec<DocumentChange> {
    let mut tracker: DocumentSet = snapshot.old_documents.clone();
    snapshot
        .document_changes
        .iter()
        .map(|change| {
            let key = change.document.key();
            let mut old_index = None;
            let mut new_index = None;
            if change.change_type != ChangeType::Added {
                old_index = tracker.index_of(key);
                tracker.remove(key);
            }
            if change.change_type != ChangeType::Removed {
                tracker.insert(change.document.clone());
                new_index = tracker.index_of(key);
            }
            DocumentChange {
                change_type: match change.change_type {
                    ChangeType::Added => DocumentChangeType::Added,
                    ChangeType::Removed => DocumentChangeType::Removed,
                    ChangeType::Modified | ChangeType::Metadata => DocumentChangeType::Modified,
                },
                document: to_snapshot(&change.document),
                old_index,
                new_index,
            }
        })
        .collect()
}
