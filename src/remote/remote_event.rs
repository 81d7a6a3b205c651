use std::collections::BTreeMap;

use crate::core::TargetPurpose;
use crate::model::{DocumentKeySet, MutableDocumentMap, SnapshotVersion, TargetId};

/// Aggregated result of a consistent batch of watch changes, applied to the
/// local store atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached membership must be discarded, with the purpose
    /// to re-listen under.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: MutableDocumentMap,
    /// Documents whose only remaining target is a limbo resolution.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }

    /// Event for a target whose watch stream went away before it became
    /// current, used to unblock listeners when the client goes offline.
    pub fn synthesized_for_target(target_id: TargetId, current: bool, resume_token: Vec<u8>) -> Self {
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::min(),
            ..Default::default()
        };
        event
            .target_changes
            .insert(target_id, TargetChange::create_synthesized(current, resume_token));
        event
    }
}

/// Change in membership and state of one target within a remote event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn create_synthesized(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Default::default()
        }
    }

    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
