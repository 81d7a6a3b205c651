use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{internal_error, FirestoreResult};
use crate::model::mutation::calculate_overlay_mutation;
use crate::model::{
    DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

/// Local view of one document together with the fields its pending
/// mutations touched (`None`: the whole document).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

/// A group of mutations written atomically by one local write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    batch_id: i32,
    local_write_time: Timestamp,
    /// Mutations recording the base values of non-idempotent transforms.
    /// They apply to the local view only and are never sent.
    base_mutations: Vec<Mutation>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn batch_id(&self) -> i32 {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn base_mutations(&self) -> &[Mutation] {
        &self.base_mutations
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Applies the acknowledged mutations of this batch for `document`'s key.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(result.mutation_results.iter()) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Applies every mutation of this batch for `document`'s key to its
    /// local view, base mutations first.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to a set of local views and returns the overlay
    /// mutation of every touched document.
    ///
    /// Keys in `documents_without_remote_version` get full-document overlays
    /// because no committed base exists to patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mut mutated_fields =
                self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            if documents_without_remote_version.contains(&key) {
                mutated_fields = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref()) {
                overlays.insert(key, overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// A batch together with the backend's acknowledgement of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each document was committed at.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, Precondition};
    use crate::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str, field: &str, value: i64) -> Mutation {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(value));
        Mutation::set(key(path), data, Precondition::None)
    }

    #[test]
    fn result_count_must_match() {
        let batch = MutationBatch::new(1, Timestamp::now(), vec![], vec![set("a/1", "x", 1)]);
        assert!(MutationBatchResult::from(batch.clone(), SnapshotVersion::min(), vec![], vec![]).is_err());
        let result = MutationBatchResult::from(
            batch,
            SnapshotVersion::from_micros(5),
            vec![MutationResult {
                version: SnapshotVersion::from_micros(4),
                transform_results: vec![],
            }],
            vec![1],
        )
        .unwrap();
        assert_eq!(result.doc_versions.get(&key("a/1")), Some(&SnapshotVersion::from_micros(4)));
    }

    #[test]
    fn local_document_set_produces_overlays_for_touched_keys() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            vec![],
            vec![set("a/1", "x", 1), set("a/2", "y", 2)],
        );
        let mut documents = BTreeMap::new();
        for path in ["a/1", "a/2", "a/3"] {
            documents.insert(
                key(path),
                OverlayedDocument {
                    document: MutableDocument::new_invalid_document(key(path)),
                    mutated_fields: None,
                },
            );
        }
        let overlays = batch.apply_to_local_document_set(&mut documents, &BTreeSet::new());
        assert_eq!(overlays.len(), 2);
        assert!(documents[&key("a/1")].document.is_found_document());
        assert!(!documents[&key("a/3")].document.has_local_mutations());
    }
}
