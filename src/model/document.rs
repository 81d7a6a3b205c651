use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// No information is known, not even whether the document exists.
    Invalid,
    FoundDocument,
    NoDocument,
    /// Known to exist at `version` but its contents are not known, for
    /// example after a patch acknowledged against a missing base document.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as stored in the caches, and the mutable working copy that
/// mutations are applied to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

impl MutableDocument {
    fn with_type(key: DocumentKey, document_type: DocumentType, version: SnapshotVersion, data: MapValue) -> Self {
        Self {
            key,
            document_type,
            version,
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data,
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self::with_type(key, DocumentType::Invalid, SnapshotVersion::min(), MapValue::empty())
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self::with_type(key, DocumentType::FoundDocument, version, data)
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_type(key, DocumentType::NoDocument, version, MapValue::empty())
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_type(key, DocumentType::UnknownDocument, version, MapValue::empty())
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        if self.create_time.is_min()
            && matches!(self.document_type, DocumentType::NoDocument | DocumentType::Invalid)
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: SnapshotVersion) -> &mut Self {
        self.create_time = create_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }
}
