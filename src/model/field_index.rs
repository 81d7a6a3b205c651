use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::constants::BATCH_ID_UNKNOWN;
use crate::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    /// Indexes each element of an array field, for `array-contains` filters.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position in the remote document cache and mutation queue up to which an
/// index is known to be complete.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: DocumentKey,
    pub largest_batch_id: i32,
}

impl IndexOffset {
    pub fn new(read_time: SnapshotVersion, document_key: DocumentKey, largest_batch_id: i32) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    /// Offset before every document.
    pub fn none() -> Self {
        Self::new(SnapshotVersion::min(), DocumentKey::empty(), BATCH_ID_UNKNOWN)
    }

    pub fn from_document(document: &MutableDocument) -> Self {
        Self::new(document.read_time(), document.key().clone(), BATCH_ID_UNKNOWN)
    }

    /// Offset that excludes every document read at or before `read_time`.
    pub fn successor_of_read_time(read_time: SnapshotVersion, largest_batch_id: i32) -> Self {
        let timestamp = read_time.timestamp();
        let successor = if read_time == SnapshotVersion::max() {
            read_time
        } else {
            SnapshotVersion::new(Timestamp::new(timestamp.seconds, timestamp.nanos + 1))
        };
        Self::new(successor, DocumentKey::empty(), largest_batch_id)
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexState {
    /// Order in which indexes were last backfilled.
    pub sequence_number: i64,
    pub offset: IndexOffset,
}

impl IndexState {
    pub fn new(sequence_number: i64, offset: IndexOffset) -> Self {
        Self {
            sequence_number,
            offset,
        }
    }

    pub fn empty() -> Self {
        Self::new(FieldIndex::INITIAL_SEQUENCE_NUMBER, IndexOffset::none())
    }
}

/// Client-side index over the documents of one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub index_state: IndexState,
}

impl FieldIndex {
    pub const UNKNOWN_ID: i32 = -1;
    pub const INITIAL_SEQUENCE_NUMBER: i64 = 0;

    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: Self::UNKNOWN_ID,
            collection_group: collection_group.into(),
            segments,
            index_state: IndexState::empty(),
        }
    }

    pub fn with_id(mut self, index_id: i32) -> Self {
        self.index_id = index_id;
        self
    }

    pub fn with_state(mut self, index_state: IndexState) -> Self {
        self.index_state = index_state;
        self
    }

    /// The `Contains` segment, if any. An index holds at most one.
    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments.iter().find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments.iter().filter(|segment| segment.kind != IndexKind::Contains)
    }

    /// Compares definitions, ignoring ids and backfill state.
    pub fn semantic_cmp(&self, other: &Self) -> Ordering {
        self.collection_group
            .cmp(&other.collection_group)
            .then_with(|| self.segments.cmp(&other.segments))
    }
}
