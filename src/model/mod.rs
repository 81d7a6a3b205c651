use std::collections::{BTreeMap, BTreeSet};

mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_path;
mod geo_point;
pub mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::DatabaseId;
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_index::{FieldIndex, IndexKind, IndexOffset, IndexSegment, IndexState};
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, OverlayedDocument};
pub use overlay::Overlay;
pub use resource_path::{compare_segments, ResourcePath};
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;

pub type DocumentKeySet = BTreeSet<DocumentKey>;
pub type MutableDocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type TargetId = i32;
pub type BatchId = i32;
pub type ListenSequenceNumber = i64;
