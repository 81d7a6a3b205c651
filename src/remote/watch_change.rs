use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::remote::serializer::{decode_bytes, JsonProtoSerializer};

/// One decoded message from the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means the change applies to every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<FirestoreError>,
}

/// A document entering, changing within, or leaving targets. `new_document`
/// is a found document for `documentChange`, a no-document tombstone for
/// `documentDelete`, and absent for `documentRemove`.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_document: Option<MutableDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterSpec {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterSpec>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }
    Ok(None)
}

/// The global snapshot version carried by a listen response. Only a
/// `NO_CHANGE` target change for all targets with a read time advances it.
pub fn snapshot_version_of(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    let state = target_change
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(WatchTargetChangeState::NoChange);
    if state != WatchTargetChangeState::NoChange || !numeric_array(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    match target_change.get("readTime") {
        Some(read_time) => serializer.decode_version(read_time),
        None => Ok(SnapshotVersion::min()),
    }
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(WatchTargetChangeState::NoChange);
    let read_time = value
        .get("readTime")
        .map(|read_time| serializer.decode_version(read_time))
        .transpose()?;
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| invalid_argument(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::new(
                FirestoreErrorCode::from_rpc_code(cause.code),
                cause.message.unwrap_or_else(|| "watch target rejected".to_string()),
            )
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token: decode_bytes(value.get("resumeToken"))?,
        read_time,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_document: Some(document),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let version = value
        .get("readTime")
        .map(|read_time| serializer.decode_version(read_time))
        .transpose()?
        .unwrap_or_else(SnapshotVersion::min);
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_document: Some(MutableDocument::new_no_document(key.clone(), version)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_document: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or_default() as i32;
    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => {
            let bits = names.get("bits");
            Some(BloomFilterSpec {
                bitmap: decode_bytes(bits.and_then(|bits| bits.get("bitmap")))?,
                padding: bits
                    .and_then(|bits| bits.get("padding"))
                    .and_then(JsonValue::as_i64)
                    .unwrap_or_default() as i32,
                hash_count: names.get("hashCount").and_then(JsonValue::as_i64).unwrap_or_default() as i32,
            })
        }
        None => None,
    };
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        existence_filter: ExistenceFilter { count, unchanged_names },
    }))
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue, kind: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.decode_document_key(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> WatchTargetChangeState {
    match value {
        "ADD" => WatchTargetChangeState::Added,
        "REMOVE" => WatchTargetChangeState::Removed,
        "CURRENT" => WatchTargetChangeState::Current,
        "RESET" => WatchTargetChangeState::Reset,
        _ => WatchTargetChangeState::NoChange,
    }
}
