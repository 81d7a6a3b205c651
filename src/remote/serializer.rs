use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::core::{Bound, Filter, FilterOperator, Target, TargetData};
use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{
    DatabaseId, DocumentKey, FieldPath, FieldTransform, GeoPoint, Mutation, MutationKind, MutationResult,
    MutableDocument, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between the local model and the backend's JSON wire format.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.resource_name()
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    pub fn decode_document_key(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let (database, key) = parse_document_name(name)?;
        if database != self.database_id {
            return Err(invalid_argument(format!(
                "Document {name} belongs to a different database than {}",
                self.database_name()
            )));
        }
        Ok(key)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) => encode_double(*double),
            ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
            // Pending server timestamps are sent as field transforms, never as values.
            ValueKind::ServerTimestamp { .. } => json!({ "nullValue": JsonValue::Null }),
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference { database, key } => json!({
                "referenceValue": format!("{}/documents/{}", database.resource_name(), key.path().canonical_string())
            }),
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values = array.values().iter().map(|value| self.encode_value(value)).collect::<Vec<_>>();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({ "mapValue": { "fields": self.encode_fields(map) } }),
        }
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        let fields = map
            .fields()
            .iter()
            .map(|(key, value)| (key.clone(), self.encode_value(value)))
            .collect::<serde_json::Map<_, _>>();
        JsonValue::Object(fields)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
        if object.contains_key("nullValue") {
            return Ok(FirestoreValue::null());
        }
        if let Some(bool_value) = object.get("booleanValue") {
            let value = bool_value
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
            return Ok(FirestoreValue::from_bool(value));
        }
        if let Some(integer_value) = object.get("integerValue") {
            let parsed = match integer_value {
                JsonValue::String(value) => i64::from_str(value)
                    .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Integer out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FirestoreValue::from_integer(parsed));
        }
        if let Some(double_value) = object.get("doubleValue") {
            let parsed = match double_value {
                JsonValue::Number(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
                JsonValue::String(value) => match value.as_str() {
                    "NaN" => f64::NAN,
                    "Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    other => other
                        .parse::<f64>()
                        .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
                },
                _ => return Err(invalid_argument("doubleValue must be a number or string")),
            };
            return Ok(FirestoreValue::from_double(parsed));
        }
        if let Some(timestamp_value) = object.get("timestampValue") {
            return Ok(FirestoreValue::from_timestamp(decode_timestamp(timestamp_value)?));
        }
        if let Some(string_value) = object.get("stringValue") {
            let str_value = string_value
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be string"))?;
            return Ok(FirestoreValue::from_string(str_value));
        }
        if let Some(bytes_value) = object.get("bytesValue") {
            let str_value = bytes_value
                .as_str()
                .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
            let decoded = BytesValue::from_base64(str_value)
                .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
            return Ok(FirestoreValue::from_bytes(decoded));
        }
        if let Some(reference_value) = object.get("referenceValue") {
            let name = reference_value
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
            let (database, key) = parse_document_name(name)?;
            return Ok(FirestoreValue::from_reference(database, key));
        }
        if let Some(geo_point) = object.get("geoPointValue") {
            let latitude = geo_point.get("latitude").and_then(JsonValue::as_f64).unwrap_or(0.0);
            let longitude = geo_point.get("longitude").and_then(JsonValue::as_f64).unwrap_or(0.0);
            return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
        }
        if let Some(array_value) = object.get("arrayValue") {
            let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_value(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(FirestoreValue::from_array(decoded));
        }
        if let Some(map_value) = object.get("mapValue") {
            return Ok(FirestoreValue::from_map_value(self.decode_fields(map_value.get("fields"))?));
        }

        Err(invalid_argument("Unknown Firestore value type"))
    }

    pub fn decode_fields(&self, fields: Option<&JsonValue>) -> FirestoreResult<MapValue> {
        let Some(fields) = fields else {
            return Ok(MapValue::empty());
        };
        let object = fields
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
        let mut decoded = BTreeMap::new();
        for (key, value) in object {
            decoded.insert(key.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(decoded))
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        json!(version.timestamp().to_rfc3339())
    }

    pub fn decode_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        Ok(SnapshotVersion::new(decode_timestamp(value)?))
    }

    /// A backend `Document` as a found document, stamped with its update time.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing a name"))?;
        let key = self.decode_document_key(name)?;
        let version = match document.get("updateTime") {
            Some(update_time) => self.decode_version(update_time)?,
            None => return Err(invalid_argument(format!("Document {name} is missing updateTime"))),
        };
        let data = self.decode_fields(document.get("fields"))?;
        let mut decoded = MutableDocument::new_found_document(key, version, data);
        if let Some(create_time) = document.get("createTime") {
            decoded.set_create_time(self.decode_version(create_time)?);
        }
        Ok(decoded)
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        let name = self.document_name(mutation.key());
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": self.encode_fields(value) }),
                );
            }
            MutationKind::Patch { data, field_mask } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": self.encode_fields(data) }),
                );
                let mask: Vec<String> = field_mask.fields().iter().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": mask }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), json!(name));
            }
        }
        if !mutation.field_transforms().is_empty() {
            let transforms = mutation
                .field_transforms()
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => Some(json!({ "updateTime": self.encode_version(*version) })),
        }
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(|value| self.encode_value(value)).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(|value| self.encode_value(value)).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand)
            }),
        }
    }

    /// One entry of a `WriteResponse.writeResults`. Results without an update
    /// time were no-ops and take the commit version.
    pub fn decode_write_result(
        &self,
        result: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let version = match result.get("updateTime") {
            Some(update_time) => self.decode_version(update_time)?,
            None => commit_version,
        };
        let transform_results = match result.get("transformResults").and_then(JsonValue::as_array) {
            Some(values) => values
                .iter()
                .map(|value| self.decode_value(value))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    /// The `Target` proto sent in `addTarget`, with resume position and
    /// expected count when the target resumes.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(target.path())] }),
            );
        } else {
            encoded.insert("query".to_string(), self.encode_query_target(target));
        }
        encoded.insert("targetId".to_string(), json!(target_data.target_id));

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        } else if target_data.snapshot_version > SnapshotVersion::min() {
            encoded.insert("readTime".to_string(), self.encode_version(target_data.snapshot_version));
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        }
        JsonValue::Object(encoded)
    }

    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let mut structured = serde_json::Map::new();
        let path = target.path();
        let parent = match target.collection_group() {
            Some(group) => {
                structured.insert(
                    "from".to_string(),
                    json!([{ "collectionId": group, "allDescendants": true }]),
                );
                self.resource_name(path)
            }
            None => {
                let collection_id = path.last_segment().unwrap_or_default();
                structured.insert("from".to_string(), json!([{ "collectionId": collection_id }]));
                self.resource_name(&path.without_last())
            }
        };

        if let Some(filter) = encode_filters(self, target.filters()) {
            structured.insert("where".to_string(), filter);
        }

        if !target.order_by().is_empty() {
            let orders: Vec<_> = target
                .order_by()
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field().canonical_string() },
                        "direction": order.direction().wire_name(),
                    })
                })
                .collect();
            structured.insert("orderBy".to_string(), JsonValue::Array(orders));
        }

        if let Some(limit) = target.limit() {
            structured.insert("limit".to_string(), json!(limit));
        }
        if let Some(start) = target.start_at() {
            structured.insert("startAt".to_string(), encode_cursor(self, start, true));
        }
        if let Some(end) = target.end_at() {
            structured.insert("endAt".to_string(), encode_cursor(self, end, false));
        }

        json!({
            "parent": parent,
            "structuredQuery": JsonValue::Object(structured),
        })
    }
}

fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        json!({ "doubleValue": "NaN" })
    } else if value.is_infinite() {
        json!({ "doubleValue": if value > 0.0 { "Infinity" } else { "-Infinity" } })
    } else {
        json!({ "doubleValue": value })
    }
}

fn encode_filters(serializer: &JsonProtoSerializer, filters: &[Filter]) -> Option<JsonValue> {
    match filters {
        [] => None,
        [single] => Some(encode_filter(serializer, single)),
        many => Some(json!({
            "compositeFilter": {
                "op": "AND",
                "filters": many.iter().map(|filter| encode_filter(serializer, filter)).collect::<Vec<_>>()
            }
        })),
    }
}

fn encode_filter(serializer: &JsonProtoSerializer, filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(field_filter) => {
            let field = json!({ "fieldPath": field_filter.field().canonical_string() });
            let value = field_filter.value();
            let unary = match field_filter.op() {
                FilterOperator::Equal if value.is_null() => Some("IS_NULL"),
                FilterOperator::Equal if value.is_nan() => Some("IS_NAN"),
                FilterOperator::NotEqual if value.is_null() => Some("IS_NOT_NULL"),
                FilterOperator::NotEqual if value.is_nan() => Some("IS_NOT_NAN"),
                _ => None,
            };
            match unary {
                Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
                None => json!({
                    "fieldFilter": {
                        "field": field,
                        "op": field_filter.op().wire_name(),
                        "value": serializer.encode_value(value)
                    }
                }),
            }
        }
        Filter::Composite(composite) => json!({
            "compositeFilter": {
                "op": composite.op().wire_name(),
                "filters": composite
                    .filters()
                    .iter()
                    .map(|filter| encode_filter(serializer, filter))
                    .collect::<Vec<_>>()
            }
        }),
    }
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, start: bool) -> JsonValue {
    json!({
        "values": bound
            .position()
            .iter()
            .map(|value| serializer.encode_value(value))
            .collect::<Vec<_>>(),
        "before": if start { bound.inclusive() } else { !bound.inclusive() },
    })
}

pub(crate) fn decode_timestamp(value: &JsonValue) -> FirestoreResult<Timestamp> {
    match value {
        JsonValue::String(text) => Timestamp::parse_rfc3339(text),
        JsonValue::Object(object) => {
            let seconds = match object.get("seconds") {
                Some(JsonValue::String(text)) => i64::from_str(text)
                    .map_err(|err| invalid_argument(format!("Invalid timestamp seconds: {err}")))?,
                Some(JsonValue::Number(number)) => number.as_i64().unwrap_or_default(),
                _ => 0,
            };
            let nanos = object.get("nanos").and_then(JsonValue::as_i64).unwrap_or_default() as i32;
            Ok(Timestamp::new(seconds, nanos))
        }
        _ => Err(invalid_argument("Timestamp must be a string or object")),
    }
}

pub(crate) fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
        None => Ok(Vec::new()),
    }
}

/// Splits `projects/{p}/databases/{d}/documents/{path}`.
fn parse_document_name(name: &str) -> FirestoreResult<(DatabaseId, DocumentKey)> {
    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() < 6 || segments[0] != "projects" || segments[2] != "databases" || segments[4] != "documents" {
        return Err(invalid_argument(format!("Invalid document name: {name}")));
    }
    let database = DatabaseId::new(segments[1], segments[3]);
    let key = DocumentKey::from_path(ResourcePath::from_segments(segments[5..].iter().copied()))?;
    Ok((database, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Query, TargetPurpose};
    use crate::model::FieldMask;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn decodes_documents_with_versions() {
        let serializer = serializer();
        let document = json!({
            "name": "projects/project/databases/(default)/documents/rooms/eros",
            "fields": {
                "name": { "stringValue": "Eros" },
                "size": { "integerValue": "42" },
                "ratio": { "doubleValue": "NaN" },
                "owner": { "referenceValue": "projects/project/databases/(default)/documents/users/ada" }
            },
            "createTime": "2024-01-01T00:00:00Z",
            "updateTime": "2024-01-02T00:00:00.000001Z"
        });

        let decoded = serializer.decode_document(&document).unwrap();
        assert_eq!(decoded.key(), &key("rooms/eros"));
        assert_eq!(decoded.version().to_micros(), 1_704_153_600_000_001);
        let name = FieldPath::from_dot_separated("name").unwrap();
        assert_eq!(decoded.field(&name), Some(&FirestoreValue::from_string("Eros")));
        assert!(decoded.field(&FieldPath::from_dot_separated("ratio").unwrap()).unwrap().is_nan());
        let owner = decoded.field(&FieldPath::from_dot_separated("owner").unwrap()).unwrap();
        assert!(matches!(owner.kind(), ValueKind::Reference { key: k, .. } if k == &key("users/ada")));
    }

    #[test]
    fn rejects_documents_from_other_databases() {
        let err = serializer()
            .decode_document_key("projects/other/databases/(default)/documents/rooms/eros")
            .unwrap_err();
        assert_eq!(err.code, crate::error::FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn encodes_patch_with_mask_transforms_and_precondition() {
        let field = FieldPath::from_dot_separated("count").unwrap();
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("title").unwrap(), FirestoreValue::from_string("x"));
        let mutation = Mutation::patch(
            key("rooms/eros"),
            data,
            FieldMask::new([FieldPath::from_dot_separated("title").unwrap()]),
            Precondition::Exists(true),
        )
        .with_transforms(vec![FieldTransform::new(
            field,
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
        )]);

        let encoded = serializer().encode_mutation(&mutation);
        assert_eq!(
            encoded["update"]["name"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["title"]));
        assert_eq!(encoded["updateTransforms"][0]["increment"], json!({ "integerValue": "1" }));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
    }

    #[test]
    fn encodes_delete_without_precondition() {
        let encoded = serializer().encode_mutation(&Mutation::delete(key("rooms/eros"), Precondition::None));
        assert_eq!(
            encoded,
            json!({ "delete": "projects/project/databases/(default)/documents/rooms/eros" })
        );
    }

    #[test]
    fn encodes_query_targets_with_resume_token_and_expected_count() {
        let query = Query::new(ResourcePath::from_string("rooms/eros/messages").unwrap())
            .with_filter(
                Filter::field(
                    FieldPath::from_dot_separated("author").unwrap(),
                    FilterOperator::Equal,
                    FirestoreValue::null(),
                )
                .unwrap(),
            )
            .with_limit_to_first(10);
        let target_data = TargetData::new(query.to_target(), 4, TargetPurpose::Listen, 1)
            .with_resume_token(vec![1, 2, 3], SnapshotVersion::from_micros(5))
            .with_expected_count(Some(7));

        let encoded = serializer().encode_target(&target_data);
        assert_eq!(encoded["targetId"], json!(4));
        assert_eq!(encoded["resumeToken"], json!("AQID"));
        assert_eq!(encoded["expectedCount"], json!(7));
        assert!(encoded.get("readTime").is_none());
        let query = &encoded["query"];
        assert_eq!(
            query["parent"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        let structured = &query["structuredQuery"];
        assert_eq!(structured["from"], json!([{ "collectionId": "messages" }]));
        assert_eq!(structured["where"]["unaryFilter"]["op"], json!("IS_NULL"));
        assert_eq!(structured["limit"], json!(10));
    }

    #[test]
    fn encodes_document_targets_by_read_time() {
        let target_data = TargetData::new(
            crate::core::Target::for_document(&key("rooms/eros")),
            2,
            TargetPurpose::LimboResolution,
            1,
        )
        .with_resume_token(Vec::new(), SnapshotVersion::from_micros(1_000_000));

        let encoded = serializer().encode_target(&target_data);
        assert_eq!(
            encoded["documents"]["documents"],
            json!(["projects/project/databases/(default)/documents/rooms/eros"])
        );
        assert_eq!(encoded["readTime"], json!("1970-01-01T00:00:01.000000000Z"));
    }

    #[test]
    fn write_results_without_update_time_use_commit_version() {
        let commit = SnapshotVersion::from_micros(9);
        let result = serializer()
            .decode_write_result(&json!({ "transformResults": [{ "integerValue": "3" }] }), commit)
            .unwrap();
        assert_eq!(result.version, commit);
        assert_eq!(result.transform_results, vec![FirestoreValue::from_integer(3)]);
    }
}
