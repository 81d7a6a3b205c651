use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{DatabaseId, DocumentKey, GeoPoint, Timestamp};
use crate::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(#[serde(with = "f64_bits")] f64),
    Timestamp(Timestamp),
    /// Local stand-in for a server timestamp transform that the backend has
    /// not resolved yet.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous_value: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    /// Fully qualified document name: database plus document path.
    Reference {
        database: DatabaseId,
        key: DocumentKey,
    },
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self { kind: ValueKind::Null }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous_value: Option<FirestoreValue>) -> Self {
        // Nested pending timestamps keep the oldest committed value.
        let previous_value = match previous_value.map(|value| value.kind) {
            Some(ValueKind::ServerTimestamp { previous_value, .. }) => previous_value,
            Some(kind) => Some(Box::new(FirestoreValue { kind })),
            None => None,
        };
        Self {
            kind: ValueKind::ServerTimestamp {
                local_write_time,
                previous_value,
            },
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(database: DatabaseId, key: DocumentKey) -> Self {
        Self {
            kind: ValueKind::Reference { database, key },
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ValueKind {
        &mut self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        crate::value::values_equal(self, other)
    }
}

impl Eq for FirestoreValue {}

/// Doubles are stored by bit pattern so NaN and signed zeros survive
/// persistence.
mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        assert_eq!(v.as_string(), Some("hello"));
        assert!(FirestoreValue::from_double(f64::NAN).is_nan());
        assert!(FirestoreValue::from_integer(1).is_number());
    }

    #[test]
    fn nested_server_timestamps_keep_original_previous_value() {
        let original = FirestoreValue::from_integer(3);
        let first = FirestoreValue::server_timestamp(Timestamp::new(1, 0), Some(original.clone()));
        let second = FirestoreValue::server_timestamp(Timestamp::new(2, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp { previous_value, .. } => {
                assert_eq!(previous_value.as_deref(), Some(&original));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn nan_survives_serialization() {
        let value = FirestoreValue::from_double(f64::NAN);
        let encoded = serde_json::to_vec(&value).unwrap();
        let decoded: FirestoreValue = serde_json::from_slice(&encoded).unwrap();
        assert!(decoded.is_nan());
        assert_eq!(decoded, value);
    }
}
