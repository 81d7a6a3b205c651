//! Order-preserving byte encoding of values for index entries.
//!
//! Two values compare equal under [`compare_values`](crate::value::compare_values)
//! exactly when their encodings are byte-equal, and encodings sort like the
//! values they encode.

use crate::model::{IndexKind, Timestamp};
use crate::value::{FirestoreValue, MapValue, ValueKind};

const TYPE_NULL: u8 = 5;
const TYPE_BOOLEAN: u8 = 10;
const TYPE_NAN: u8 = 13;
const TYPE_NUMBER: u8 = 15;
const TYPE_TIMESTAMP: u8 = 20;
const TYPE_SERVER_TIMESTAMP: u8 = 22;
const TYPE_STRING: u8 = 25;
const TYPE_BYTES: u8 = 30;
const TYPE_REFERENCE: u8 = 37;
const TYPE_GEO_POINT: u8 = 45;
const TYPE_ARRAY: u8 = 50;
const TYPE_MAP: u8 = 55;

/// Terminates arrays and maps; sorts before every type label.
const END: u8 = 2;

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const SEPARATOR: u8 = 0x01;

/// Encodes `value` for an index segment of the given kind. Descending
/// segments invert every byte so that the order flips.
pub fn encode_segment(value: &FirestoreValue, kind: IndexKind) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    if kind == IndexKind::Descending {
        for byte in &mut out {
            *byte = !*byte;
        }
    }
    out
}

pub fn encode_value(value: &FirestoreValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &FirestoreValue, out: &mut Vec<u8>) {
    match value.kind() {
        ValueKind::Null => out.push(TYPE_NULL),
        ValueKind::Boolean(flag) => {
            out.push(TYPE_BOOLEAN);
            out.push(u8::from(*flag));
        }
        ValueKind::Integer(integer) => write_number(*integer as f64, out),
        ValueKind::Double(double) => {
            if double.is_nan() {
                out.push(TYPE_NAN);
            } else {
                write_number(*double, out);
            }
        }
        ValueKind::Timestamp(timestamp) => {
            out.push(TYPE_TIMESTAMP);
            write_timestamp(timestamp, out);
        }
        ValueKind::ServerTimestamp { local_write_time, .. } => {
            out.push(TYPE_SERVER_TIMESTAMP);
            write_timestamp(local_write_time, out);
        }
        ValueKind::String(string) => {
            out.push(TYPE_STRING);
            write_escaped(string.as_bytes(), out);
        }
        ValueKind::Bytes(bytes) => {
            out.push(TYPE_BYTES);
            write_escaped(bytes.as_slice(), out);
        }
        ValueKind::Reference { database, key } => {
            out.push(TYPE_REFERENCE);
            write_escaped(database.project_id().as_bytes(), out);
            write_escaped(database.database().as_bytes(), out);
            for segment in key.path().iter() {
                write_escaped(segment.as_bytes(), out);
            }
            out.push(END);
        }
        ValueKind::GeoPoint(point) => {
            out.push(TYPE_GEO_POINT);
            out.extend_from_slice(&ordered_f64(point.latitude()));
            out.extend_from_slice(&ordered_f64(point.longitude()));
        }
        ValueKind::Array(array) => {
            out.push(TYPE_ARRAY);
            for element in array.values() {
                write_value(element, out);
            }
            out.push(END);
        }
        ValueKind::Map(map) => {
            out.push(TYPE_MAP);
            write_map(map, out);
        }
    }
}

fn write_map(map: &MapValue, out: &mut Vec<u8>) {
    for (key, value) in map.fields() {
        write_escaped(key.as_bytes(), out);
        write_value(value, out);
    }
    out.push(END);
}

fn write_number(number: f64, out: &mut Vec<u8>) {
    out.push(TYPE_NUMBER);
    // -0.0 and 0.0 are the same index value.
    let number = if number == 0.0 { 0.0 } else { number };
    out.extend_from_slice(&ordered_f64(number));
}

fn write_timestamp(timestamp: &Timestamp, out: &mut Vec<u8>) {
    out.extend_from_slice(&((timestamp.seconds as u64) ^ (1 << 63)).to_be_bytes());
    out.extend_from_slice(&(timestamp.nanos as u32).to_be_bytes());
}

fn ordered_f64(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    ordered.to_be_bytes()
}

fn write_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        out.push(byte);
        if byte == ESCAPE {
            out.push(ESCAPED_NUL);
        }
    }
    out.push(ESCAPE);
    out.push(SEPARATOR);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseId, DocumentKey};
    use crate::value::{compare_values, BytesValue};
    use std::cmp::Ordering;

    fn samples() -> Vec<FirestoreValue> {
        let db = DatabaseId::default("p");
        vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NEG_INFINITY),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(-0.5),
            FirestoreValue::from_integer(0),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(7),
            FirestoreValue::from_timestamp(Timestamp::new(-1, 0)),
            FirestoreValue::from_timestamp(Timestamp::new(10, 5)),
            FirestoreValue::from_string(""),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("a\u{0}"),
            FirestoreValue::from_string("ab"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0, 1])),
            FirestoreValue::from_reference(db.clone(), DocumentKey::from_string("a/b").unwrap()),
            FirestoreValue::from_reference(db, DocumentKey::from_string("a/c").unwrap()),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), FirestoreValue::null()]),
            FirestoreValue::from_map(Default::default()),
        ]
    }

    #[test]
    fn encoding_preserves_value_order() {
        let values = samples();
        for left in &values {
            for right in &values {
                let expected = compare_values(left, right);
                let actual = encode_value(left).cmp(&encode_value(right));
                assert_eq!(actual, expected, "{left:?} vs {right:?}");
            }
        }
    }

    #[test]
    fn equal_numbers_encode_identically() {
        assert_eq!(
            encode_value(&FirestoreValue::from_integer(3)),
            encode_value(&FirestoreValue::from_double(3.0))
        );
        assert_eq!(
            encode_value(&FirestoreValue::from_double(-0.0)),
            encode_value(&FirestoreValue::from_integer(0))
        );
    }

    #[test]
    fn descending_segments_reverse_order() {
        let low = encode_segment(&FirestoreValue::from_integer(1), IndexKind::Descending);
        let high = encode_segment(&FirestoreValue::from_integer(2), IndexKind::Descending);
        assert_eq!(low.cmp(&high), Ordering::Greater);
    }
}
