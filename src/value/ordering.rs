use std::cmp::Ordering;

use crate::value::{FirestoreValue, MapValue, ValueKind};

/// Position of a value's type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp { .. } => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference { .. } => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

/// Total order over values: first by type, then within the type. NaN sorts
/// before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (
            ValueKind::ServerTimestamp {
                local_write_time: l, ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r, ..
            },
        ) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (
            ValueKind::Reference {
                database: ldb,
                key: lkey,
            },
            ValueKind::Reference {
                database: rdb,
                key: rkey,
            },
        ) => ldb
            .project_id()
            .cmp(rdb.project_id())
            .then_with(|| ldb.database().cmp(rdb.database()))
            .then_with(|| lkey.cmp(rkey)),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values().iter()) {
                match compare_values(lv, rv) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_iter = left.fields().iter();
    let mut right_iter = right.fields().iter();
    loop {
        match (left_iter.next(), right_iter.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    let as_double = integer as f64;
    match as_double.partial_cmp(&double) {
        Some(Ordering::Equal) => {
            // Resolve precision loss above 2^53 by comparing in integer space.
            if double >= i64::MAX as f64 {
                Ordering::Less
            } else if double <= i64::MIN as f64 {
                Ordering::Greater
            } else {
                integer.cmp(&(double as i64))
            }
        }
        Some(other) => other,
        None => Ordering::Equal,
    }
}

/// Equality used by filters and array transforms. Integers never equal
/// doubles, NaN equals NaN and `0.0` differs from `-0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (
            ValueKind::ServerTimestamp {
                local_write_time: l, ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r, ..
            },
        ) => l == r,
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (
            ValueKind::Reference {
                database: ldb,
                key: lkey,
            },
            ValueKind::Reference {
                database: rdb,
                key: rkey,
            },
        ) => ldb == rdb && lkey == rkey,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l
                    .values()
                    .iter()
                    .zip(r.values().iter())
                    .all(|(lv, rv)| values_equal(lv, rv))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields()
                    .iter()
                    .zip(r.fields().iter())
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        _ => false,
    }
}

/// Stable textual rendering used inside query canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
        ValueKind::ServerTimestamp {
            local_write_time, ..
        } => format!("serverTime({},{})", local_write_time.seconds, local_write_time.nanos),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(value) => value.to_base64(),
        ValueKind::Reference { key, .. } => key.to_string(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => format!(
            "[{}]",
            array
                .values()
                .iter()
                .map(canonical_id)
                .collect::<Vec<_>>()
                .join(",")
        ),
        ValueKind::Map(map) => format!(
            "{{{}}}",
            map.fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_id(value)))
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}

/// Approximate encoded size in bytes, used for cache size accounting.
pub fn estimate_byte_size(value: &FirestoreValue) -> usize {
    match value.kind() {
        ValueKind::Null => 4,
        ValueKind::Boolean(_) => 4,
        ValueKind::Integer(_) | ValueKind::Double(_) => 8,
        ValueKind::Timestamp(_) => 16,
        ValueKind::ServerTimestamp { previous_value, .. } => {
            16 + previous_value.as_deref().map(estimate_byte_size).unwrap_or(0)
        }
        ValueKind::String(value) => value.len() * 2,
        ValueKind::Bytes(value) => value.len(),
        ValueKind::Reference { key, .. } => key.path().iter().map(|segment| segment.len()).sum(),
        ValueKind::GeoPoint(_) => 16,
        ValueKind::Array(array) => array.values().iter().map(estimate_byte_size).sum(),
        ValueKind::Map(map) => estimate_map_byte_size(map),
    }
}

pub fn estimate_map_byte_size(map: &MapValue) -> usize {
    map.fields()
        .iter()
        .map(|(key, value)| key.len() * 2 + estimate_byte_size(value))
        .sum()
}
