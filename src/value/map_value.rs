use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::FieldPath;
use crate::value::{FirestoreValue, ValueKind};

/// Object value; also the data of every document.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut segments = path.segments().iter();
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            match current.kind() {
                ValueKind::Map(map) => current = map.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating (or replacing non-map values with)
    /// intermediate maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
            if !matches!(entry.kind(), ValueKind::Map(_)) {
                *entry = FirestoreValue::from_map(BTreeMap::new());
            }
            current = match entry.kind_mut() {
                ValueKind::Map(map) => &mut map.fields,
                _ => return,
            };
        }
        current.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            current = match current.get_mut(segment).map(FirestoreValue::kind_mut) {
                Some(ValueKind::Map(map)) => &mut map.fields,
                _ => return,
            };
        }
        current.remove(last);
    }

    /// Every leaf field path in the map. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> BTreeSet<FieldPath> {
        let mut mask = BTreeSet::new();
        collect_leaf_paths(&self.fields, None, &mut mask);
        mask
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: Option<&FieldPath>,
    mask: &mut BTreeSet<FieldPath>,
) {
    for (key, value) in fields {
        let path = match prefix {
            Some(prefix) => prefix.child(key.clone()),
            None => FieldPath::new([key.clone()]).unwrap_or_else(|_| FieldPath::key_path()),
        };
        match value.kind() {
            ValueKind::Map(map) if !map.fields.is_empty() => {
                collect_leaf_paths(&map.fields, Some(&path), mask);
            }
            _ => {
                mask.insert(path);
            }
        }
    }
}
