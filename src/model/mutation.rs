use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::util::hard_assert;
use crate::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Set of field paths touched by a patch or by the local view of a document.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether `path` lies under any field of the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<'a, I: IntoIterator<Item = &'a FieldPath>>(&self, other: I) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(other.into_iter().cloned());
        Self { fields }
    }
}

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Result of the transform computed locally, before the backend has
    /// seen it.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(coerce_array(previous).union(elements).into_values())
            }
            TransformOperation::ArrayRemove(elements) => {
                FirestoreValue::from_array(coerce_array(previous).remove_all(elements).into_values())
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                increment(&base, operand)
            }
        }
    }

    /// Result of the transform once the backend reported `transform_result`.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match (&self.operation, transform_result) {
            (TransformOperation::ServerTimestamp, Some(result))
            | (TransformOperation::NumericIncrement(_), Some(result)) => result,
            (TransformOperation::ServerTimestamp, None) => FirestoreValue::null(),
            _ => self.apply_to_local_view(previous, Timestamp::new(0, 0)),
        }
    }

    /// Value the transform starts from, for transforms whose result depends
    /// on it. Only increments are not idempotent.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match &self.operation {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn coerce_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => FirestoreValue::from_integer(l.saturating_add(*r)),
        (ValueKind::Integer(l), ValueKind::Double(r)) => FirestoreValue::from_double(*l as f64 + r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => FirestoreValue::from_double(l + *r as f64),
        (ValueKind::Double(l), ValueKind::Double(r)) => FirestoreValue::from_double(l + r),
        _ => operand.clone(),
    }
}

/// Outcome of one mutation as acknowledged by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Set { value: MapValue },
    Patch { data: MapValue, field_mask: FieldMask },
    Delete,
    /// Only checks the precondition on the backend; never changes a document.
    Verify,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
    kind: MutationKind,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            field_transforms: Vec::new(),
            kind: MutationKind::Set { value },
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            field_transforms: Vec::new(),
            kind: MutationKind::Patch { data, field_mask },
        }
    }

    pub fn delete(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            field_transforms: Vec::new(),
            kind: MutationKind::Delete,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            field_transforms: Vec::new(),
            kind: MutationKind::Verify,
        }
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    /// Fields this mutation may change, or `None` when it replaces the whole
    /// document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { field_mask, .. } => Some(
                field_mask.union_with(self.field_transforms.iter().map(FieldTransform::field)),
            ),
            MutationKind::Verify => Some(FieldMask::empty()),
            _ => None,
        }
    }

    /// Applies the acknowledged mutation to the committed document.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        self.verify_key_matches(document);
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, field_mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The backend accepted a patch we cannot reproduce; only
                    // the version is known.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut merged = document.data().clone();
                apply_patch(&mut merged, data, field_mask);
                apply_transform_results(&mut merged, &self.field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, merged)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies the pending mutation to the local view of `document`.
    ///
    /// `previous_mask` holds the fields changed by earlier mutations (`None`
    /// meaning the whole document); the returned mask adds this mutation's
    /// fields.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        self.verify_key_matches(document);
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, field_mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut merged = document.data().clone();
                apply_patch(&mut merged, data, field_mask);
                apply_transform_results(&mut merged, &self.field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, merged)
                    .set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union_with(field_mask.fields())
                        .union_with(self.field_transforms.iter().map(FieldTransform::field))
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Base values for the non-idempotent transforms of this mutation, read
    /// from the current local view.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        let mut found = false;
        for transform in &self.field_transforms {
            if let Some(value) = transform.compute_base_value(document.field(transform.field())) {
                base.set(transform.field(), value);
                found = true;
            }
        }
        found.then_some(base)
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        server_results: &[FirestoreValue],
    ) -> Vec<FirestoreValue> {
        hard_assert(
            server_results.is_empty() || server_results.len() == self.field_transforms.len(),
            format!(
                "server transform result count ({}) should match field transform count ({})",
                server_results.len(),
                self.field_transforms.len()
            ),
        );
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                transform.apply_to_remote_document(
                    document.field(transform.field()),
                    server_results.get(index).cloned(),
                )
            })
            .collect()
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<FirestoreValue> {
        self.field_transforms
            .iter()
            .map(|transform| {
                transform.apply_to_local_view(document.field(transform.field()), local_write_time)
            })
            .collect()
    }

    fn verify_key_matches(&self, document: &MutableDocument) {
        hard_assert(
            document.key() == &self.key,
            format!(
                "Can only apply a mutation to a document with the same key ({} != {})",
                self.key,
                document.key()
            ),
        );
    }
}

fn apply_patch(target: &mut MapValue, data: &MapValue, field_mask: &FieldMask) {
    for path in field_mask.fields() {
        match data.get(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

fn apply_transform_results(target: &mut MapValue, transforms: &[FieldTransform], results: Vec<FirestoreValue>) {
    for (transform, result) in transforms.iter().zip(results) {
        target.set(transform.field(), result);
    }
}

/// Mutation that turns the committed state of a document into `document`
/// (its overlaid local view), restricted to `mask`.
///
/// Returns `None` when the document has no local changes.
pub fn calculate_overlay_mutation(document: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
        return None;
    }

    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone(), Precondition::None)
        } else {
            Mutation::set(document.key().clone(), document.data().clone(), Precondition::None)
        });
    };

    let mut patch_value = MapValue::empty();
    let mut patch_mask = BTreeSet::new();
    for field in mask.fields() {
        if patch_mask.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = document.field(&path).cloned();
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = document.field(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value),
            None => patch_value.delete(&path),
        }
        patch_mask.insert(path);
    }
    Some(Mutation::patch(
        document.key().clone(),
        patch_value,
        FieldMask::new(patch_mask),
        Precondition::None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (field, entry) in entries {
            value.set(&path(field), entry.clone());
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn patch(entries: &[(&str, FirestoreValue)]) -> Mutation {
        let data = map(entries);
        let mask = FieldMask::new(entries.iter().map(|(field, _)| path(field)));
        Mutation::patch(key(), data, mask, Precondition::None)
    }

    #[test]
    fn set_replaces_local_view() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("old", FirestoreValue::from_bool(true))]),
        );
        let mutation = Mutation::set(key(), map(&[("x", FirestoreValue::from_integer(1))]), Precondition::None);
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data(), &map(&[("x", FirestoreValue::from_integer(1))]));
    }

    #[test]
    fn patch_requires_existing_document_by_precondition() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            map(&[("x", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("x")]),
            Precondition::Exists(true),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(doc.is_no_document());
    }

    #[test]
    fn consecutive_patches_merge_into_one_overlay() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mut mask = Some(FieldMask::empty());
        mask = patch(&[("x", FirestoreValue::from_integer(1))]).apply_to_local_view(&mut doc, mask, Timestamp::now());
        mask = patch(&[("y", FirestoreValue::from_integer(2))]).apply_to_local_view(&mut doc, mask, Timestamp::now());

        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay.kind() {
            MutationKind::Patch { data, field_mask } => {
                assert_eq!(data.get(&path("x")), Some(&FirestoreValue::from_integer(1)));
                assert_eq!(data.get(&path("y")), Some(&FirestoreValue::from_integer(2)));
                assert_eq!(field_mask.fields().len(), 2);
            }
            other => panic!("expected a patch overlay, got {other:?}"),
        }
    }

    #[test]
    fn delete_overlay_for_deleted_document() {
        let mut doc = MutableDocument::new_found_document(key(), version(1), MapValue::empty());
        let mask = Mutation::delete(key(), Precondition::None).apply_to_local_view(
            &mut doc,
            Some(FieldMask::empty()),
            Timestamp::now(),
        );
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        assert_eq!(overlay.kind(), &MutationKind::Delete);
    }

    #[test]
    fn increment_uses_server_result_when_acknowledged() {
        let transform = FieldTransform::new(
            path("count"),
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty(), Precondition::None)
            .with_transforms(vec![transform]);
        let mut local = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("count", FirestoreValue::from_integer(5))]),
        );
        let mut remote = local.clone();

        mutation.apply_to_local_view(&mut local, None, Timestamp::now());
        assert_eq!(local.field(&path("count")), Some(&FirestoreValue::from_integer(7)));

        let result = MutationResult {
            version: version(2),
            transform_results: vec![FirestoreValue::from_integer(10)],
        };
        mutation.apply_to_remote_document(&mut remote, &result);
        assert_eq!(remote.field(&path("count")), Some(&FirestoreValue::from_integer(10)));
        assert!(remote.has_committed_mutations());
        assert_eq!(remote.version(), version(2));
    }

    #[test]
    fn base_value_captured_for_increment_only() {
        let doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("count", FirestoreValue::from_string("oops"))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty(), Precondition::None)
            .with_transforms(vec![
                FieldTransform::new(
                    path("count"),
                    TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
                ),
                FieldTransform::new(path("at"), TransformOperation::ServerTimestamp),
            ]);
        let base = mutation.extract_transform_base_value(&doc).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("count".to_string(), FirestoreValue::from_integer(0));
        assert_eq!(base, MapValue::new(expected));
    }

    #[test]
    fn patch_on_missing_document_acknowledges_as_unknown() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            map(&[("x", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("x")]),
            Precondition::Exists(true),
        );
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult {
                version: version(3),
                transform_results: vec![],
            },
        );
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(3));
    }
}
