use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{DocumentKey, FieldPath, MutableDocument};
use crate::value::{canonical_id, compare_values, type_order, values_equal, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    /// Operator name used by the structured query wire format.
    pub fn wire_name(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    /// Operators matching elements of an array field.
    pub fn is_array_membership(&self) -> bool {
        matches!(self, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny)
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() && !value.is_array() {
            return Err(invalid_argument(format!(
                "Filter '{}' requires an array value",
                op.as_str()
            )));
        }
        if field.is_key_field() {
            if matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny) {
                return Err(invalid_argument(format!(
                    "Filter '{}' is not supported on the document key",
                    op.as_str()
                )));
            }
            let all_references = match value.as_array() {
                Some(array) if op.takes_array() => array.values().iter().all(is_reference),
                _ => is_reference(&value),
            };
            if !all_references {
                return Err(invalid_argument(
                    "Filters on the document key require document reference values",
                ));
            }
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        let other = document.field(&self.field);
        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .is_some_and(|array| array.contains(&self.value)),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles.values().iter().any(|needle| array.contains(needle))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) => !other.is_null() && !candidates.contains(other),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) => {
                    !other.is_null() && self.op.matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
            _ => match other {
                Some(other) => {
                    type_order(other) == type_order(&self.value)
                        && self.op.matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            FilterOperator::In | FilterOperator::NotIn => {
                let found = self
                    .value
                    .as_array()
                    .map(|array| array.values().iter().any(|value| reference_key(value) == Some(key)))
                    .unwrap_or(false);
                if self.op == FilterOperator::In {
                    found
                } else {
                    !found
                }
            }
            _ => match reference_key(&self.value) {
                Some(bound) => self.op.matches_comparison(key.cmp(bound)),
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

fn is_reference(value: &FirestoreValue) -> bool {
    matches!(value.kind(), ValueKind::Reference { .. })
}

pub(crate) fn reference_key(value: &FirestoreValue) -> Option<&DocumentKey> {
    match value.kind() {
        ValueKind::Reference { key, .. } => Some(key),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeOperator {
    And,
    Or,
}

impl CompositeOperator {
    pub fn wire_name(&self) -> &'static str {
        match self {
            CompositeOperator::And => "AND",
            CompositeOperator::Or => "OR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeFilter {
    op: CompositeOperator,
    filters: Vec<Filter>,
}

impl CompositeFilter {
    pub fn new(op: CompositeOperator, filters: Vec<Filter>) -> Self {
        Self { op, filters }
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        FieldFilter::new(field, op, value).map(Filter::Field)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::And, filters))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::Or, filters))
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(document)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(document)),
            },
        }
    }

    /// Every field filter in this tree, depth first.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => {
                composite.filters.iter().flat_map(|f| f.flattened()).collect()
            }
        }
    }

    /// True for field filters and conjunctions of field filters.
    pub fn is_conjunction_of_field_filters(&self) -> bool {
        match self {
            Filter::Field(_) => true,
            Filter::Composite(composite) => {
                composite.op == CompositeOperator::And
                    && composite.filters.iter().all(|f| matches!(f, Filter::Field(_)))
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) => {
                let inner = composite
                    .filters
                    .iter()
                    .map(Filter::canonical_id)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{}({inner})", composite.op.wire_name().to_lowercase())
            }
        }
    }
}

/// Equality check shared with index lookups: `values_equal` semantics for
/// array operators, comparison semantics otherwise.
pub(crate) fn value_matches(filter: &FieldFilter, value: &FirestoreValue) -> bool {
    match filter.op {
        FilterOperator::ArrayContains => values_equal(value, &filter.value),
        FilterOperator::ArrayContainsAny | FilterOperator::In => filter
            .value
            .as_array()
            .is_some_and(|array| array.contains(value)),
        FilterOperator::NotIn => filter
            .value
            .as_array()
            .is_some_and(|array| !value.is_null() && !array.contains(value)),
        FilterOperator::NotEqual => {
            !value.is_null() && filter.op.matches_comparison(compare_values(value, &filter.value))
        }
        op => {
            type_order(value) == type_order(&filter.value)
                && op.matches_comparison(compare_values(value, &filter.value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseId, SnapshotVersion};
    use crate::value::MapValue;

    fn doc(path: &str, field: &str, value: FirestoreValue) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn path(field: &str) -> FieldPath {
        FieldPath::from_dot_separated(field).unwrap()
    }

    #[test]
    fn comparison_filters_require_matching_type() {
        let filter = Filter::field(path("n"), FilterOperator::GreaterThan, FirestoreValue::from_integer(1)).unwrap();
        assert!(filter.matches(&doc("c/a", "n", FirestoreValue::from_double(1.5))));
        assert!(!filter.matches(&doc("c/a", "n", FirestoreValue::from_string("z"))));
        assert!(!filter.matches(&doc("c/a", "m", FirestoreValue::from_integer(5))));
    }

    #[test]
    fn not_equal_skips_missing_and_null_fields() {
        let filter = Filter::field(path("n"), FilterOperator::NotEqual, FirestoreValue::from_integer(1)).unwrap();
        assert!(filter.matches(&doc("c/a", "n", FirestoreValue::from_integer(2))));
        assert!(!filter.matches(&doc("c/a", "n", FirestoreValue::null())));
        assert!(!filter.matches(&doc("c/a", "m", FirestoreValue::from_integer(2))));
    }

    #[test]
    fn array_operators() {
        let tags = FirestoreValue::from_array(vec![FirestoreValue::from_string("a"), FirestoreValue::from_integer(1)]);
        let document = doc("c/a", "tags", tags);
        let contains = Filter::field(path("tags"), FilterOperator::ArrayContains, FirestoreValue::from_string("a")).unwrap();
        assert!(contains.matches(&document));
        let any = Filter::field(
            path("tags"),
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_double(1.0)]),
        )
        .unwrap();
        assert!(!any.matches(&document));
        assert!(FieldFilter::new(path("tags"), FilterOperator::In, FirestoreValue::from_integer(1)).is_err());
    }

    #[test]
    fn key_filters_compare_document_keys() {
        let db = DatabaseId::default("p");
        let reference = FirestoreValue::from_reference(db, DocumentKey::from_string("c/m").unwrap());
        let filter = Filter::field(FieldPath::key_path(), FilterOperator::LessThan, reference).unwrap();
        assert!(filter.matches(&doc("c/a", "x", FirestoreValue::null())));
        assert!(!filter.matches(&doc("c/z", "x", FirestoreValue::null())));
        assert!(Filter::field(FieldPath::key_path(), FilterOperator::Equal, FirestoreValue::from_integer(1)).is_err());
    }

    #[test]
    fn composite_filters() {
        let a = Filter::field(path("n"), FilterOperator::Equal, FirestoreValue::from_integer(1)).unwrap();
        let b = Filter::field(path("n"), FilterOperator::Equal, FirestoreValue::from_integer(2)).unwrap();
        let or = Filter::or(vec![a.clone(), b.clone()]);
        assert!(or.matches(&doc("c/a", "n", FirestoreValue::from_integer(2))));
        assert!(!Filter::and(vec![a, b]).matches(&doc("c/a", "n", FirestoreValue::from_integer(2))));
        assert_eq!(or.flattened().len(), 2);
        assert!(!or.is_conjunction_of_field_filters());
    }
}
