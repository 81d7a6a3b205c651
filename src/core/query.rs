use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::filter::{reference_key, Filter};
use crate::core::target::Target;
use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::value::{canonical_id, compare_values, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }

    fn flipped(&self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn descending(field: FieldPath) -> Self {
        Self::new(field, Direction::Descending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{suffix}", self.field.canonical_string())
    }

    pub(crate) fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// Cursor position: one value per order-by, in order-by order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    pub fn canonical_id(&self) -> String {
        let values = self.position.iter().map(canonical_id).collect::<Vec<_>>().join(",");
        format!("{}{values}", if self.inclusive { "b:" } else { "a:" })
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (value, order) in self.position.iter().zip(order_by.iter()) {
            let ordering = if order.field.is_key_field() {
                match reference_key(value) {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(&order.field) {
                    Some(field) => compare_values(value, field),
                    None => Ordering::Equal,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub(crate) fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A query over one collection, one collection group or one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<i64>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection (odd length) or document (even length) at `path`.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self {
            collection_group: Some(collection_id.into()),
            ..Self::new(ResourcePath::root())
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn without_limit(mut self) -> Self {
        self.limit = None;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Restricts a collection group query to one concrete collection.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True for unfiltered, unbounded, unlimited queries whose result is the
    /// whole collection.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1 && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Fields constrained by inequality filters, sorted.
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(|filter| filter.flattened())
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit order-bys followed by the implicit ones: inequality fields not
    /// already ordered, then the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|order| order.field.clone()).collect();
        let last_direction = result.last().map(|order| order.direction).unwrap_or(Direction::Ascending);
        for field in self.inequality_fields() {
            if !seen.contains(&field) && !field.is_key_field() {
                seen.insert(field.clone());
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_path()) {
            result.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        result
    }

    /// The backend target for this query. Limit-to-last queries run with
    /// flipped ordering and swapped cursors.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => {
                let flipped = order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect();
                let start_at = self.end_at.as_ref().map(|b| Bound::new(b.position.clone(), b.inclusive));
                let end_at = self.start_at.as_ref().map(|b| Bound::new(b.position.clone(), b.inclusive));
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    self.filters.clone(),
                    flipped,
                    self.limit,
                    start_at,
                    end_at,
                )
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{suffix}", self.to_target().canonical_id())
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents by this query's normalized order-bys.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.order_by_comparator()(left, right)
    }

    pub fn order_by_comparator(&self) -> impl Fn(&MutableDocument, &MutableDocument) -> Ordering {
        let order_by = self.normalized_order_by();
        move |left, right| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::FilterOperator;
    use crate::model::SnapshotVersion;
    use crate::value::MapValue;

    fn doc(path: &str, rank: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("rank").unwrap(), FirestoreValue::from_integer(rank));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn rank() -> FieldPath {
        FieldPath::from_dot_separated("rank").unwrap()
    }

    #[test]
    fn collection_query_matches_only_immediate_children() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        assert!(query.matches(&doc("rooms/a", 1)));
        assert!(!query.matches(&doc("rooms/a/messages/m", 1)));
        assert!(!query.matches(&doc("halls/a", 1)));
    }

    #[test]
    fn collection_group_query_matches_any_depth() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/m", 1)));
        assert!(!query.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn inequality_adds_implicit_order_by() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_filter(Filter::field(rank(), FilterOperator::GreaterThan, FirestoreValue::from_integer(1)).unwrap());
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].field(), &rank());
        assert!(order_by[1].field().is_key_field());
    }

    #[test]
    fn orders_and_bounds_documents() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::descending(rank()))
            .starting_at(Bound::new(vec![FirestoreValue::from_integer(5)], false));
        assert!(query.matches(&doc("rooms/a", 4)));
        assert!(!query.matches(&doc("rooms/b", 5)));
        assert_eq!(
            query.compare_documents(&doc("rooms/a", 4), &doc("rooms/b", 3)),
            Ordering::Less
        );
    }

    #[test]
    fn limit_to_last_flips_target_ordering() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::ascending(rank()))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by()[0].direction(), Direction::Descending);
        assert_ne!(
            query.canonical_id(),
            query.clone().with_limit_to_first(2).canonical_id()
        );
    }

    #[test]
    fn missing_order_by_field_excludes_document() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("missing").unwrap()));
        assert!(!query.matches(&doc("rooms/a", 1)));
    }
}
