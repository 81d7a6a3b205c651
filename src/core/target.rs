use serde::{Deserialize, Serialize};

use crate::core::filter::{FieldFilter, Filter, FilterOperator};
use crate::core::query::{Bound, OrderBy};
use crate::model::{DocumentKey, MutableDocument, ResourcePath};

/// The backend-facing form of a query: normalized ordering, no limit type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<i64>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<i64>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    /// Single document target used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone(), None, Vec::new(), Vec::new(), None, None, None)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Collection group the target reads from: the explicit group, or the last
    /// segment of the collection path.
    pub fn collection_group_id(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None if !DocumentKey::is_document_key(&self.path) => self.path.last_segment(),
            None => None,
        }
    }

    /// Field filters of a conjunctive target, flattened.
    pub fn field_filters(&self) -> Vec<&FieldFilter> {
        self.filters.iter().flat_map(|filter| filter.flattened()).collect()
    }

    pub fn has_disjunction(&self) -> bool {
        !self.filters.iter().all(Filter::is_conjunction_of_field_filters)
    }

    pub fn array_filter(&self) -> Option<&FieldFilter> {
        self.field_filters().into_iter().find(|filter| {
            matches!(
                filter.op(),
                FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
            )
        })
    }

    /// Matches a document against filters and path only; ordering and
    /// cursors are applied by the query.
    pub fn matches_filters(&self, document: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(document))
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(&self.filters.iter().map(Filter::canonical_id).collect::<String>());
        id.push_str("|ob:");
        id.push_str(&self.order_by.iter().map(OrderBy::canonical_id).collect::<String>());
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end.canonical_id());
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::model::FieldPath;
    use crate::value::FirestoreValue;

    #[test]
    fn canonical_id_distinguishes_filters() {
        let base = Query::new(ResourcePath::from_string("rooms").unwrap());
        let filtered = base.clone().with_filter(
            Filter::field(
                FieldPath::from_dot_separated("a").unwrap(),
                FilterOperator::Equal,
                FirestoreValue::from_integer(1),
            )
            .unwrap(),
        );
        assert_ne!(base.to_target().canonical_id(), filtered.to_target().canonical_id());
        assert_eq!(base.to_target().canonical_id(), "rooms|f:|ob:__name__asc");
    }

    #[test]
    fn document_target() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let target = Target::for_document(&key);
        assert!(target.is_document_target());
        assert_eq!(target.collection_group_id(), None);
        let collection = Query::new(ResourcePath::from_string("rooms/a/msgs").unwrap()).to_target();
        assert_eq!(collection.collection_group_id(), Some("msgs"));
    }
}
