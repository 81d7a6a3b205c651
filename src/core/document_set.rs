use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::query::Query;
use crate::model::{DocumentKey, MutableDocument};

pub type DocumentComparator = Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// Documents of a view, sorted by the view's query order and addressable by
/// key.
///
/// The comparator must break ties on the document key so that two distinct
/// documents never compare equal.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Empty set ordered like `query`'s results.
    pub fn for_query(query: &Query) -> Self {
        Self::new(Arc::new(query.order_by_comparator()))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.by_key.keys()
    }

    /// Inserts `document`, replacing any previous version of the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.sorted.insert(index, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let document = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&document) {
            self.sorted.remove(index);
        }
        Some(document)
    }

    fn position(&self, document: &MutableDocument) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| (self.comparator)(probe, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|document| document.key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OrderBy;
    use crate::model::{FieldPath, ResourcePath, SnapshotVersion};
    use crate::value::{FirestoreValue, MapValue};

    fn doc(path: &str, rank: i64) -> MutableDocument {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("rank".to_string(), FirestoreValue::from_integer(rank));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            MapValue::new(fields),
        )
    }

    fn by_rank() -> DocumentSet {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("rank").unwrap()));
        DocumentSet::for_query(&query)
    }

    #[test]
    fn keeps_query_order_and_replaces_by_key() {
        let mut set = by_rank();
        set.insert(doc("rooms/b", 2));
        set.insert(doc("rooms/a", 3));
        set.insert(doc("rooms/c", 1));

        let order: Vec<_> = set.iter().map(|d| d.key().id().to_string()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);

        set.insert(doc("rooms/a", 0));
        assert_eq!(set.len(), 3);
        assert_eq!(set.first().unwrap().key().id(), "a");
        assert_eq!(set.last().unwrap().key().id(), "b");
        assert_eq!(set.index_of(&DocumentKey::from_string("rooms/c").unwrap()), Some(1));
    }

    #[test]
    fn remove_drops_both_indexes() {
        let mut set = by_rank();
        set.insert(doc("rooms/a", 1));
        set.insert(doc("rooms/b", 1));
        let key = DocumentKey::from_string("rooms/a").unwrap();

        assert!(set.remove(&key).is_some());
        assert!(set.remove(&key).is_none());
        assert!(!set.contains(&key));
        assert_eq!(set.len(), 1);
    }
}
