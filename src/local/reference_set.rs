use std::collections::BTreeSet;

use crate::model::{DocumentKey, DocumentKeySet};

/// In-memory set of `(document, id)` references, indexed both ways.
///
/// Ids are target ids for views or batch ids for mutations.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key.insert((key.clone(), id));
        self.by_id.insert((id, key.clone()));
    }

    pub fn add_references<'k, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'k, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference with `id` and returns the keys it held.
    pub fn remove_references_for_id(&mut self, id: i32) -> DocumentKeySet {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> DocumentKeySet {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(ref_id, _)| *ref_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(ref_key, _)| ref_key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_in_both_directions() {
        let mut references = ReferenceSet::new();
        let a = key("rooms/a");
        let b = key("rooms/b");
        references.add_references([&a, &b], 1);
        references.add_reference(&a, 2);

        assert!(references.contains_key(&a));
        assert_eq!(references.references_for_id(1).len(), 2);

        let removed = references.remove_references_for_id(1);
        assert_eq!(removed.len(), 2);
        assert!(references.contains_key(&a));
        assert!(!references.contains_key(&b));

        references.remove_reference(&a, 2);
        assert!(references.is_empty());
    }
}
