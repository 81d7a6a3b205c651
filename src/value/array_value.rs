use serde::{Deserialize, Serialize};

use crate::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    pub fn contains(&self, value: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == value)
    }

    /// Appends every element of `elements` not already present.
    pub fn union(&self, elements: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !values.contains(element) {
                values.push(element.clone());
            }
        }
        Self::new(values)
    }

    /// Drops every occurrence of the given elements.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> Self {
        Self::new(
            self.values
                .iter()
                .filter(|value| !elements.contains(value))
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_remove_keep_order() {
        let array = ArrayValue::new(vec![FirestoreValue::from_integer(1), FirestoreValue::from_integer(2)]);
        let unioned = array.union(&[FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]);
        assert_eq!(unioned.values().len(), 3);
        let removed = unioned.remove_all(&[FirestoreValue::from_integer(1)]);
        assert_eq!(
            removed.values(),
            &[FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]
        );
    }
}
