use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, Mutation};

/// Net local change of one document across all pending batches, tagged with
/// the largest batch id folded into it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    largest_batch_id: i32,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn largest_batch_id(&self) -> i32 {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
