use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::ResourcePath;

/// Path to exactly one document. Ordered like its path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid document reference. Document references must have an even number of segments, but {path} has {}",
                path.len()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// Key that sorts before every real document. Used as an offset sentinel.
    pub fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        path.len() % 2 == 0 && !path.is_empty()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Id of the collection directly containing the document.
    pub fn collection_group(&self) -> &str {
        self.path
            .len()
            .checked_sub(2)
            .and_then(|index| self.path.segment(index))
            .unwrap_or("")
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or("")
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}
