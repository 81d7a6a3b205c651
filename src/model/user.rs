use serde::{Deserialize, Serialize};

/// The authenticated principal owning a mutation queue. Every unauthenticated
/// session shares the single anonymous user.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn anonymous() -> Self {
        Self { uid: None }
    }

    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which the user's queue rows are stored.
    pub fn storage_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}
