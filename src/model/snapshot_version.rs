use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::model::Timestamp;

/// A point in the backend's version history, totally ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self::new(Timestamp::new(0, 0))
    }

    pub fn max() -> Self {
        Self::new(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        ))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({}.{:09})", self.timestamp.seconds, self.timestamp.nanos)
    }
}
