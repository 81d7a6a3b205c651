use serde::{Deserialize, Serialize};

use crate::core::Target;
use crate::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A regular query listen.
    Listen,
    /// Re-listen after an existence filter mismatch without a usable Bloom
    /// filter.
    ExistenceFilterMismatch,
    /// Re-listen after the Bloom filter was applied and still disagreed.
    ExistenceFilterMismatchBloom,
    /// Single-document listen resolving a limbo document.
    LimboResolution,
}

/// A target together with the bookkeeping needed to resume it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the latest snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Latest version at which the target's results had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents expected on resume, for existence filter checks.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// New resume position. Clears any expected count.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: Option<i32>) -> Self {
        self.expected_count = expected_count;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}
