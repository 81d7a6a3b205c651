use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::{Target, TargetData};
use crate::error::FirestoreResult;
use crate::local::kv_store::{DbKey, KeyPart, KeyRange, Table};
use crate::local::persistence::{path_from_key, path_key, Transaction};
use crate::model::{DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId};

const GLOBAL_TARGET_METADATA: &str = "target_metadata";

/// Target id of the per-document row carrying the document's last
/// reference sequence number.
const SENTINEL_TARGET_ID: TargetId = 0;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TargetMetadata {
    highest_target_id: TargetId,
    highest_listen_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    target_count: usize,
}

fn target_key(target_id: TargetId) -> DbKey {
    vec![KeyPart::from(target_id)]
}

fn canonical_key(canonical_id: &str, target_id: TargetId) -> DbKey {
    vec![KeyPart::from(canonical_id), KeyPart::from(target_id)]
}

fn target_document_key(target_id: TargetId, key: &DocumentKey) -> DbKey {
    vec![KeyPart::from(target_id), KeyPart::from(key.path().canonical_string())]
}

fn document_target_key(key: &DocumentKey, target_id: TargetId) -> DbKey {
    let mut row = path_key(key.path());
    row.push(KeyPart::from(target_id));
    row
}

fn document_from_target_row(row: &DbKey) -> FirestoreResult<DocumentKey> {
    match row.get(1) {
        Some(KeyPart::Str(path)) => DocumentKey::from_string(path),
        _ => Ok(DocumentKey::empty()),
    }
}

/// Persisted listen targets, their matching documents and the reference
/// sequence numbers used by garbage collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    fn metadata(&self, txn: &Transaction<'_>) -> FirestoreResult<TargetMetadata> {
        Ok(txn.get_global(GLOBAL_TARGET_METADATA)?.unwrap_or_default())
    }

    fn save_metadata(&self, txn: &mut Transaction<'_>, metadata: &TargetMetadata) -> FirestoreResult<()> {
        txn.put_global(GLOBAL_TARGET_METADATA, metadata)
    }

    pub fn highest_target_id(&self, txn: &Transaction<'_>) -> FirestoreResult<TargetId> {
        Ok(self.metadata(txn)?.highest_target_id)
    }

    pub fn highest_listen_sequence_number(&self, txn: &Transaction<'_>) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.metadata(txn)?.highest_listen_sequence_number)
    }

    pub fn last_remote_snapshot_version(&self, txn: &Transaction<'_>) -> FirestoreResult<SnapshotVersion> {
        Ok(self.metadata(txn)?.last_remote_snapshot_version)
    }

    pub fn set_last_remote_snapshot_version(
        &self,
        txn: &mut Transaction<'_>,
        version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_remote_snapshot_version = version;
        self.save_metadata(txn, &metadata)
    }

    pub fn target_count(&self, txn: &Transaction<'_>) -> FirestoreResult<usize> {
        Ok(self.metadata(txn)?.target_count)
    }

    pub fn add_target_data(&self, txn: &mut Transaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.metadata(txn)?;
        metadata.target_count += 1;
        self.bump_highest(&mut metadata, target_data);
        self.save_metadata(txn, &metadata)
    }

    pub fn update_target_data(&self, txn: &mut Transaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.metadata(txn)?;
        if self.bump_highest(&mut metadata, target_data) {
            self.save_metadata(txn, &metadata)?;
        }
        Ok(())
    }

    fn bump_highest(&self, metadata: &mut TargetMetadata, target_data: &TargetData) -> bool {
        let mut changed = false;
        if target_data.target_id > metadata.highest_target_id {
            metadata.highest_target_id = target_data.target_id;
            changed = true;
        }
        if target_data.sequence_number > metadata.highest_listen_sequence_number {
            metadata.highest_listen_sequence_number = target_data.sequence_number;
            changed = true;
        }
        changed
    }

    fn save_target_data(&self, txn: &mut Transaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        txn.put(Table::Targets, target_key(target_data.target_id), target_data)?;
        txn.put(
            Table::TargetsByCanonicalId,
            canonical_key(&target_data.target.canonical_id(), target_data.target_id),
            &(),
        )
    }

    /// Removes the target and its document associations.
    pub fn remove_target_data(&self, txn: &mut Transaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        txn.delete(Table::Targets, &target_key(target_data.target_id))?;
        txn.delete(
            Table::TargetsByCanonicalId,
            &canonical_key(&target_data.target.canonical_id(), target_data.target_id),
        )?;
        let mut metadata = self.metadata(txn)?;
        metadata.target_count = metadata.target_count.saturating_sub(1);
        self.save_metadata(txn, &metadata)
    }

    pub fn get_target_data(&self, txn: &Transaction<'_>, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let candidates = txn.scan_keys(
            Table::TargetsByCanonicalId,
            &KeyRange::prefix(vec![KeyPart::from(target.canonical_id())]),
        )?;
        for row in candidates {
            let Some(KeyPart::Int(target_id)) = row.get(1) else {
                continue;
            };
            if let Some(data) = self.get_target_data_for_id(txn, *target_id as TargetId)? {
                // Canonical ids may collide; the target itself decides.
                if &data.target == target {
                    return Ok(Some(data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_for_id(&self, txn: &Transaction<'_>, target_id: TargetId) -> FirestoreResult<Option<TargetData>> {
        txn.get(Table::Targets, &target_key(target_id))
    }

    pub fn all_target_data(&self, txn: &Transaction<'_>) -> FirestoreResult<Vec<TargetData>> {
        Ok(txn
            .scan::<TargetData>(Table::Targets, &KeyRange::all())?
            .into_iter()
            .map(|(_, data)| data)
            .collect())
    }

    pub fn add_matching_keys<'k, I>(&self, txn: &mut Transaction<'_>, keys: I, target_id: TargetId) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let sequence_number = txn.sequence_number();
        for key in keys {
            txn.put(Table::TargetDocuments, target_document_key(target_id, key), &())?;
            txn.put(Table::DocumentTargets, document_target_key(key, target_id), &sequence_number)?;
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k, I>(&self, txn: &mut Transaction<'_>, keys: I, target_id: TargetId) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            txn.delete(Table::TargetDocuments, &target_document_key(target_id, key))?;
            txn.delete(Table::DocumentTargets, &document_target_key(key, target_id))?;
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(&self, txn: &mut Transaction<'_>, target_id: TargetId) -> FirestoreResult<()> {
        for key in self.get_matching_keys_for_target_id(txn, target_id)? {
            txn.delete(Table::TargetDocuments, &target_document_key(target_id, &key))?;
            txn.delete(Table::DocumentTargets, &document_target_key(&key, target_id))?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(&self, txn: &Transaction<'_>, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        txn.scan_keys(Table::TargetDocuments, &KeyRange::prefix(target_key(target_id)))?
            .iter()
            .map(document_from_target_row)
            .collect::<FirestoreResult<BTreeSet<_>>>()
    }

    fn document_target_ids(&self, txn: &Transaction<'_>, key: &DocumentKey) -> FirestoreResult<Vec<TargetId>> {
        let prefix = path_key(key.path());
        let depth = prefix.len() + 1;
        Ok(txn
            .scan_keys(Table::DocumentTargets, &KeyRange::prefix(prefix))?
            .into_iter()
            .filter(|row| row.len() == depth)
            .filter_map(|row| match row.last() {
                Some(KeyPart::Int(target_id)) => Some(*target_id as TargetId),
                _ => None,
            })
            .collect())
    }

    /// Whether any target matches `key`.
    pub fn contains_key(&self, txn: &Transaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(self
            .document_target_ids(txn, key)?
            .into_iter()
            .any(|target_id| target_id != SENTINEL_TARGET_ID))
    }

    /// Stamps `key` with the transaction's sequence number.
    pub fn update_sentinel(&self, txn: &mut Transaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        let sequence_number = txn.sequence_number();
        txn.put(
            Table::DocumentTargets,
            document_target_key(key, SENTINEL_TARGET_ID),
            &sequence_number,
        )
    }

    pub fn remove_sentinel(&self, txn: &mut Transaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        txn.delete(Table::DocumentTargets, &document_target_key(key, SENTINEL_TARGET_ID))
    }

    /// Every document with a sentinel row and its last reference sequence
    /// number.
    pub fn sentinel_rows(&self, txn: &Transaction<'_>) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let mut rows = Vec::new();
        for (row, sequence_number) in txn.scan::<ListenSequenceNumber>(Table::DocumentTargets, &KeyRange::all())? {
            if row.last() != Some(&KeyPart::Int(SENTINEL_TARGET_ID as i64)) {
                continue;
            }
            let path = path_from_key(&row[..row.len() - 1], 0);
            rows.push((DocumentKey::from_path(path)?, sequence_number));
        }
        Ok(rows)
    }

    /// Removes targets last used at or before `upper_bound` that are not in
    /// `active_target_ids`. Returns the number removed.
    pub fn remove_targets(
        &self,
        txn: &mut Transaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in self.all_target_data(txn)? {
            if target_data.sequence_number <= upper_bound && !active_target_ids.contains(&target_data.target_id) {
                self.remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
