use std::collections::BTreeMap;

use crate::error::FirestoreResult;
use crate::local::kv_store::{DbKey, KeyPart, KeyRange, Table};
use crate::local::persistence::{path_from_key, prefixed_path_key, Transaction};
use crate::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath, User};

/// Per-user store of the squashed pending mutation of each document.
pub struct DocumentOverlayCache {
    user_key: String,
}

impl DocumentOverlayCache {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.storage_key(),
        }
    }

    fn user_prefix(&self) -> DbKey {
        vec![KeyPart::from(self.user_key.as_str())]
    }

    fn overlay_key(&self, key: &DocumentKey) -> DbKey {
        prefixed_path_key(self.user_prefix(), key.path())
    }

    fn batch_key(&self, batch_id: BatchId, key: &DocumentKey) -> DbKey {
        vec![
            KeyPart::from(self.user_key.as_str()),
            KeyPart::from(batch_id),
            KeyPart::from(key.path().canonical_string()),
        ]
    }

    pub fn get_overlay(&self, txn: &Transaction<'_>, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        txn.get(Table::DocumentOverlays, &self.overlay_key(key))
    }

    pub fn get_overlays<'k, I>(&self, txn: &Transaction<'_>, keys: I) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut overlays = BTreeMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Stores `overlays` as produced by batch `largest_batch_id`, replacing
    /// previous overlays of the same documents.
    pub fn save_overlays(
        &self,
        txn: &mut Transaction<'_>,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            self.remove_overlay(txn, key)?;
            let overlay = Overlay::new(largest_batch_id, mutation.clone());
            txn.put(Table::DocumentOverlays, self.overlay_key(key), &overlay)?;
            txn.put(Table::OverlaysByBatch, self.batch_key(largest_batch_id, key), &())?;
        }
        Ok(())
    }

    fn remove_overlay(&self, txn: &mut Transaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        if let Some(existing) = self.get_overlay(txn, key)? {
            txn.delete(Table::OverlaysByBatch, &self.batch_key(existing.largest_batch_id(), key))?;
            txn.delete(Table::DocumentOverlays, &self.overlay_key(key))?;
        }
        Ok(())
    }

    /// Drops the overlays that batch `batch_id` produced for `keys`.
    pub fn remove_overlays_for_batch_id<'k, I>(
        &self,
        txn: &mut Transaction<'_>,
        keys: I,
        batch_id: BatchId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            if let Some(existing) = self.get_overlay(txn, key)? {
                if existing.largest_batch_id() == batch_id {
                    self.remove_overlay(txn, key)?;
                }
            }
        }
        Ok(())
    }

    /// Overlays of documents directly inside `collection` with a batch id
    /// larger than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &Transaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let prefix = prefixed_path_key(self.user_prefix(), collection);
        let depth = prefix.len() + 1;
        let mut overlays = BTreeMap::new();
        for (row, overlay) in txn.scan::<Overlay>(Table::DocumentOverlays, &KeyRange::prefix(prefix))? {
            if row.len() == depth && overlay.largest_batch_id() > since_batch_id {
                overlays.insert(DocumentKey::from_path(path_from_key(&row, 1))?, overlay);
            }
        }
        Ok(overlays)
    }

    /// Overlays in `collection_group` newer than `since_batch_id`, taking
    /// whole batches in batch order until at least `count` are collected.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &Transaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let mut by_batch: BTreeMap<BatchId, Vec<(DocumentKey, Overlay)>> = BTreeMap::new();
        for (row, overlay) in txn.scan::<Overlay>(Table::DocumentOverlays, &KeyRange::prefix(self.user_prefix()))? {
            let key = DocumentKey::from_path(path_from_key(&row, 1))?;
            if key.collection_group() == collection_group && overlay.largest_batch_id() > since_batch_id {
                by_batch.entry(overlay.largest_batch_id()).or_default().push((key, overlay));
            }
        }
        let mut overlays = BTreeMap::new();
        for (_, batch) in by_batch {
            if overlays.len() >= count {
                break;
            }
            overlays.extend(batch);
        }
        Ok(overlays)
    }

    pub fn overlay_count(&self, txn: &Transaction<'_>) -> FirestoreResult<usize> {
        Ok(txn
            .scan_keys(Table::DocumentOverlays, &KeyRange::prefix(self.user_prefix()))?
            .len())
    }
}
