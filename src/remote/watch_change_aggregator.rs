use std::collections::{BTreeMap, BTreeSet};

use crate::core::{TargetData, TargetPurpose};
use crate::model::{DatabaseId, DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, SnapshotVersion, TargetId};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::util::hard_assert;

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local cache currently associates with the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// `None` once the target is no longer listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests; the target is ignored while non-zero.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A fresh target always produces a change so views learn about it.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..Default::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                DocumentChangeType::Added => change.added_documents.insert(key.clone()),
                DocumentChangeType::Modified => change.modified_documents.insert(key.clone()),
                DocumentChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: DocumentChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(self.pending_responses >= 0, "Received more target responses than requests");
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds individual watch changes into [`RemoteEvent`]s, one per consistent
/// snapshot.
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: MutableDocumentMap,
    /// Every target a pending document change touched.
    document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: MutableDocumentMap::new(),
            document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, provider: &dyn TargetMetadataProvider, change: DocumentWatchChange) {
        let found = change
            .new_document
            .as_ref()
            .filter(|document| document.is_found_document())
            .cloned();
        for target_id in &change.updated_target_ids {
            match &found {
                Some(document) => self.add_document_to_target(provider, *target_id, document.clone()),
                None => self.remove_document_from_target(provider, *target_id, &change.key, change.new_document.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &change.key, change.new_document.clone());
        }
    }

    pub fn handle_target_change(&mut self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        for target_id in self.targets_for_change(provider, change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // Changes received before the add acknowledgement
                        // belong to an earlier incarnation of the target.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(change.cause.is_none(), "Target removals with a cause are handled as errors");
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        // Documents re-sent after a reset replace the cached membership.
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn targets_for_change(&self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(provider, *target_id))
            .collect()
    }

    /// Compares the backend's document count for a target with the local
    /// count. On a mismatch the Bloom filter, if usable, identifies the
    /// documents deleted while the client was away; otherwise the target is
    /// reset and re-listened from scratch.
    pub fn handle_existence_filter(&mut self, provider: &dyn TargetMetadataProvider, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        let target = &target_data.target;
        if target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted without a delete event, e.g. by
                // a TTL sweep. Remove it until the backend says otherwise.
                if let Ok(key) = DocumentKey::from_path(target.path().clone()) {
                    let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(provider, target_id, &key, Some(tombstone));
                }
            } else {
                hard_assert(expected_count == 1, "Single document existence filter with count other than 0 or 1");
            }
            return;
        }

        let current_count = self.current_document_count_for_target(provider, target_id);
        if current_count == expected_count as i64 {
            return;
        }

        let application = match self.parse_bloom_filter(change) {
            Some(bloom_filter) => self.apply_bloom_filter(provider, &bloom_filter, change, current_count),
            None => BloomFilterApplication::Skipped,
        };
        if application != BloomFilterApplication::Success {
            self.reset_target(provider, target_id);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {expected_count}, had {current_count}; resetting ({purpose:?})"
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        let spec = change.existence_filter.unchanged_names.as_ref()?;
        match BloomFilter::new(spec.bitmap.clone(), spec.padding, spec.hash_count) {
            Ok(filter) if filter.bit_count() == 0 => None,
            Ok(filter) => Some(filter),
            Err(err) => {
                log::warn!("applying bloom filter failed: {err}");
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication {
        let expected_count = change.existence_filter.count as i64;
        let removed = self.filter_removed_documents(provider, bloom_filter, change.target_id);
        if expected_count == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes cached members the filter does not contain; those were
    /// deleted remotely.
    fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
    ) -> i64 {
        let prefix = format!("{}/documents/", self.database_id.resource_name());
        let mut removed = 0;
        for key in provider.remote_keys_for_target(target_id) {
            let name = format!("{prefix}{}", key.path().canonical_string());
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything aggregated since the last call, and
    /// starts a fresh batch.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self.target_states.get(&target_id).map(|state| state.current).unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current document target that never saw its document
                // means the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let touched = self
                        .document_target_mapping
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !touched && !self.target_contains_document(provider, target_id, &key) {
                        let tombstone = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, &key, Some(tombstone));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Records that a watch or unwatch request went out for the target;
    /// changes are ignored until the backend acknowledges it.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId, document: MutableDocument) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(provider, target_id, &key) {
            DocumentChangeType::Modified
        } else {
            DocumentChangeType::Added
        };
        self.ensure_target_state(target_id).add_document_change(key.clone(), change_type);
        self.document_target_mapping.entry(key.clone()).or_default().insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = self.target_contains_document(provider, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeType::Removed);
        } else {
            // Added and removed within the same snapshot.
            state.remove_document_change(key);
        }
        self.document_target_mapping.entry(key.clone()).or_default().insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn current_document_count_for_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        hard_assert(
            !self.target_states.get(&target_id).is_some_and(TargetState::is_pending),
            "Should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, &key, None);
        }
    }

    fn target_contains_document(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId, key: &DocumentKey) -> bool {
        provider.remote_keys_for_target(target_id).contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(provider, target_id).is_some()
    }

    fn target_data_for_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> Option<TargetData> {
        if self.target_states.get(&target_id).is_some_and(TargetState::is_pending) {
            return None;
        }
        provider.target_data_for_target(target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Query, Target};
    use crate::model::ResourcePath;
    use crate::remote::watch_change::{BloomFilterSpec, ExistenceFilter};
    use crate::value::MapValue;

    #[derive(Default)]
    struct TestProvider {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, DocumentKeySet>,
    }

    impl TestProvider {
        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            let query = Query::new(ResourcePath::from_string("coll").unwrap());
            self.targets
                .insert(target_id, TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, 1));
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(Target::for_document(&key(path)), target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }
    }

    impl TargetMetadataProvider for TestProvider {
        fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), MapValue::empty())
    }

    fn aggregator() -> WatchChangeAggregator {
        WatchChangeAggregator::new(DatabaseId::new("p", "d"))
    }

    fn document_change(updated: Vec<TargetId>, removed: Vec<TargetId>, document: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated,
            removed_target_ids: removed,
            key: document.key().clone(),
            new_document: Some(document),
        }
    }

    fn target_change(state: WatchTargetChangeState, target_ids: Vec<TargetId>, token: &[u8]) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids,
            resume_token: token.to_vec(),
            read_time: None,
            cause: None,
        }
    }

    fn filter(target_id: TargetId, count: i32, unchanged_names: Option<BloomFilterSpec>) -> ExistenceFilterChange {
        ExistenceFilterChange {
            target_id,
            existence_filter: ExistenceFilter { count, unchanged_names },
        }
    }

    #[test]
    fn classifies_added_and_modified_documents() {
        let provider = TestProvider::default().with_query_target(1, &["coll/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(&provider, document_change(vec![1], vec![], doc("coll/a", 2)));
        aggregator.handle_document_change(&provider, document_change(vec![1], vec![], doc("coll/b", 2)));
        aggregator.handle_target_change(&provider, &target_change(WatchTargetChangeState::Current, vec![1], b"t1"));

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(3));
        let change = &event.target_changes[&1];
        assert!(change.current);
        assert_eq!(change.resume_token, b"t1");
        assert!(change.modified_documents.contains(&key("coll/a")));
        assert!(change.added_documents.contains(&key("coll/b")));
        assert_eq!(
            event.document_updates[&key("coll/b")].read_time(),
            SnapshotVersion::from_micros(3)
        );
    }

    #[test]
    fn ignores_changes_for_pending_targets() {
        let provider = TestProvider::default().with_query_target(1, &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(1);
        aggregator.handle_document_change(&provider, document_change(vec![1], vec![], doc("coll/a", 2)));
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(3));
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());

        aggregator.handle_target_change(&provider, &target_change(WatchTargetChangeState::Added, vec![1], b""));
        aggregator.handle_document_change(&provider, document_change(vec![1], vec![], doc("coll/a", 4)));
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(5));
        assert!(event.target_changes[&1].added_documents.contains(&key("coll/a")));
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let provider = TestProvider::default().with_limbo_target(2, "coll/gone");
        let mut aggregator = aggregator();
        aggregator.handle_target_change(&provider, &target_change(WatchTargetChangeState::Current, vec![2], b"t"));

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(7));
        let tombstone = &event.document_updates[&key("coll/gone")];
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), SnapshotVersion::from_micros(7));
        assert!(event.resolved_limbo_documents.contains(&key("coll/gone")));
    }

    #[test]
    fn mismatch_without_bloom_filter_resets_target() {
        let provider = TestProvider::default().with_query_target(1, &["coll/doc1", "coll/doc2"]);
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&provider, &filter(1, 1, None));

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(3));
        assert_eq!(event.target_mismatches.get(&1), Some(&TargetPurpose::ExistenceFilterMismatch));
        let change = &event.target_changes[&1];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(change.resume_token.is_empty());
    }

    #[test]
    fn bloom_filter_identifies_deleted_documents() {
        // The filter holds doc1..doc3 of projects/p/databases/d.
        let provider = TestProvider::default().with_query_target(1, &["coll/doc1", "coll/doc2", "coll/doc4"]);
        let spec = BloomFilterSpec {
            bitmap: vec![72, 0, 4, 36, 0, 128, 33, 0],
            padding: 0,
            hash_count: 3,
        };
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&provider, &filter(1, 2, Some(spec)));

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(3));
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&1];
        assert_eq!(change.removed_documents.iter().cloned().collect::<Vec<_>>(), vec![key("coll/doc4")]);
    }

    #[test]
    fn bloom_filter_false_positive_resets_with_bloom_purpose() {
        let provider = TestProvider::default().with_query_target(1, &["coll/doc1", "coll/doc2", "coll/doc3"]);
        let spec = BloomFilterSpec {
            bitmap: vec![72, 0, 4, 36, 0, 128, 33, 0],
            padding: 0,
            hash_count: 3,
        };
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&provider, &filter(1, 1, Some(spec)));

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(3));
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn invalid_bloom_filter_falls_back_to_full_reset() {
        let provider = TestProvider::default().with_query_target(1, &["coll/doc1", "coll/doc2"]);
        let spec = BloomFilterSpec {
            bitmap: vec![1],
            padding: 9,
            hash_count: 1,
        };
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&provider, &filter(1, 1, Some(spec)));

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(3));
        assert_eq!(event.target_mismatches.get(&1), Some(&TargetPurpose::ExistenceFilterMismatch));
    }

    #[test]
    fn query_documents_are_not_resolved_limbo_documents() {
        let provider = TestProvider::default()
            .with_query_target(1, &[])
            .with_limbo_target(2, "coll/a");
        let mut aggregator = aggregator();
        aggregator.handle_document_change(&provider, document_change(vec![1, 2], vec![], doc("coll/a", 2)));
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_micros(3));
        assert!(event.resolved_limbo_documents.is_empty());
    }
}
