use std::collections::BTreeSet;
use std::time::Duration;

use crate::constants::{CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES, INVALID_SEQUENCE_NUMBER};
use crate::error::FirestoreResult;
use crate::local::mutation_queue::MutationQueue;
use crate::local::persistence::Transaction;
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::model::{DocumentKey, ListenSequenceNumber, TargetId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Collection only runs once the document cache is at least this large.
    /// `CACHE_SIZE_UNLIMITED` disables collection.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE_BYTES)
    }
}

impl LruParams {
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size_bytes,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }

    pub fn with_percentile_to_collect(mut self, percentile: u32) -> Self {
        self.percentile_to_collect = percentile;
        self
    }

    pub fn with_maximum_sequence_numbers_to_collect(mut self, maximum: usize) -> Self {
        self.maximum_sequence_numbers_to_collect = maximum;
        self
    }
}

/// When the client schedules collection passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcSchedule {
    pub initial_delay: Duration,
    pub regular_delay: Duration,
}

impl Default for GcSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            regular_delay: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn skipped() -> Self {
        Self::default()
    }
}

/// Removes targets and documents whose last use is old enough, in passes.
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: TargetCache,
    remote_documents: RemoteDocumentCache,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self {
            params,
            target_cache: TargetCache::new(),
            remote_documents: RemoteDocumentCache::new(),
        }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    /// Runs one pass unless collection is disabled or the cache is still
    /// below its threshold.
    ///
    /// Targets in `active_target_ids` and documents held by a target, a
    /// pending mutation or `pinned` are never removed.
    pub fn collect(
        &self,
        txn: &mut Transaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        if self.params.cache_size_collection_threshold == CACHE_SIZE_UNLIMITED {
            log::debug!("garbage collection skipped; disabled");
            return Ok(LruResults::skipped());
        }
        let cache_size = self.remote_documents.byte_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::skipped());
        }
        self.run_garbage_collection(txn, active_target_ids, pinned)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut Transaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        let mut sequence_numbers: Vec<ListenSequenceNumber> = self
            .target_cache
            .all_target_data(txn)?
            .into_iter()
            .map(|data| data.sequence_number)
            .collect();
        let orphaned = self.orphaned_documents(txn, pinned)?;
        sequence_numbers.extend(orphaned.iter().map(|(_, sequence_number)| *sequence_number));

        let percentile = self.params.percentile_to_collect as usize;
        let to_collect = (sequence_numbers.len() * percentile / 100).min(self.params.maximum_sequence_numbers_to_collect);
        let upper_bound = nth_sequence_number(&mut sequence_numbers, to_collect);

        let targets_removed = self.target_cache.remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, pinned)?;

        log::debug!(
            "LRU garbage collection: counted {} sequence numbers, removed {targets_removed} targets and {documents_removed} documents up to {upper_bound}",
            to_collect
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }

    fn is_referenced(&self, txn: &Transaction<'_>, key: &DocumentKey, pinned: &ReferenceSet) -> FirestoreResult<bool> {
        Ok(pinned.contains_key(key)
            || self.target_cache.contains_key(txn, key)?
            || MutationQueue::any_queue_contains_key(txn, key)?)
    }

    fn orphaned_documents(
        &self,
        txn: &Transaction<'_>,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let mut orphaned = Vec::new();
        for (key, sequence_number) in self.target_cache.sentinel_rows(txn)? {
            if !self.is_referenced(txn, &key, pinned)? {
                orphaned.push((key, sequence_number));
            }
        }
        Ok(orphaned)
    }

    /// Removes unreferenced documents last used at or before `upper_bound`.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut Transaction<'_>,
        upper_bound: ListenSequenceNumber,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for (key, sequence_number) in self.target_cache.sentinel_rows(txn)? {
            if sequence_number > upper_bound || self.is_referenced(txn, &key, pinned)? {
                continue;
            }
            self.remote_documents.remove_entry(txn, &key)?;
            self.target_cache.remove_sentinel(txn, &key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// The `n`-th smallest sequence number, or the invalid sequence number when
/// `n` is zero.
fn nth_sequence_number(sequence_numbers: &mut [ListenSequenceNumber], n: usize) -> ListenSequenceNumber {
    if n == 0 || sequence_numbers.is_empty() {
        return INVALID_SEQUENCE_NUMBER;
    }
    sequence_numbers.sort_unstable();
    sequence_numbers[n.min(sequence_numbers.len()) - 1]
}
