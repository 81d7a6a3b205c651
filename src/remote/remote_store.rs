use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::constants::BATCH_ID_UNKNOWN;
use crate::core::TargetData;
use crate::error::{
    cancelled, internal_error, is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult,
};
use crate::model::{DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, User};
use crate::remote::connectivity::{ConnectivityMonitor, NetworkStatus};
use crate::remote::network::NetworkLayer;
use crate::remote::online_state_tracker::{OnlineState, OnlineStateTracker, ONLINE_STATE_TIMEOUT};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::streams::{ListenStream, WatchStreamDelegate, WriteResponse, WriteStream, WriteStreamDelegate};
use crate::remote::watch_change::{WatchChange, WatchTargetChangeState};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::{AsyncQueue, TimerId};

/// Batches buffered for the write stream. Only the oldest one is on the
/// wire; the next is sent once the backend acknowledges it.
const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    ConnectivityChange,
    IsSecondary,
    Shutdown,
}

/// Watch metadata seen by the aggregator: target data comes from the
/// targets this store listens to, remote keys from the syncer.
struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

type WatchStream = ListenStream<RemoteListenDelegate>;
type MutationStream = WriteStream<RemoteWriteDelegate>;

struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: Option<Arc<WatchStream>>,
    /// Set once the current watch stream reported open; cleared on close.
    watch_stream_open: bool,
    /// Bumped per started watch stream so callbacks of stopped streams are
    /// dropped.
    watch_generation: u64,
    watch_change_aggregator: Option<WatchChangeAggregator>,
    write_stream: Option<Arc<MutationStream>>,
    write_stream_open: bool,
    write_handshake_complete: bool,
    /// The head of `write_pipeline` was sent and awaits its result.
    write_in_flight: bool,
    write_generation: u64,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
}

impl Default for RemoteStoreState {
    fn default() -> Self {
        Self {
            listen_targets: BTreeMap::new(),
            watch_stream: None,
            watch_stream_open: false,
            watch_generation: 0,
            watch_change_aggregator: None,
            write_stream: None,
            write_stream_open: false,
            write_handshake_complete: false,
            write_in_flight: false,
            write_generation: 0,
            write_pipeline: VecDeque::new(),
            offline_causes: BTreeSet::new(),
            online_state_tracker: OnlineStateTracker::new(),
        }
    }
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && self.watch_stream.is_none() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && self.write_stream.is_none() && !self.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }
}

/// Keeps the backend informed of what the client listens to and what it
/// wrote, and feeds the backend's answers to the [`RemoteSyncer`].
///
/// Every method must run on the client's [`AsyncQueue`]. Stream callbacks are
/// re-enqueued there before they touch any state.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
        queue: AsyncQueue,
        remote_syncer: Weak<dyn RemoteSyncer>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let inner = Arc::new(RemoteStoreInner {
            state: Mutex::new(RemoteStoreState::default()),
            network_layer,
            serializer,
            queue,
            remote_syncer,
            connectivity,
        });

        let weak = Arc::downgrade(&inner);
        let queue = inner.queue.clone();
        inner.connectivity.add_callback(Arc::new(move |status| {
            let weak = weak.clone();
            queue.enqueue_and_forget(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_network_status(status).await;
                }
            });
        }));
        Self { inner }
    }

    /// Starts the streams that have work to do.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.inner.enable_network_internal().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Stops both streams. Views report `Offline` until re-enabled.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
            RemoteStoreInner::disable_network_internal(&mut state);
            state.online_state_tracker.set(OnlineState::Offline)
        };
        self.inner.broadcast_online_state(changed).await;
        Ok(())
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("remote store shutting down");
        let changed = {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
            RemoteStoreInner::disable_network_internal(&mut state);
            state.online_state_tracker.set(OnlineState::Unknown)
        };
        self.inner.connectivity.shutdown();
        self.inner.broadcast_online_state(changed).await;
        Ok(())
    }

    /// Only the primary client talks to the backend. A secondary keeps its
    /// listen targets so they are re-sent once it gains the lease.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.inner.state.lock().await.offline_causes.remove(&OfflineCause::IsSecondary);
            return self.inner.enable_network_internal().await;
        }
        let changed = {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::IsSecondary);
            RemoteStoreInner::disable_network_internal(&mut state);
            state.online_state_tracker.set(OnlineState::Unknown)
        };
        self.inner.broadcast_online_state(changed).await;
        Ok(())
    }

    /// Starts watching `target_data`. Listening to an already watched target
    /// is a no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target_data).await
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Pulls pending batches from the syncer into the write pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams around switching the syncer to `user`.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change(user).await
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state_tracker.state()
    }

    pub async fn is_watching(&self, target_id: TargetId) -> bool {
        self.inner.state.lock().await.listen_targets.contains_key(&target_id)
    }

    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    network_layer: NetworkLayer,
    serializer: JsonProtoSerializer,
    queue: AsyncQueue,
    remote_syncer: Weak<dyn RemoteSyncer>,
    connectivity: Arc<dyn ConnectivityMonitor>,
}

impl RemoteStoreInner {
    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.remote_syncer
            .upgrade()
            .ok_or_else(|| cancelled("The sync engine has been dropped"))
    }

    async fn broadcast_online_state(&self, changed: Option<OnlineState>) {
        let Some(online_state) = changed else {
            return;
        };
        if let Ok(syncer) = self.syncer() {
            syncer.apply_online_state_change(online_state).await;
        }
    }

    async fn enable_network_internal(self: &Arc<Self>) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.state.lock().await;
            if !state.can_use_network() {
                return Ok(());
            }
            if state.should_start_watch_stream() {
                self.start_watch_stream(&mut state)
            } else {
                state.online_state_tracker.set(OnlineState::Unknown)
            }
        };
        self.broadcast_online_state(changed).await;
        self.fill_write_pipeline().await
    }

    fn disable_network_internal(state: &mut RemoteStoreState) {
        if let Some(stream) = state.watch_stream.take() {
            stream.stop();
        }
        if let Some(stream) = state.write_stream.take() {
            stream.stop();
        }
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.write_stream_open = false;
        state.write_handshake_complete = false;
        state.write_in_flight = false;
        Self::clean_up_watch_stream_state(state);
    }

    fn clean_up_watch_stream_state(state: &mut RemoteStoreState) {
        state.watch_stream_open = false;
        state.watch_change_aggregator = None;
    }

    /// Starts a fresh watch stream and returns the online state change it
    /// caused.
    fn start_watch_stream(self: &Arc<Self>, state: &mut RemoteStoreState) -> Option<OnlineState> {
        state.watch_generation += 1;
        let delegate = Arc::new(RemoteListenDelegate {
            inner: Arc::downgrade(self),
            queue: self.queue.clone(),
            generation: state.watch_generation,
        });
        let stream = ListenStream::start(&self.network_layer, self.serializer.clone(), delegate);
        state.watch_stream = Some(Arc::new(stream));
        log::debug!("starting watch stream for {} targets", state.listen_targets.len());
        self.track_watch_stream_start(state)
    }

    fn track_watch_stream_start(self: &Arc<Self>, state: &mut RemoteStoreState) -> Option<OnlineState> {
        let weak = Arc::downgrade(self);
        let queue = self.queue.clone();
        state.online_state_tracker.handle_watch_stream_start(move || {
            queue.enqueue_after_delay(TimerId::OnlineStateTimeout, ONLINE_STATE_TIMEOUT, async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_online_state_timeout().await;
                }
            })
        })
    }

    async fn on_online_state_timeout(self: &Arc<Self>) {
        let changed = self.state.lock().await.online_state_tracker.handle_online_state_timeout();
        self.broadcast_online_state(changed).await;
    }

    async fn listen(self: &Arc<Self>, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        let changed = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target_data.clone());
            if state.should_start_watch_stream() {
                self.start_watch_stream(&mut state)
            } else {
                if state.watch_stream_open {
                    self.send_watch_request(&mut state, target_data).await;
                }
                None
            }
        };
        self.broadcast_online_state(changed).await;
        Ok(())
    }

    async fn unlisten(self: &Arc<Self>, target_id: TargetId) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.state.lock().await;
            if state.listen_targets.remove(&target_id).is_none() {
                log::debug!("unlisten for target {target_id} that is not watched");
                return Ok(());
            }
            if state.watch_stream_open {
                Self::send_unwatch_request(&mut state, target_id).await;
            }
            if state.listen_targets.is_empty() {
                if let Some(stream) = state.watch_stream.take() {
                    log::debug!("stopping watch stream without targets");
                    stream.stop();
                }
                Self::clean_up_watch_stream_state(&mut state);
                if state.can_use_network() {
                    state.online_state_tracker.set(OnlineState::Unknown)
                } else {
                    None
                }
            } else {
                None
            }
        };
        self.broadcast_online_state(changed).await;
        Ok(())
    }

    /// Sends `addTarget` for `target_data`. A resumed target carries the
    /// number of documents the client believes match so the backend can
    /// verify it with an existence filter.
    async fn send_watch_request(&self, state: &mut RemoteStoreState, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let target_data = if !target_data.resume_token.is_empty() || target_data.snapshot_version > SnapshotVersion::min()
        {
            let expected_count = self
                .syncer()
                .map(|syncer| syncer.remote_keys_for_target(target_id).len() as i32)
                .ok();
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        if let Some(stream) = state.watch_stream.clone() {
            if let Err(err) = stream.watch(&target_data).await {
                log::debug!("failed to send watch request for target {target_id}: {err}");
            }
        }
    }

    async fn send_unwatch_request(state: &mut RemoteStoreState, target_id: TargetId) {
        if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if let Some(stream) = state.watch_stream.clone() {
            if let Err(err) = stream.unwatch(target_id).await {
                log::debug!("failed to send unwatch request for target {target_id}: {err}");
            }
        }
    }

    async fn on_watch_stream_open(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.watch_stream_open = true;
        state.watch_change_aggregator = Some(WatchChangeAggregator::new(self.serializer.database_id().clone()));
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        log::debug!("watch stream open, sending {} targets", targets.len());
        for target_data in targets {
            self.send_watch_request(&mut state, target_data).await;
        }
    }

    async fn on_watch_stream_change(
        self: &Arc<Self>,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        // Any message proves the backend reachable.
        let changed = self.state.lock().await.online_state_tracker.set(OnlineState::Online);
        self.broadcast_online_state(changed).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = target_change.cause.clone() {
                    return self.handle_target_error(&syncer, &target_change.target_ids, cause).await;
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            let RemoteStoreState {
                watch_change_aggregator,
                listen_targets,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenTargetMetadata {
                listen_targets: &*listen_targets,
                syncer: syncer.as_ref(),
            };
            match change {
                WatchChange::Document(document_change) => aggregator.handle_document_change(&metadata, document_change),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&metadata, &filter),
                WatchChange::TargetChange(target_change) => aggregator.handle_target_change(&metadata, &target_change),
            }
        }

        if snapshot_version.is_min() {
            return Ok(());
        }
        let last_remote_snapshot_version = syncer.last_remote_snapshot_version()?;
        if snapshot_version >= last_remote_snapshot_version {
            self.raise_watch_snapshot(&syncer, snapshot_version).await?;
        } else {
            log::debug!(
                "ignoring outdated watch snapshot {snapshot_version:?}, already at {last_remote_snapshot_version:?}"
            );
        }
        Ok(())
    }

    /// Turns everything aggregated so far into a remote event, re-listens to
    /// targets whose existence filter did not match, and hands the event to
    /// the syncer.
    async fn raise_watch_snapshot(
        self: &Arc<Self>,
        syncer: &Arc<dyn RemoteSyncer>,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let event = {
            let mut state = self.state.lock().await;
            let RemoteStoreState {
                watch_change_aggregator,
                listen_targets,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenTargetMetadata {
                listen_targets: &*listen_targets,
                syncer: syncer.as_ref(),
            };
            let event = aggregator.create_remote_event(&metadata, snapshot_version);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = listen_targets.remove(target_id) {
                    listen_targets.insert(
                        *target_id,
                        target_data.with_resume_token(change.resume_token.clone(), snapshot_version),
                    );
                }
            }

            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = state.listen_targets.remove(target_id) else {
                    continue;
                };
                // Drop the resume token so the re-listen is a full query.
                let snapshot = target_data.snapshot_version;
                let cleared = target_data.with_resume_token(Vec::new(), snapshot);
                let request = TargetData::new(cleared.target.clone(), *target_id, *purpose, cleared.sequence_number);
                state.listen_targets.insert(*target_id, cleared);
                log::debug!("re-listening to target {target_id} after an existence filter mismatch ({purpose:?})");
                Self::send_unwatch_request(&mut state, *target_id).await;
                self.send_watch_request(&mut state, request).await;
            }
            event
        };
        syncer.apply_remote_event(event).await
    }

    async fn handle_target_error(
        self: &Arc<Self>,
        syncer: &Arc<dyn RemoteSyncer>,
        target_ids: &[TargetId],
        cause: FirestoreError,
    ) -> FirestoreResult<()> {
        for target_id in target_ids {
            let removed = {
                let mut state = self.state.lock().await;
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if removed {
                log::debug!("target {target_id} rejected by the backend: {cause}");
                syncer.reject_listen(*target_id, cause.clone()).await?;
            }
        }
        Ok(())
    }

    async fn on_watch_stream_close(self: &Arc<Self>, error: Option<FirestoreError>) {
        let changed = {
            let mut state = self.state.lock().await;
            Self::clean_up_watch_stream_state(&mut state);
            if state.can_use_network() && !state.listen_targets.is_empty() {
                // The persistent stream reconnects on its own after backoff.
                let failed = error
                    .as_ref()
                    .and_then(|error| state.online_state_tracker.handle_watch_stream_failure(error));
                let restarted = self.track_watch_stream_start(&mut state);
                restarted.or(failed)
            } else {
                if let Some(stream) = state.watch_stream.take() {
                    stream.stop();
                }
                state.online_state_tracker.set(OnlineState::Unknown)
            }
        };
        if let Some(error) = &error {
            log::debug!("watch stream closed: {error}");
        }
        self.broadcast_online_state(changed).await;
    }

    fn start_write_stream(self: &Arc<Self>, state: &mut RemoteStoreState) {
        state.write_generation += 1;
        let delegate = Arc::new(RemoteWriteDelegate {
            inner: Arc::downgrade(self),
            queue: self.queue.clone(),
            generation: state.write_generation,
        });
        let stream = WriteStream::start(&self.network_layer, self.serializer.clone(), delegate);
        state.write_stream = Some(Arc::new(stream));
        state.write_stream_open = false;
        state.write_handshake_complete = false;
        state.write_in_flight = false;
        log::debug!("starting write stream with {} pending writes", state.write_pipeline.len());
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        let mut state = self.state.lock().await;
        let mut last_batch_id = state
            .write_pipeline
            .back()
            .map(MutationBatch::batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);
        while state.can_add_to_write_pipeline() {
            let Some(batch) = syncer.next_mutation_batch(last_batch_id)? else {
                break;
            };
            last_batch_id = batch.batch_id();
            state.write_pipeline.push_back(batch);
        }
        Self::send_next_write(&mut state).await;
        if state.should_start_write_stream() {
            self.start_write_stream(&mut state);
        }
        Ok(())
    }

    /// Sends the head of the pipeline unless a batch already awaits its
    /// result or the handshake has not completed.
    async fn send_next_write(state: &mut RemoteStoreState) {
        if state.write_in_flight || !state.write_stream_open || !state.write_handshake_complete {
            return;
        }
        let (Some(stream), Some(batch)) = (state.write_stream.clone(), state.write_pipeline.front()) else {
            return;
        };
        match stream.write_mutations(batch.mutations()).await {
            Ok(()) => state.write_in_flight = true,
            Err(err) => log::debug!("failed to send batch {}: {err}", batch.batch_id()),
        }
    }

    async fn on_write_stream_open(self: &Arc<Self>) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        let stream_token = syncer.last_stream_token()?;
        let stream = {
            let mut state = self.state.lock().await;
            state.write_stream_open = true;
            state.write_handshake_complete = false;
            state.write_in_flight = false;
            state.write_stream.clone()
        };
        if let Some(stream) = stream {
            if let Err(err) = stream.write_handshake(stream_token).await {
                log::debug!("failed to send write handshake: {err}");
            }
        }
        Ok(())
    }

    async fn on_write_handshake_complete(self: &Arc<Self>, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.syncer()?.set_last_stream_token(stream_token)?;
        let mut state = self.state.lock().await;
        state.write_handshake_complete = true;
        Self::send_next_write(&mut state).await;
        Ok(())
    }

    async fn on_mutation_result(self: &Arc<Self>, response: WriteResponse) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        let batch = {
            let mut state = self.state.lock().await;
            state.write_in_flight = false;
            state
                .write_pipeline
                .pop_front()
                .ok_or_else(|| internal_error("Got a write result without a pending batch"))?
        };
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        )?;
        syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(self: &Arc<Self>, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let handshake_complete = {
            let mut state = self.state.lock().await;
            state.write_stream_open = false;
            state.write_in_flight = false;
            std::mem::replace(&mut state.write_handshake_complete, false)
        };

        if let Some(error) = error {
            let pipeline_empty = self.state.lock().await.write_pipeline.is_empty();
            if !pipeline_empty {
                if handshake_complete {
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_handshake_error(&error)?;
                }
            }
        }

        let mut state = self.state.lock().await;
        if state.write_pipeline.is_empty() {
            // Nothing left to send; a new stream starts with the next write.
            if let Some(stream) = state.write_stream.take() {
                stream.stop();
            }
        }
        Ok(())
    }

    async fn handle_write_error(self: &Arc<Self>, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            log::debug!("write stream failed with a retryable error: {error}");
            return Ok(());
        }
        let batch = {
            let mut state = self.state.lock().await;
            if let Some(stream) = &state.write_stream {
                // The batch is gone, so retry the rest right away.
                stream.inhibit_backoff();
            }
            state.write_pipeline.pop_front()
        };
        let Some(batch) = batch else {
            return Ok(());
        };
        log::debug!("batch {} permanently rejected: {error}", batch.batch_id());
        self.syncer()?.reject_failed_write(batch.batch_id(), error).await?;
        self.fill_write_pipeline().await
    }

    fn handle_handshake_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if is_permanent_error(error.code) {
            log::debug!("write handshake failed permanently, resetting stream token: {error}");
            self.syncer()?.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }

    async fn handle_credential_change(self: &Arc<Self>, user: User) -> FirestoreResult<()> {
        log::debug!("restarting streams for a credential change");
        let changed = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::CredentialChange);
            Self::disable_network_internal(&mut state);
            state.online_state_tracker.set(OnlineState::Unknown)
        };
        self.broadcast_online_state(changed).await;
        self.syncer()?.handle_credential_change(user).await?;
        self.state.lock().await.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await
    }

    async fn on_network_status(self: &Arc<Self>, status: NetworkStatus) {
        if status != NetworkStatus::Available {
            log::debug!("network reported unavailable");
            return;
        }
        let changed = {
            let mut state = self.state.lock().await;
            if !state.can_use_network() {
                return;
            }
            log::debug!("restarting streams for a network reachability change");
            state.offline_causes.insert(OfflineCause::ConnectivityChange);
            Self::disable_network_internal(&mut state);
            state.offline_causes.remove(&OfflineCause::ConnectivityChange);
            state.online_state_tracker.set(OnlineState::Unknown)
        };
        self.broadcast_online_state(changed).await;
        if let Err(err) = self.enable_network_internal().await {
            log::warn!("failed to restart streams after a network change: {err}");
        }
    }

    async fn is_current_watch(&self, generation: u64) -> bool {
        let state = self.state.lock().await;
        state.watch_generation == generation && state.watch_stream.is_some()
    }

    async fn is_current_write(&self, generation: u64) -> bool {
        let state = self.state.lock().await;
        state.write_generation == generation && state.write_stream.is_some()
    }
}

/// Moves listen stream callbacks onto the queue.
struct RemoteListenDelegate {
    inner: Weak<RemoteStoreInner>,
    queue: AsyncQueue,
    generation: u64,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamDelegate for RemoteListenDelegate {
    async fn on_watch_stream_open(&self) {
        let inner = self.inner.clone();
        let generation = self.generation;
        let _ = self
            .queue
            .enqueue(async move {
                if let Some(inner) = inner.upgrade() {
                    if inner.is_current_watch(generation).await {
                        inner.on_watch_stream_open().await;
                    }
                }
                Ok(())
            })
            .await;
    }

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let inner = self.inner.clone();
        let generation = self.generation;
        self.queue
            .enqueue(async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(());
                };
                if !inner.is_current_watch(generation).await {
                    return Ok(());
                }
                inner.on_watch_stream_change(change, snapshot_version).await
            })
            .await
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) {
        let inner = self.inner.clone();
        let generation = self.generation;
        let _ = self
            .queue
            .enqueue(async move {
                if let Some(inner) = inner.upgrade() {
                    if inner.is_current_watch(generation).await {
                        inner.on_watch_stream_close(error).await;
                    }
                }
                Ok(())
            })
            .await;
    }
}

/// Moves write stream callbacks onto the queue.
struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
    queue: AsyncQueue,
    generation: u64,
}

impl RemoteWriteDelegate {
    async fn run<F, Fut>(&self, op: F) -> FirestoreResult<()>
    where
        F: FnOnce(Arc<RemoteStoreInner>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let generation = self.generation;
        self.queue
            .enqueue(async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(());
                };
                if !inner.is_current_write(generation).await {
                    return Ok(());
                }
                op(inner).await
            })
            .await
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_write_stream_open(&self) {
        if let Err(err) = self.run(|inner| async move { inner.on_write_stream_open().await }).await {
            log::debug!("write stream open failed: {err}");
        }
    }

    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.run(|inner| async move { inner.on_write_handshake_complete(stream_token).await })
            .await
    }

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        self.run(|inner| async move { inner.on_mutation_result(response).await })
            .await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>, _handshake_complete: bool) {
        if let Err(err) = self.run(|inner| async move { inner.on_write_stream_close(error).await }).await {
            log::debug!("write stream close handling failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Query, TargetPurpose};
    use crate::error::{invalid_argument, FirestoreErrorCode};
    use crate::model::{BatchId, DatabaseId, DocumentKey, Mutation, Precondition, ResourcePath, Timestamp};
    use crate::platform::runtime;
    use crate::remote::connectivity::ManualConnectivityMonitor;
    use crate::remote::datastore::{NoopTokenProvider, StreamingDatastore, StreamingDatastoreImpl, TokenProviderArc};
    use crate::remote::remote_event::RemoteEvent;
    use crate::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamKind};
    use crate::util::RetrySettings;
    use serde_json::{json, Value as JsonValue};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSyncer {
        events: StdMutex<Vec<RemoteEvent>>,
        rejected_listens: StdMutex<Vec<(TargetId, FirestoreErrorCode)>>,
        acknowledged: StdMutex<Vec<MutationBatchResult>>,
        rejected_writes: StdMutex<Vec<(BatchId, FirestoreErrorCode)>>,
        batches: StdMutex<Vec<MutationBatch>>,
        remote_keys: StdMutex<BTreeMap<TargetId, DocumentKeySet>>,
        stream_token: StdMutex<Vec<u8>>,
        online_states: StdMutex<Vec<OnlineState>>,
    }

    impl RemoteSyncer for FakeSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.events.lock().unwrap().push(event);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.rejected_listens.lock().unwrap().push((target_id, error.code));
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            let batch_id = result.batch.batch_id();
            self.batches.lock().unwrap().retain(|batch| batch.batch_id() != batch_id);
            *self.stream_token.lock().unwrap() = result.stream_token.clone();
            self.acknowledged.lock().unwrap().push(result);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_failed_write(
            &self,
            batch_id: BatchId,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.batches.lock().unwrap().retain(|batch| batch.batch_id() != batch_id);
            self.rejected_writes.lock().unwrap().push((batch_id, error.code));
            box_remote_store_future(async { Ok(()) })
        }

        fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys.lock().unwrap().get(&target_id).cloned().unwrap_or_default()
        }

        fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
            Ok(self
                .batches
                .lock()
                .unwrap()
                .iter()
                .find(|batch| batch.batch_id() > after_batch_id)
                .cloned())
        }

        fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .last()
                .map(|event| event.snapshot_version)
                .unwrap_or_default())
        }

        fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
            Ok(self.stream_token.lock().unwrap().clone())
        }

        fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
            *self.stream_token.lock().unwrap() = stream_token;
            Ok(())
        }

        fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()> {
            self.online_states.lock().unwrap().push(online_state);
            box_remote_store_future(async {})
        }

        fn handle_credential_change(&self, _user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async { Ok(()) })
        }
    }

    struct Harness {
        queue: AsyncQueue,
        store: RemoteStore,
        syncer: Arc<FakeSyncer>,
        server: MultiplexedConnection,
        connectivity: Arc<ManualConnectivityMonitor>,
    }

    fn setup() -> Harness {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::new(left_transport));
        let server = MultiplexedConnection::new(right_transport);
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(client));
        let layer = NetworkLayer::builder(datastore, Arc::new(NoopTokenProvider) as TokenProviderArc)
            .with_retry(RetrySettings::default().with_initial_delay(Duration::from_millis(5)))
            .build();
        let queue = AsyncQueue::new();
        let syncer = Arc::new(FakeSyncer::default());
        let weak: Weak<FakeSyncer> = Arc::downgrade(&syncer);
        let weak: Weak<dyn RemoteSyncer> = weak;
        let connectivity = ManualConnectivityMonitor::new();
        let store = RemoteStore::new(
            layer,
            JsonProtoSerializer::new(DatabaseId::new("project", "(default)")),
            queue.clone(),
            weak,
            Arc::clone(&connectivity) as Arc<dyn ConnectivityMonitor>,
        );
        Harness {
            queue,
            store,
            syncer,
            server,
            connectivity,
        }
    }

    impl Harness {
        async fn run<F, Fut>(&self, op: F)
        where
            F: FnOnce(RemoteStore) -> Fut,
            Fut: std::future::Future<Output = FirestoreResult<()>> + Send + 'static,
        {
            self.queue.enqueue(op(self.store.clone())).await.expect("queue op");
        }

        async fn accept(&self, expected: StreamKind) -> MultiplexedStream {
            let (kind, stream) = self.server.accept_stream().await.expect("peer stream");
            assert_eq!(kind, expected);
            stream
        }
    }

    async fn spin_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_json(stream: &MultiplexedStream) -> JsonValue {
        serde_json::from_slice(&stream.next().await.expect("frame").expect("payload")).expect("json")
    }

    async fn send_json(stream: &MultiplexedStream, value: JsonValue) {
        stream.send(serde_json::to_vec(&value).unwrap()).await.expect("send");
    }

    fn target_data(target_id: TargetId, collection: &str) -> TargetData {
        let query = Query::new(ResourcePath::from_string(collection).unwrap());
        TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, 1)
    }

    fn document_json(path: &str, seconds: i64) -> JsonValue {
        json!({
            "name": format!("projects/project/databases/(default)/documents/{path}"),
            "fields": { "n": { "integerValue": "1" } },
            "updateTime": format!("1970-01-01T00:00:0{seconds}Z"),
        })
    }

    #[tokio::test]
    async fn listen_sends_targets_on_open_and_raises_snapshots() {
        let harness = setup();
        harness.run(|store| async move { store.listen(target_data(2, "rooms")).await }).await;
        let peer = harness.accept(StreamKind::Listen).await;

        let request = next_json(&peer).await;
        assert_eq!(request["addTarget"]["targetId"], json!(2));
        assert!(request["addTarget"].get("expectedCount").is_none());

        send_json(&peer, json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } })).await;
        send_json(
            &peer,
            json!({ "documentChange": { "document": document_json("rooms/a", 1), "targetIds": [2] } }),
        )
        .await;
        send_json(
            &peer,
            json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "AQ==" } }),
        )
        .await;
        send_json(&peer, json!({ "targetChange": { "readTime": "1970-01-01T00:00:02Z" } })).await;

        let syncer = Arc::clone(&harness.syncer);
        spin_until(|| !syncer.events.lock().unwrap().is_empty()).await;
        let events = syncer.events.lock().unwrap();
        let event = &events[0];
        assert_eq!(event.snapshot_version, SnapshotVersion::from_micros(2_000_000));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![1]);
        assert!(change
            .added_documents
            .contains(&DocumentKey::from_string("rooms/a").unwrap()));
        drop(events);
        assert_eq!(harness.store.online_state().await, OnlineState::Online);
    }

    #[tokio::test]
    async fn rejected_target_is_removed_and_reported() {
        let harness = setup();
        harness.run(|store| async move { store.listen(target_data(4, "secret")).await }).await;
        let peer = harness.accept(StreamKind::Listen).await;
        next_json(&peer).await;

        send_json(
            &peer,
            json!({ "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            } }),
        )
        .await;

        let syncer = Arc::clone(&harness.syncer);
        spin_until(|| !syncer.rejected_listens.lock().unwrap().is_empty()).await;
        assert_eq!(
            syncer.rejected_listens.lock().unwrap()[0],
            (4, FirestoreErrorCode::PermissionDenied)
        );
        assert!(!harness.store.is_watching(4).await);
    }

    #[tokio::test]
    async fn existence_filter_mismatch_relistens_without_resume_token() {
        let harness = setup();
        let resumed = target_data(6, "rooms").with_resume_token(vec![7], SnapshotVersion::from_micros(1_000_000));
        harness.syncer.remote_keys.lock().unwrap().insert(
            6,
            [
                DocumentKey::from_string("rooms/a").unwrap(),
                DocumentKey::from_string("rooms/b").unwrap(),
            ]
            .into_iter()
            .collect(),
        );
        harness.run(|store| async move { store.listen(resumed).await }).await;
        let peer = harness.accept(StreamKind::Listen).await;

        let request = next_json(&peer).await;
        assert_eq!(request["addTarget"]["resumeToken"], json!("Bw=="));
        assert_eq!(request["addTarget"]["expectedCount"], json!(2));

        send_json(&peer, json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [6] } })).await;
        send_json(&peer, json!({ "filter": { "targetId": 6, "count": 1 } })).await;
        send_json(&peer, json!({ "targetChange": { "readTime": "1970-01-01T00:00:03Z" } })).await;

        let unwatch = next_json(&peer).await;
        assert_eq!(unwatch["removeTarget"], json!(6));
        let rewatch = next_json(&peer).await;
        assert_eq!(rewatch["addTarget"]["targetId"], json!(6));
        assert!(rewatch["addTarget"].get("resumeToken").is_none());
        assert_eq!(rewatch["labels"], json!({ "goog-listen-tags": "existence-filter-mismatch" }));

        let syncer = Arc::clone(&harness.syncer);
        spin_until(|| !syncer.events.lock().unwrap().is_empty()).await;
        let events = syncer.events.lock().unwrap();
        assert_eq!(
            events[0].target_mismatches.get(&6),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
    }

    fn batch(batch_id: BatchId, path: &str) -> MutationBatch {
        MutationBatch::new(
            batch_id,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::delete(DocumentKey::from_string(path).unwrap(), Precondition::None)],
        )
    }

    async fn frame_within(stream: &MultiplexedStream, wait: Duration) -> Option<JsonValue> {
        let frame = Box::pin(next_json(stream));
        let timer = Box::pin(runtime::sleep(wait));
        match futures::future::select(frame, timer).await {
            futures::future::Either::Left((value, _)) => Some(value),
            futures::future::Either::Right(_) => None,
        }
    }

    fn ack(token: &str) -> JsonValue {
        json!({ "streamToken": token, "commitTime": "1970-01-01T00:00:04Z", "writeResults": [{}] })
    }

    #[tokio::test]
    async fn next_batch_is_sent_only_after_the_previous_ack() {
        let harness = setup();
        harness.syncer.batches.lock().unwrap().extend([batch(1, "rooms/a"), batch(2, "rooms/b")]);
        *harness.syncer.stream_token.lock().unwrap() = vec![5];
        harness.run(|store| async move { store.fill_write_pipeline().await }).await;
        assert_eq!(harness.store.pending_write_count().await, 2);
        let peer = harness.accept(StreamKind::Write).await;

        let handshake = next_json(&peer).await;
        assert_eq!(handshake["streamToken"], json!("BQ=="));
        send_json(&peer, json!({ "streamToken": "Bg==" })).await;

        let first = next_json(&peer).await;
        assert_eq!(first["streamToken"], json!("Bg=="));
        assert_eq!(first["writes"][0]["delete"], json!("projects/project/databases/(default)/documents/rooms/a"));
        // Batch 2 stays queued while batch 1 awaits its result.
        assert_eq!(frame_within(&peer, Duration::from_millis(200)).await, None);

        send_json(&peer, ack("Bw==")).await;
        let second = next_json(&peer).await;
        assert_eq!(second["streamToken"], json!("Bw=="));
        assert_eq!(second["writes"][0]["delete"], json!("projects/project/databases/(default)/documents/rooms/b"));
        send_json(&peer, ack("CA==")).await;

        let syncer = Arc::clone(&harness.syncer);
        spin_until(|| syncer.acknowledged.lock().unwrap().len() == 2).await;
        let acknowledged = syncer.acknowledged.lock().unwrap();
        assert_eq!(acknowledged[0].batch.batch_id(), 1);
        assert_eq!(acknowledged[1].batch.batch_id(), 2);
        assert_eq!(acknowledged[1].stream_token, vec![8]);
        assert_eq!(acknowledged[0].commit_version, SnapshotVersion::from_micros(4_000_000));
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_the_head_batch() {
        let harness = setup();
        harness.syncer.batches.lock().unwrap().push(batch(1, "rooms/a"));
        harness.run(|store| async move { store.fill_write_pipeline().await }).await;
        let peer = harness.accept(StreamKind::Write).await;
        next_json(&peer).await;
        send_json(&peer, json!({ "streamToken": "AQ==" })).await;
        next_json(&peer).await;

        peer.fail(invalid_argument("bad write")).await.unwrap();

        let syncer = Arc::clone(&harness.syncer);
        spin_until(|| !syncer.rejected_writes.lock().unwrap().is_empty()).await;
        assert_eq!(
            syncer.rejected_writes.lock().unwrap()[0],
            (1, FirestoreErrorCode::InvalidArgument)
        );
        harness.queue.drain().await.unwrap();
        assert_eq!(harness.store.pending_write_count().await, 0);
    }

    #[tokio::test]
    async fn disable_network_reports_offline_and_enable_restarts_watch() {
        let harness = setup();
        harness.run(|store| async move { store.listen(target_data(2, "rooms")).await }).await;
        let _first = harness.accept(StreamKind::Listen).await;

        harness.run(|store| async move { store.disable_network().await }).await;
        assert_eq!(harness.store.online_state().await, OnlineState::Offline);
        assert!(!harness.store.can_use_network().await);

        harness.run(|store| async move { store.enable_network().await }).await;
        let second = harness.accept(StreamKind::Listen).await;
        let request = next_json(&second).await;
        assert_eq!(request["addTarget"]["targetId"], json!(2));
        assert!(harness
            .syncer
            .online_states
            .lock()
            .unwrap()
            .contains(&OnlineState::Offline));
    }

    #[tokio::test]
    async fn network_available_restarts_streams() {
        let harness = setup();
        harness.run(|store| async move { store.listen(target_data(2, "rooms")).await }).await;
        let _first = harness.accept(StreamKind::Listen).await;

        harness.connectivity.set_status(NetworkStatus::Available);
        let second = harness.accept(StreamKind::Listen).await;
        let request = next_json(&second).await;
        assert_eq!(request["addTarget"]["targetId"], json!(2));
    }

    #[tokio::test]
    async fn unanswered_connection_times_out_to_offline() {
        let harness = setup();
        harness.run(|store| async move { store.listen(target_data(2, "rooms")).await }).await;
        assert!(harness.queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        harness.queue.run_delayed_operations_early(TimerId::OnlineStateTimeout);
        let syncer = Arc::clone(&harness.syncer);
        spin_until(|| syncer.online_states.lock().unwrap().contains(&OnlineState::Offline)).await;
        assert_eq!(harness.store.online_state().await, OnlineState::Offline);
    }
}
