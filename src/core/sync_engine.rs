use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::constants::{BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER};
use crate::core::query::Query;
use crate::core::target_data::{TargetData, TargetPurpose};
use crate::core::target_id_generator::TargetIdGenerator;
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{cancelled, internal_error, is_primary_lease_lost, FirestoreError, FirestoreResult};
use crate::local::{BatchState, LocalStore, LocalViewChanges, LruResults, Persistence, ReferenceSet};
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, FieldIndex, MutableDocument, MutableDocumentMap, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, TargetId, User,
};
use crate::remote::{
    box_remote_store_future, ConnectivityMonitor, JsonProtoSerializer, NetworkLayer, OnlineState, RemoteEvent,
    RemoteStore, RemoteStoreFuture, RemoteSyncer, TargetChange,
};
use crate::util::{hard_assert, AsyncQueue};

/// Completion of a write, or of a wait for pending writes.
pub type WriteCallback = Box<dyn FnOnce(FirestoreResult<()>) + Send>;

/// Receives what the sync engine produces for listeners.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected `query`; its listeners are done.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Shared state of the sync engine and the remote store, passed in at
/// construction.
pub struct SyncEngineConfig {
    pub network_layer: NetworkLayer,
    pub serializer: JsonProtoSerializer,
    pub queue: AsyncQueue,
    pub connectivity: Arc<dyn ConnectivityMonitor>,
    pub max_concurrent_limbo_resolutions: usize,
    /// Whether this client starts out holding the primary lease.
    pub is_primary: bool,
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A single-document target resolving one document in limbo.
struct LimboResolution {
    key: DocumentKey,
    /// The backend sent the document at least once and has not removed it
    /// since.
    received_document: bool,
}

enum RemoteCommand {
    Listen(TargetData),
    Unlisten(TargetId),
}

/// Work collected while the state lock is held and carried out after it is
/// released.
#[derive(Default)]
struct Effects {
    remote: Vec<RemoteCommand>,
    snapshots: Vec<ViewSnapshot>,
    errors: Vec<(Query, FirestoreError)>,
    online_state: Option<OnlineState>,
    callbacks: Vec<(WriteCallback, FirestoreResult<()>)>,
}

impl Effects {
    fn listen(&mut self, target_data: TargetData) {
        self.remote.push(RemoteCommand::Listen(target_data));
    }

    fn unlisten(&mut self, target_id: TargetId) {
        self.remote.push(RemoteCommand::Unlisten(target_id));
    }

    fn complete(&mut self, callback: WriteCallback, result: FirestoreResult<()>) {
        self.callbacks.push((callback, result));
    }
}

struct SyncEngineState {
    local_store: LocalStore,
    current_user: User,
    is_primary: bool,
    online_state: OnlineState,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which view targets keep each limbo document alive.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    write_callbacks: BTreeMap<BatchId, WriteCallback>,
    /// Waiters keyed by the highest batch pending when they registered.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
}

/// Connects the local store, the remote store and the views of active
/// queries.
///
/// All state sits behind one lock that is never held across an await; work
/// on the remote store and listener notifications happen after it is
/// released. Every method must run on the client's [`AsyncQueue`].
pub struct SyncEngine {
    state: Mutex<SyncEngineState>,
    remote_store: RemoteStore,
    listener: Arc<dyn SyncEngineListener>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, listener: Arc<dyn SyncEngineListener>, config: SyncEngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SyncEngine>| {
            let syncer: Weak<dyn RemoteSyncer> = weak.clone();
            let remote_store = RemoteStore::new(
                config.network_layer,
                config.serializer,
                config.queue,
                syncer,
                config.connectivity,
            );
            Self {
                state: Mutex::new(SyncEngineState {
                    current_user: local_store.user().clone(),
                    local_store,
                    is_primary: config.is_primary,
                    online_state: OnlineState::Unknown,
                    query_views: BTreeMap::new(),
                    queries_by_target: BTreeMap::new(),
                    enqueued_limbo_resolutions: VecDeque::new(),
                    active_limbo_targets_by_key: BTreeMap::new(),
                    active_limbo_resolutions_by_target: BTreeMap::new(),
                    limbo_document_refs: ReferenceSet::new(),
                    limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                    max_concurrent_limbo_resolutions: config.max_concurrent_limbo_resolutions,
                    write_callbacks: BTreeMap::new(),
                    pending_writes_callbacks: BTreeMap::new(),
                }),
                remote_store,
                listener,
            }
        })
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn is_primary(&self) -> bool {
        self.lock_state().is_primary
    }

    pub fn current_user(&self) -> User {
        self.lock_state().current_user.clone()
    }

    pub fn persistence(&self) -> Arc<Persistence> {
        Arc::clone(self.lock_state().local_store.persistence())
    }

    /// Starts listening to `query` and returns its first view snapshot,
    /// computed from the local cache alone.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let mut effects = Effects::default();
        let snapshot = self.lock_state().listen(query, &mut effects)?;
        self.dispatch(effects).await?;
        Ok(snapshot)
    }

    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        self.lock_state().unlisten(query, &mut effects)?;
        self.dispatch(effects).await
    }

    /// Applies `mutations` locally as one batch and queues it for the
    /// backend. `callback` completes once the backend accepts or rejects the
    /// batch, or right away if it cannot be written locally.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.lock_state();
            match state.local_store.write_locally(mutations) {
                Ok(result) => {
                    log::debug!("queued local write batch {}", result.batch_id);
                    state.write_callbacks.insert(result.batch_id, callback);
                    state.emit_new_snapshots(&result.changes, None, &mut effects)?;
                }
                Err(err) => {
                    log::warn!("failed to persist write: {err}");
                    effects.complete(callback, Err(err));
                }
            }
        }
        self.dispatch(effects).await?;
        self.remote_store.fill_write_pipeline().await
    }

    /// Completes `callback` once every batch pending now has been
    /// acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) -> FirestoreResult<()> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "the network is disabled; waiting for pending writes will not complete until it is enabled"
            );
        }
        let mut effects = Effects::default();
        {
            let mut state = self.lock_state();
            let highest_batch_id = state.local_store.highest_unacknowledged_batch_id()?;
            if highest_batch_id == BATCH_ID_UNKNOWN {
                effects.complete(callback, Ok(()));
            } else {
                state
                    .pending_writes_callbacks
                    .entry(highest_batch_id)
                    .or_default()
                    .push(callback);
            }
        }
        self.dispatch(effects).await
    }

    /// Reads `key` through the local view of documents.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.lock_state().local_store.read_document(key)
    }

    /// Runs `query` against the local cache only and returns the result as
    /// a snapshot marked as coming from cache.
    pub fn execute_query_from_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let mut state = self.lock_state();
        let result = state.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        view.apply_changes(doc_changes, false, None, false)
            .snapshot
            .ok_or_else(|| internal_error("first view change did not produce a snapshot"))
    }

    /// Switches between primary and secondary. Only the primary uses the
    /// network and resolves limbo documents.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.lock_state();
            if state.is_primary == is_primary {
                return Ok(());
            }
            state.is_primary = is_primary;
            if is_primary {
                log::debug!("client became primary; restoring {} targets", state.queries_by_target.len());
                state.synchronize_views(true, &mut effects)?;
                let targets: Vec<TargetId> = state.queries_by_target.keys().copied().collect();
                for target_id in targets {
                    if let Some(target_data) = state.local_store.active_target_data(target_id) {
                        effects.listen(target_data.clone());
                    }
                }
            } else {
                log::debug!("client became secondary; releasing limbo resolutions");
                state.reset_limbo_documents(&mut effects);
                state.synchronize_views(false, &mut effects)?;
            }
        }
        self.dispatch(effects).await?;
        self.remote_store.apply_primary_state(is_primary).await
    }

    /// Refresh of a secondary client: recomputes every view from shared
    /// persistence and completes writes whose outcome the primary recorded.
    pub async fn synchronize_with_persisted_state(&self) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.lock_state();
            if state.is_primary {
                return Ok(());
            }
            state.synchronize_views(false, &mut effects)?;
            state.resolve_persisted_batch_states(&mut effects)?;
        }
        self.dispatch(effects).await
    }

    pub fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        self.lock_state().local_store.collect_garbage()
    }

    pub fn backfill_indexes(&self) -> FirestoreResult<usize> {
        self.lock_state().local_store.backfill_indexes()
    }

    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.lock_state().local_store.configure_field_indexes(indexes)
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.lock_state().local_store.set_index_auto_creation_enabled(enabled);
    }

    pub fn active_limbo_document_keys(&self) -> DocumentKeySet {
        self.lock_state().active_limbo_targets_by_key.keys().cloned().collect()
    }

    pub fn enqueued_limbo_document_keys(&self) -> Vec<DocumentKey> {
        self.lock_state().enqueued_limbo_resolutions.iter().cloned().collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, effects: Effects) -> FirestoreResult<()> {
        let Effects {
            remote,
            snapshots,
            errors,
            online_state,
            callbacks,
        } = effects;
        if let Some(online_state) = online_state {
            self.listener.on_online_state_change(online_state);
        }
        if !snapshots.is_empty() {
            self.listener.on_watch_change(snapshots);
        }
        for (query, error) in errors {
            self.listener.on_watch_error(&query, error);
        }
        for (callback, result) in callbacks {
            callback(result);
        }
        for command in remote {
            match command {
                RemoteCommand::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteCommand::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    async fn apply_remote_event_impl(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        let applied = self.lock_state().apply_remote_event(&event, &mut effects);
        ignore_if_primary_lease_loss(applied)?;
        self.dispatch(effects).await
    }

    async fn reject_listen_impl(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        let rejected = self.lock_state().reject_listen(target_id, error, &mut effects);
        ignore_if_primary_lease_loss(rejected)?;
        self.dispatch(effects).await
    }

    async fn apply_successful_write_impl(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        let applied = {
            let mut state = self.lock_state();
            let batch_id = result.batch.batch_id();
            state.local_store.acknowledge_batch(&result).and_then(|changes| {
                state.complete_write(batch_id, Ok(()), &mut effects)?;
                state.emit_new_snapshots(&changes, None, &mut effects)
            })
        };
        ignore_if_primary_lease_loss(applied)?;
        self.dispatch(effects).await
    }

    async fn reject_failed_write_impl(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        let rejected = {
            let mut state = self.lock_state();
            state.local_store.reject_batch(batch_id, &error).and_then(|changes| {
                state.complete_write(batch_id, Err(error.clone()), &mut effects)?;
                state.emit_new_snapshots(&changes, None, &mut effects)
            })
        };
        ignore_if_primary_lease_loss(rejected)?;
        self.dispatch(effects).await
    }

    async fn apply_online_state_change_impl(&self, online_state: OnlineState) {
        let mut effects = Effects::default();
        {
            let mut state = self.lock_state();
            state.online_state = online_state;
            if state.is_primary {
                for query_view in state.query_views.values_mut() {
                    let change = query_view.view.apply_online_state_change(online_state);
                    hard_assert(
                        change.limbo_changes.is_empty(),
                        "online state changes must not alter limbo documents",
                    );
                    effects.snapshots.extend(change.snapshot);
                }
            }
            effects.online_state = Some(online_state);
        }
        if let Err(err) = self.dispatch(effects).await {
            log::debug!("failed to apply online state {online_state:?}: {err}");
        }
    }

    async fn handle_credential_change_impl(&self, user: User) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.lock_state();
            if state.current_user == user {
                return Ok(());
            }
            log::debug!("user change; new user: {:?}", user.uid());
            let result = state.local_store.handle_user_change(user.clone())?;
            state.current_user = user;
            state.reject_outstanding_callbacks(&mut effects);
            state.emit_new_snapshots(&result.affected_documents, None, &mut effects)?;
        }
        self.dispatch(effects).await
    }
}

impl SyncEngineState {
    fn listen(&mut self, query: Query, effects: &mut Effects) -> FirestoreResult<ViewSnapshot> {
        if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
            return Ok(query_view.view.compute_initial_snapshot());
        }
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let snapshot = self.initialize_view(
            query,
            target_data.target_id,
            target_data.resume_token.clone(),
            effects,
        )?;
        if self.is_primary {
            effects.listen(target_data);
        }
        Ok(snapshot)
    }

    fn initialize_view(
        &mut self,
        query: Query,
        target_id: TargetId,
        resume_token: Vec<u8>,
        effects: &mut Effects,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        // Until the backend says otherwise the target is not current.
        let synthesized = TargetChange::create_synthesized(false, resume_token);
        let change = view.apply_changes(doc_changes, self.is_primary, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, change.limbo_changes, effects);

        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.queries_by_target.entry(target_id).or_default().push(query);
        change
            .snapshot
            .ok_or_else(|| internal_error("first view change did not produce a snapshot"))
    }

    fn unlisten(&mut self, query: &Query, effects: &mut Effects) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = self.query_views.get(&canonical_id).map(|view| view.target_id) else {
            log::debug!("unlisten for query {canonical_id} that is not listened to");
            return Ok(());
        };

        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|other| other != query);
                self.query_views.remove(&canonical_id);
                return Ok(());
            }
        }

        if self.is_primary {
            effects.unlisten(target_id);
            ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?;
            self.remove_and_clean_up_target(target_id, None, effects);
        } else {
            self.remove_and_clean_up_target(target_id, None, effects);
            self.local_store.release_target(target_id, true)?;
        }
        Ok(())
    }

    fn remove_and_clean_up_target(&mut self, target_id: TargetId, error: Option<FirestoreError>, effects: &mut Effects) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                effects.errors.push((query, error.clone()));
            }
        }
        if !self.is_primary {
            return;
        }
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key, effects);
            }
        }
    }

    fn apply_remote_event(&mut self, event: &RemoteEvent, effects: &mut Effects) -> FirestoreResult<()> {
        let changes = self.local_store.apply_remote_event(event)?;
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            hard_assert(
                change.change_count() <= 1,
                "limbo resolution for a single document contains multiple changes",
            );
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "received a change for a limbo document that was never added",
                );
            } else if !change.removed_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "received a removal for a limbo document that was never added",
                );
                resolution.received_document = false;
            }
        }
        self.emit_new_snapshots(&changes, Some(event), effects)
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError, effects: &mut Effects) -> FirestoreResult<()> {
        let limbo_key = self
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        let Some(limbo_key) = limbo_key else {
            self.local_store.release_target(target_id, false)?;
            self.remove_and_clean_up_target(target_id, Some(error), effects);
            return Ok(());
        };

        // The backend refuses to confirm the document; treat it as deleted
        // at an unknown version.
        log::debug!("limbo resolution for {limbo_key} failed: {error}");
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::min(),
            ..Default::default()
        };
        event.document_updates.insert(
            limbo_key.clone(),
            MutableDocument::new_no_document(limbo_key.clone(), SnapshotVersion::min()),
        );
        event.resolved_limbo_documents.insert(limbo_key.clone());
        self.apply_remote_event(&event, effects)?;

        self.active_limbo_targets_by_key.remove(&limbo_key);
        self.active_limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions(effects);
        Ok(())
    }

    /// Runs `changes` through every view and collects the snapshots that
    /// result.
    fn emit_new_snapshots(
        &mut self,
        changes: &MutableDocumentMap,
        remote_event: Option<&RemoteEvent>,
        effects: &mut Effects,
    ) -> FirestoreResult<()> {
        let is_primary = self.is_primary;
        let mut local_view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        let local_store = &mut self.local_store;
        for query_view in self.query_views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                let result = local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes));
            }
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset = remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let change = query_view
                .view
                .apply_changes(doc_changes, is_primary, target_change, pending_reset);

            limbo_updates.push((target_id, change.limbo_changes));
            if let Some(snapshot) = change.snapshot {
                local_view_changes.push(local_view_changes_for(target_id, &snapshot));
                effects.snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes, effects);
        }
        self.local_store.notify_local_view_changes(&local_view_changes)
    }

    /// Recomputes every view from persistence, as another client may have
    /// changed it.
    fn synchronize_views(&mut self, track_limbos: bool, effects: &mut Effects) -> FirestoreResult<()> {
        let mut limbo_updates = Vec::new();
        let local_store = &mut self.local_store;
        for query_view in self.query_views.values_mut() {
            let result = local_store.execute_query(&query_view.query, false)?;
            let change = query_view.view.synchronize_with_persisted_state(result);
            if track_limbos {
                limbo_updates.push((query_view.target_id, change.limbo_changes));
            }
            effects.snapshots.extend(change.snapshot);
        }
        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes, effects);
        }
        Ok(())
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>, effects: &mut Effects) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(&key, target_id);
                    self.track_limbo_document(key, effects);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, effects);
                    }
                }
            }
        }
    }

    fn track_limbo_document(&mut self, key: DocumentKey, effects: &mut Effects) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        log::debug!("new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(effects);
    }

    /// Starts resolutions for enqueued limbo documents while slots are free.
    fn pump_enqueued_limbo_resolutions(&mut self, effects: &mut Effects) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), limbo_target_id);
            effects.listen(TargetData::new(
                Query::for_document(&key).to_target(),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            ));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, effects: &mut Effects) {
        self.enqueued_limbo_resolutions.retain(|enqueued| enqueued != key);
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        effects.unlisten(limbo_target_id);
        self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions(effects);
    }

    fn reset_limbo_documents(&mut self, effects: &mut Effects) {
        for limbo_target_id in self.active_limbo_targets_by_key.values() {
            effects.unlisten(*limbo_target_id);
        }
        self.limbo_document_refs.remove_all_references();
        self.active_limbo_targets_by_key.clear();
        self.active_limbo_resolutions_by_target.clear();
        self.enqueued_limbo_resolutions.clear();
    }

    fn complete_write(
        &mut self,
        batch_id: BatchId,
        result: FirestoreResult<()>,
        effects: &mut Effects,
    ) -> FirestoreResult<()> {
        if let Some(callback) = self.write_callbacks.remove(&batch_id) {
            // Our own outcome needs no record for other clients.
            self.local_store.take_batch_state(batch_id)?;
            effects.complete(callback, result);
        }
        self.trigger_pending_writes_callbacks(batch_id, effects);
        Ok(())
    }

    /// Completes waiters whose batches are all done once `batch_id` is.
    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId, effects: &mut Effects) {
        let later = self.pending_writes_callbacks.split_off(&(batch_id + 1));
        let ready = std::mem::replace(&mut self.pending_writes_callbacks, later);
        for callback in ready.into_values().flatten() {
            effects.complete(callback, Ok(()));
        }
    }

    /// Completes this client's writes whose outcome another client recorded.
    fn resolve_persisted_batch_states(&mut self, effects: &mut Effects) -> FirestoreResult<()> {
        let pending: Vec<BatchId> = self.write_callbacks.keys().copied().collect();
        for batch_id in pending {
            let result = match self.local_store.take_batch_state(batch_id)? {
                Some(BatchState::Acknowledged) => Ok(()),
                Some(BatchState::Rejected { code, message }) => Err(FirestoreError::new(code, message)),
                None => continue,
            };
            if let Some(callback) = self.write_callbacks.remove(&batch_id) {
                effects.complete(callback, result);
            }
        }

        let highest = self.local_store.highest_unacknowledged_batch_id()?;
        let done_up_to = match highest {
            BATCH_ID_UNKNOWN => BatchId::MAX - 1,
            highest => highest - 1,
        };
        self.trigger_pending_writes_callbacks(done_up_to, effects);
        Ok(())
    }

    fn reject_outstanding_callbacks(&mut self, effects: &mut Effects) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks).into_values().flatten() {
            effects.complete(
                callback,
                Err(cancelled("waiting for pending writes was cancelled by a user change")),
            );
        }
        for callback in std::mem::take(&mut self.write_callbacks).into_values() {
            effects.complete(callback, Err(cancelled("write was abandoned by a user change")));
        }
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return [resolution.key.clone()].into_iter().collect();
            }
            return DocumentKeySet::new();
        }
        let mut keys = DocumentKeySet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }
}

fn local_view_changes_for(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..Default::default()
    };
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

fn ignore_if_primary_lease_loss(result: FirestoreResult<()>) -> FirestoreResult<()> {
    match result {
        Err(err) if is_primary_lease_lost(&err) => {
            log::debug!("unexpectedly lost primary lease: {err}");
            Ok(())
        }
        other => other,
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_impl(event))
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_impl(target_id, error))
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_impl(result))
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_impl(batch_id, error))
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.lock_state().remote_keys_for_target(target_id)
    }

    fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        self.lock_state().local_store.next_mutation_batch(after_batch_id)
    }

    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.lock_state().local_store.last_remote_snapshot_version()
    }

    fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.lock_state().local_store.last_stream_token()
    }

    fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.lock_state().local_store.set_last_stream_token(stream_token)
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()> {
        box_remote_store_future(self.apply_online_state_change_impl(online_state))
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_credential_change_impl(user))
    }
}
