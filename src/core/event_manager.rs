use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::query::Query;
use crate::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{FirestoreError, FirestoreResult};
use crate::remote::OnlineState;

/// Per-listener options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (pending writes or
    /// from-cache state).
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while the client may be online, until
    /// the backend has answered.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_include_metadata_changes(mut self, include: bool) -> Self {
        self.include_metadata_changes = include;
        self
    }

    pub fn with_wait_for_sync_when_online(mut self, wait: bool) -> Self {
        self.wait_for_sync_when_online = wait;
        self
    }
}

/// Receives the snapshots of one listener, or the error that ended it.
pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

struct QueryListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// Filters the view snapshots of a query down to the events one listener
/// asked for.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    muted: AtomicBool,
    state: Mutex<QueryListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: SnapshotObserver) -> Arc<Self> {
        Arc::new(Self {
            query,
            options,
            observer,
            muted: AtomicBool::new(false),
            state: Mutex::new(QueryListenerState {
                raised_initial_event: false,
                snapshot: None,
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn options(&self) -> ListenOptions {
        self.options
    }

    /// Stops delivery immediately, before the listener is unregistered.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Offers a new view snapshot. Returns whether an event was raised.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            ViewSnapshot {
                document_changes: snapshot
                    .document_changes
                    .into_iter()
                    .filter(|change| change.change_type != ChangeType::Metadata)
                    .collect(),
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let event = {
            let mut state = self.lock_state();
            let event = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(Self::initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(&snapshot, state.snapshot.as_ref()) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            event
        };
        match event {
            Some(event) => {
                self.emit(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        self.emit(Err(error));
    }

    /// Returns whether the change released a held-back initial event.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let event = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let event = Self::initial_event(snapshot);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match event {
            Some(event) => {
                self.emit(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cache result is only worth raising once the client knows
        // it is offline, or if the target was synced before.
        !snapshot.documents.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot, previous: Option<&ViewSnapshot>) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed =
            previous.is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        )
    }

    fn emit(&self, event: FirestoreResult<ViewSnapshot>) {
        if !self.is_muted() {
            (self.observer)(event);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueryListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

#[derive(Default)]
struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Fans view snapshots out to the listeners of each query. The sync engine
/// keeps one view per query however many listeners share it.
///
/// Observers are always called without any lock held, so they may add or
/// remove listeners.
#[derive(Default)]
pub struct EventManager {
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `listener`, starting to listen to its query when it is the
    /// first listener. A failure to start is reported to the listener.
    pub async fn listen(&self, sync_engine: &SyncEngine, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let query_id = listener.query().canonical_id();
        let first_listen = !self.lock_state().queries.contains_key(&query_id);

        let initial_snapshot = if first_listen {
            match sync_engine.listen(listener.query().clone()).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    log::debug!("failed to listen to {}: {err}", query_id);
                    listener.on_error(err);
                    return Ok(());
                }
            }
        } else {
            None
        };

        let (view_snapshot, online_state) = {
            let mut state = self.lock_state();
            let online_state = state.online_state;
            let info = state.queries.entry(query_id).or_insert_with(|| QueryListenersInfo {
                view_snapshot: None,
                listeners: Vec::new(),
            });
            if initial_snapshot.is_some() {
                info.view_snapshot = initial_snapshot;
            }
            info.listeners.push(Arc::clone(&listener));
            (info.view_snapshot.clone(), online_state)
        };

        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = view_snapshot {
            listener.on_view_snapshot(snapshot);
        }
        Ok(())
    }

    /// Unregisters `listener`, and stops listening to its query when it was
    /// the last one.
    pub async fn unlisten(&self, sync_engine: &SyncEngine, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let query_id = listener.query().canonical_id();
        let last_listen = {
            let mut state = self.lock_state();
            let mut last_listen = false;
            if let Some(info) = state.queries.get_mut(&query_id) {
                if let Some(index) = info.listeners.iter().position(|other| Arc::ptr_eq(other, listener)) {
                    info.listeners.remove(index);
                    last_listen = info.listeners.is_empty();
                }
            }
            if last_listen {
                state.queries.remove(&query_id);
            }
            last_listen
        };

        if last_listen {
            sync_engine.unlisten(listener.query()).await
        } else {
            Ok(())
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.lock_state().online_state
    }

    pub fn listener_count(&self) -> usize {
        self.lock_state()
            .queries
            .values()
            .map(|info| info.listeners.len())
            .sum()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock_state();
            for snapshot in snapshots {
                let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for listener in &info.listeners {
                    deliveries.push((Arc::clone(listener), snapshot.clone()));
                }
                info.view_snapshot = Some(snapshot);
            }
        }
        for (listener, snapshot) in deliveries {
            listener.on_view_snapshot(snapshot);
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let listeners = self
            .lock_state()
            .queries
            .remove(&query.canonical_id())
            .map(|info| info.listeners)
            .unwrap_or_default();
        for listener in listeners {
            listener.on_error(error.clone());
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<_> = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        for listener in listeners {
            listener.apply_online_state_change(online_state);
        }
    }
}
