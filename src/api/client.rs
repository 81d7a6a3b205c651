use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::listener::ListenerRegistration;
use crate::api::settings::{FirestoreSettings, PersistenceSettings};
use crate::api::snapshot::{DocumentSnapshot, QuerySnapshot};
use crate::core::{
    EventManager, ListenOptions, Query, QueryListener, SnapshotObserver, SyncEngine, SyncEngineConfig,
    SyncEngineListener, ViewSnapshot, WriteCallback,
};
use crate::error::{cancelled, is_primary_lease_lost, unavailable, FirestoreErrorCode, FirestoreResult};
use crate::local::{LeaseSettings, LocalStore, LruResults, MemoryKvStore, Persistence, TransactionMode};
use crate::model::{DocumentKey, FieldIndex, Mutation, User};
use crate::platform::runtime;
use crate::remote::{
    ConnectivityMonitor, JsonProtoSerializer, NetworkLayer, NoopConnectivityMonitor, OnlineState, StreamingDatastore,
    TokenProviderArc,
};
use crate::util::{AsyncQueue, TimerId};

const INITIAL_INDEX_BACKFILL_DELAY: Duration = Duration::from_secs(15);
const REGULAR_INDEX_BACKFILL_DELAY: Duration = Duration::from_secs(60);

struct ClientInner {
    settings: FirestoreSettings,
    queue: AsyncQueue,
    persistence: Arc<Persistence>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    network_enabled: AtomicBool,
}

/// A client of one database: the local cache, the sync engine and the
/// streams to the backend, all driven by a single [`AsyncQueue`].
///
/// Cloning is cheap; clones share the same client.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

/// Configures a [`FirestoreClient`] beyond its settings.
pub struct FirestoreClientBuilder {
    settings: FirestoreSettings,
    datastore: Arc<dyn StreamingDatastore>,
    auth: TokenProviderArc,
    connectivity: Arc<dyn ConnectivityMonitor>,
    user: User,
}

impl FirestoreClientBuilder {
    pub fn with_connectivity_monitor(mut self, connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// User whose mutation queue is active at start.
    pub fn with_user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    /// Opens persistence, elects a primary among the clients sharing the
    /// store and starts the streams when this client is the primary.
    pub async fn build(self) -> FirestoreResult<FirestoreClient> {
        let Self {
            settings,
            datastore,
            auth,
            connectivity,
            user,
        } = self;

        let client_id = settings.persistence.resolve_client_id();
        let persistence = Arc::new(open_persistence(&settings.persistence, &client_id, settings.lease)?);
        let local_store = LocalStore::new(Arc::clone(&persistence), user, settings.local_store_settings());
        local_store.start()?;
        let is_primary = refresh_lease(&persistence, true)?;
        log::debug!("client {client_id} started (primary: {is_primary})");

        let queue = AsyncQueue::new();
        let event_manager = EventManager::new();
        let sync_engine = SyncEngine::new(
            local_store,
            Arc::clone(&event_manager) as Arc<dyn SyncEngineListener>,
            SyncEngineConfig {
                network_layer: NetworkLayer::builder(datastore, auth)
                    .with_retry(settings.retry.clone())
                    .build(),
                serializer: JsonProtoSerializer::new(settings.database_id.clone()),
                queue: queue.clone(),
                connectivity,
                max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
                is_primary,
            },
        );

        let client = FirestoreClient {
            inner: Arc::new(ClientInner {
                settings,
                queue,
                persistence,
                sync_engine,
                event_manager,
                network_enabled: AtomicBool::new(true),
            }),
        };

        let engine = Arc::clone(&client.inner.sync_engine);
        client
            .inner
            .queue
            .enqueue(async move {
                let remote_store = engine.remote_store();
                if is_primary {
                    remote_store.start().await
                } else {
                    remote_store.apply_primary_state(false).await
                }
            })
            .await?;

        client.schedule_lease_refresh();
        client.schedule_garbage_collection(client.inner.settings.gc_schedule.initial_delay);
        client.schedule_index_backfill(INITIAL_INDEX_BACKFILL_DELAY);
        Ok(client)
    }
}

/// Handle of a write applied to the local cache.
pub struct PendingWrite {
    receiver: async_channel::Receiver<FirestoreResult<()>>,
}

impl PendingWrite {
    /// Resolves once the backend acknowledged the write, or with the error
    /// it was rejected with.
    pub async fn acknowledged(self) -> FirestoreResult<()> {
        self.receiver
            .recv()
            .await
            .map_err(|_| cancelled("The client was terminated before the write was acknowledged"))?
    }

    /// The outcome, if the backend already answered.
    pub fn try_result(&self) -> Option<FirestoreResult<()>> {
        self.receiver.try_recv().ok()
    }
}

impl FirestoreClient {
    /// Starts a client for the anonymous user with no connectivity
    /// monitoring.
    pub async fn new(
        settings: FirestoreSettings,
        datastore: Arc<dyn StreamingDatastore>,
        auth: TokenProviderArc,
    ) -> FirestoreResult<Self> {
        Self::builder(settings, datastore, auth).build().await
    }

    pub fn builder(
        settings: FirestoreSettings,
        datastore: Arc<dyn StreamingDatastore>,
        auth: TokenProviderArc,
    ) -> FirestoreClientBuilder {
        FirestoreClientBuilder {
            settings,
            datastore,
            auth,
            connectivity: Arc::new(NoopConnectivityMonitor),
            user: User::anonymous(),
        }
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    pub fn client_id(&self) -> &str {
        self.inner.persistence.client_id()
    }

    pub fn is_primary(&self) -> bool {
        self.inner.sync_engine.is_primary()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.event_manager.online_state()
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.inner.sync_engine
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    /// Listens to `query`. The observer receives every snapshot the options
    /// ask for, or a single error after which the listener is dead.
    pub async fn listen<F>(&self, query: Query, options: ListenOptions, observer: F) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<QuerySnapshot>) + Send + Sync + 'static,
    {
        let observer: SnapshotObserver =
            Arc::new(move |event: FirestoreResult<ViewSnapshot>| observer(event.map(QuerySnapshot::from_view_snapshot)));
        let listener = QueryListener::new(query, options, observer);

        let engine = Arc::clone(&self.inner.sync_engine);
        let events = Arc::clone(&self.inner.event_manager);
        let registered = Arc::clone(&listener);
        self.inner
            .queue
            .enqueue(async move { events.listen(&engine, registered).await })
            .await?;
        Ok(ListenerRegistration::new(self.clone(), listener))
    }

    pub(crate) fn unlisten(&self, listener: Arc<QueryListener>) {
        let engine = Arc::clone(&self.inner.sync_engine);
        let events = Arc::clone(&self.inner.event_manager);
        self.inner.queue.enqueue_and_forget(async move {
            if let Err(err) = events.unlisten(&engine, &listener).await {
                log::debug!("failed to stop listening to {}: {err}", listener.query().canonical_id());
            }
        });
    }

    /// Applies `mutations` to the local cache as one batch and queues them
    /// for the backend. Listeners see the change before this returns.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let (sender, receiver) = async_channel::bounded(1);
        let callback: WriteCallback = Box::new(move |result| {
            let _ = sender.try_send(result);
        });
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { engine.write(mutations, callback).await })
            .await?;

        // A batch rejected by the local store reports its error at once.
        match receiver.try_recv() {
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => Ok(PendingWrite {
                receiver: closed_with(Ok(())),
            }),
            Err(_) => Ok(PendingWrite { receiver }),
        }
    }

    /// Resolves once every write issued so far by the current user has been
    /// acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (sender, receiver) = async_channel::bounded(1);
        let callback: WriteCallback = Box::new(move |result| {
            let _ = sender.try_send(result);
        });
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { engine.register_pending_writes_callback(callback).await })
            .await?;
        receiver
            .recv()
            .await
            .map_err(|_| cancelled("The client was terminated while waiting for pending writes"))?
    }

    /// Reads `key` from the local cache, including pending local writes.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<DocumentSnapshot> {
        let engine = Arc::clone(&self.inner.sync_engine);
        let document = self
            .inner
            .queue
            .enqueue(async move { engine.read_document(&key) })
            .await?;
        if document.is_found_document() {
            Ok(DocumentSnapshot::from_document(&document, true, document.has_local_mutations()))
        } else if document.is_no_document() {
            Ok(DocumentSnapshot::from_document(&document, true, false))
        } else {
            Err(unavailable(format!(
                "Failed to get document {} from cache; it may exist on the backend",
                document.key()
            )))
        }
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<QuerySnapshot> {
        let engine = Arc::clone(&self.inner.sync_engine);
        let snapshot = self
            .inner
            .queue
            .enqueue(async move { engine.execute_query_from_cache(&query) })
            .await?;
        Ok(QuerySnapshot::from_view_snapshot(snapshot))
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.network_enabled.store(true, Ordering::SeqCst);
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { engine.remote_store().enable_network().await })
            .await
    }

    /// Closes the streams. Listeners switch to cache-only snapshots and
    /// writes wait in the mutation queue.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.network_enabled.store(false, Ordering::SeqCst);
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { engine.remote_store().disable_network().await })
            .await
    }

    /// Switches to `user`'s mutation queue. Streams restart with the new
    /// credentials and callbacks of the previous user's writes fail.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { engine.remote_store().handle_credential_change(user).await })
            .await
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { engine.configure_field_indexes(indexes) })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move {
                engine.set_index_auto_creation_enabled(enabled);
                Ok(())
            })
            .await
    }

    /// Runs one garbage collection pass now instead of waiting for the
    /// schedule.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { engine.collect_garbage() })
            .await
    }

    /// Stops the client: closes the streams, cancels scheduled work and
    /// gives up the primary lease. Later calls fail as cancelled.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        let engine = Arc::clone(&self.inner.sync_engine);
        let persistence = Arc::clone(&self.inner.persistence);
        self.inner
            .queue
            .enqueue_and_initiate_shutdown(async move {
                engine.remote_store().shutdown().await?;
                persistence.run_transaction("Release client lease", TransactionMode::ReadWrite, |txn| {
                    persistence.lease().release(txn)
                })
            })
            .await
    }

    fn schedule_lease_refresh(&self) {
        let client = Arc::downgrade(&self.inner);
        self.inner.queue.enqueue_after_delay(
            TimerId::ClientLeaseRefresh,
            self.inner.settings.lease.refresh_interval,
            async move {
                let Some(inner) = client.upgrade() else {
                    return;
                };
                let client = FirestoreClient { inner };
                client.on_lease_refresh().await;
                client.schedule_lease_refresh();
            },
        );
    }

    async fn on_lease_refresh(&self) {
        let engine = &self.inner.sync_engine;
        let network_enabled = self.inner.network_enabled.load(Ordering::SeqCst);
        let is_primary = match refresh_lease(&self.inner.persistence, network_enabled) {
            Ok(is_primary) => is_primary,
            Err(err) => {
                log::debug!("failed to refresh the client lease: {err}");
                return;
            }
        };

        if is_primary != engine.is_primary() {
            if is_primary {
                log::debug!("client {} acquired the primary lease", self.client_id());
            } else {
                log::debug!("client {} lost the primary lease", self.client_id());
            }
            if let Err(err) = engine.apply_primary_state(is_primary).await {
                log::debug!("failed to apply primary state change: {err}");
            }
        }

        let result = if is_primary {
            // Picks up batches written by secondary clients.
            engine.remote_store().fill_write_pipeline().await
        } else {
            engine.synchronize_with_persisted_state().await
        };
        if let Err(err) = result {
            log::debug!("failed to synchronize with other clients: {err}");
        }
    }

    fn schedule_garbage_collection(&self, delay: Duration) {
        let client = Arc::downgrade(&self.inner);
        self.inner
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, async move {
                let Some(inner) = client.upgrade() else {
                    return;
                };
                let client = FirestoreClient { inner };
                client.run_scheduled_garbage_collection();
                client.schedule_garbage_collection(client.inner.settings.gc_schedule.regular_delay);
            });
    }

    fn run_scheduled_garbage_collection(&self) {
        let engine = &self.inner.sync_engine;
        if !engine.is_primary() {
            log::debug!("skipping garbage collection: client is not primary");
            return;
        }
        match engine.collect_garbage() {
            Ok(_) => {}
            Err(err) if is_primary_lease_lost(&err) => {
                log::debug!("garbage collection interrupted by primary lease loss");
            }
            Err(err) => log::warn!("garbage collection failed: {err}"),
        }
    }

    fn schedule_index_backfill(&self, delay: Duration) {
        let client = Arc::downgrade(&self.inner);
        self.inner
            .queue
            .enqueue_after_delay(TimerId::IndexBackfill, delay, async move {
                let Some(inner) = client.upgrade() else {
                    return;
                };
                let client = FirestoreClient { inner };
                match client.inner.sync_engine.backfill_indexes() {
                    Ok(0) => {}
                    Ok(count) => log::debug!("backfilled {count} index entries"),
                    Err(err) => log::debug!("index backfill failed: {err}"),
                }
                client.schedule_index_backfill(REGULAR_INDEX_BACKFILL_DELAY);
            });
    }
}

/// Opens the configured store, falling back to an in-memory store when it
/// is unavailable.
fn open_persistence(
    settings: &PersistenceSettings,
    client_id: &str,
    lease: LeaseSettings,
) -> FirestoreResult<Persistence> {
    let Some(store) = settings.store.clone() else {
        return Persistence::open(Arc::new(MemoryKvStore::new()), client_id, lease);
    };
    match Persistence::open(store, client_id, lease) {
        Err(err) if err.code == FirestoreErrorCode::Unavailable => {
            log::warn!("persistence is unavailable, falling back to an in-memory cache: {err}");
            Persistence::open(Arc::new(MemoryKvStore::new()), client_id, lease)
        }
        result => result,
    }
}

fn refresh_lease(persistence: &Persistence, network_enabled: bool) -> FirestoreResult<bool> {
    persistence.run_transaction("Refresh client lease", TransactionMode::ReadWrite, |txn| {
        persistence
            .lease()
            .refresh(txn, runtime::now_millis(), network_enabled)
    })
}

fn closed_with<T>(value: T) -> async_channel::Receiver<T> {
    let (sender, receiver) = async_channel::bounded(1);
    let _ = sender.try_send(value);
    receiver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{KvTransaction, KvStore};
    use crate::model::DatabaseId;
    use crate::remote::{InMemoryTransport, MultiplexedConnection, NoopTokenProvider, StreamingDatastoreImpl};

    struct UnavailableStore;

    impl KvStore for UnavailableStore {
        fn begin(&self, _mode: TransactionMode) -> FirestoreResult<Box<dyn KvTransaction + '_>> {
            Err(unavailable("storage is disabled"))
        }
    }

    async fn client_with(settings: FirestoreSettings) -> FirestoreClient {
        let (client_side, _server_side) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client_side));
        FirestoreClient::new(
            settings,
            Arc::new(StreamingDatastoreImpl::new(connection)),
            Arc::new(NoopTokenProvider),
        )
        .await
        .unwrap()
    }

    fn settings() -> FirestoreSettings {
        FirestoreSettings::new(DatabaseId::new("project", "(default)"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn falls_back_to_memory_when_store_is_unavailable() {
        let persistence = PersistenceSettings::memory()
            .with_store(Arc::new(UnavailableStore))
            .with_client_id("tab-1");
        let client = client_with(settings().with_persistence(persistence)).await;

        assert_eq!(client.client_id(), "tab-1");
        assert!(client.is_primary());
        client.terminate().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn schedules_background_work() {
        let client = client_with(settings()).await;
        let queue = client.queue();
        assert!(queue.contains_delayed_operation(TimerId::ClientLeaseRefresh));
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
        assert!(queue.contains_delayed_operation(TimerId::IndexBackfill));

        client.terminate().await.unwrap();
        assert!(!client.queue().contains_delayed_operation(TimerId::ClientLeaseRefresh));
        let err = client.disable_network().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_document_is_not_served_from_cache() {
        let client = client_with(settings()).await;
        client.disable_network().await.unwrap();
        let err = client
            .get_document_from_local_cache(DocumentKey::from_string("rooms/a").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
        client.terminate().await.unwrap();
    }
}
