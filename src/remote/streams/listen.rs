use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::core::{TargetData, TargetPurpose};
use crate::error::{internal_error, FirestoreError, FirestoreResult};
use crate::model::{SnapshotVersion, TargetId};
use crate::remote::datastore::StreamHandle;
use crate::remote::network::{NetworkLayer, NetworkStreamHandler, StreamCredentials};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::{PersistentStreamHandle, StreamState};
use crate::remote::watch_change::{decode_watch_change, snapshot_version_of, WatchChange};

/// Receives events of one listen stream incarnation.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamDelegate: Send + Sync + 'static {
    /// The stream is ready for `addTarget` requests.
    async fn on_watch_stream_open(&self);

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()>;

    /// `None` when the backend closed the stream cleanly.
    async fn on_watch_stream_close(&self, error: Option<FirestoreError>);
}

/// The long-lived listen stream. Sends target requests and surfaces decoded
/// watch changes to its delegate.
pub struct ListenStream<D>
where
    D: WatchStreamDelegate,
{
    handler: Arc<ListenStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> ListenStream<D>
where
    D: WatchStreamDelegate,
{
    pub fn start(layer: &NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let handler = Arc::new(ListenStreamHandler {
            serializer,
            delegate,
            stream: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        let handle = layer.listen(Arc::clone(&handler));
        Self { handler, handle }
    }

    pub async fn is_open(&self) -> bool {
        self.handler.stream.lock().await.is_some()
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = encode_watch_request(&self.handler.serializer, target_data);
        self.handler.send(request).await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        let request = json!({
            "database": self.handler.serializer.database_name(),
            "removeTarget": target_id,
        });
        self.handler.send(request).await
    }

    pub fn stop(&self) {
        self.handler.running.store(false, Ordering::SeqCst);
        self.handle.stop();
    }
}

fn encode_watch_request(serializer: &JsonProtoSerializer, target_data: &TargetData) -> JsonValue {
    let mut request = serde_json::Map::new();
    request.insert("database".to_string(), json!(serializer.database_name()));
    request.insert("addTarget".to_string(), serializer.encode_target(target_data));
    if let Some(labels) = listen_request_labels(target_data.purpose) {
        request.insert("labels".to_string(), json!(labels));
    }
    JsonValue::Object(request)
}

fn listen_request_labels(purpose: TargetPurpose) -> Option<BTreeMap<&'static str, &'static str>> {
    let tag = match purpose {
        TargetPurpose::Listen => return None,
        TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
        TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
        TargetPurpose::LimboResolution => "limbo-document",
    };
    Some(BTreeMap::from([("goog-listen-tags", tag)]))
}

struct ListenStreamHandler<D>
where
    D: WatchStreamDelegate,
{
    serializer: JsonProtoSerializer,
    delegate: Arc<D>,
    stream: Mutex<Option<Arc<dyn StreamHandle>>>,
    running: AtomicBool,
}

impl<D> ListenStreamHandler<D>
where
    D: WatchStreamDelegate,
{
    async fn send(&self, request: JsonValue) -> FirestoreResult<()> {
        let stream = self.stream.lock().await.clone();
        let Some(stream) = stream else {
            return Err(internal_error("Listen stream is not open"));
        };
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode listen request: {err}")))?;
        stream.send(bytes).await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<D> NetworkStreamHandler for ListenStreamHandler<D>
where
    D: WatchStreamDelegate,
{
    fn label(&self) -> &'static str {
        "listen"
    }

    fn should_continue(&self) -> bool {
        self.is_running()
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, _credentials: StreamCredentials) -> FirestoreResult<()> {
        *self.stream.lock().await = Some(stream);
        if self.is_running() {
            self.delegate.on_watch_stream_open().await;
        }
        Ok(())
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("Failed to decode listen response: {err}")))?;
        let snapshot_version = snapshot_version_of(&self.serializer, &value)?;
        match decode_watch_change(&self.serializer, &value)? {
            Some(change) => self.delegate.on_watch_change(change, snapshot_version).await,
            None => {
                log::debug!("ignoring unrecognized listen response: {value}");
                Ok(())
            }
        }
    }

    async fn on_close(&self) {
        *self.stream.lock().await = None;
        if self.is_running() {
            self.delegate.on_watch_stream_close(None).await;
        }
    }

    async fn on_error(&self, error: FirestoreError) {
        *self.stream.lock().await = None;
        if self.is_running() {
            self.delegate.on_watch_stream_close(Some(error)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::model::{DatabaseId, ResourcePath};
    use crate::platform::runtime;
    use crate::remote::datastore::{NoopTokenProvider, StreamingDatastore, StreamingDatastoreImpl, TokenProviderArc};
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::remote::watch_change::WatchTargetChangeState;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct TestDelegate {
        opens: StdMutex<usize>,
        changes: StdMutex<Vec<(WatchChange, SnapshotVersion)>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl WatchStreamDelegate for TestDelegate {
        async fn on_watch_stream_open(&self) {
            *self.opens.lock().unwrap() += 1;
        }

        async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
            self.changes.lock().unwrap().push((change, snapshot_version));
            Ok(())
        }

        async fn on_watch_stream_close(&self, _error: Option<FirestoreError>) {}
    }

    async fn spin_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
    }

    fn start() -> (ListenStream<TestDelegate>, Arc<TestDelegate>, MultiplexedConnection) {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::new(left_transport));
        let server = MultiplexedConnection::new(right_transport);
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(client));
        let layer = NetworkLayer::builder(datastore, Arc::new(NoopTokenProvider) as TokenProviderArc).build();
        let delegate = Arc::new(TestDelegate::default());
        let serializer = JsonProtoSerializer::new(DatabaseId::new("project", "(default)"));
        let stream = ListenStream::start(&layer, serializer, Arc::clone(&delegate));
        (stream, delegate, server)
    }

    #[tokio::test]
    async fn limbo_watch_requests_carry_listen_tags() {
        let (stream, delegate, server) = start();
        let (_, peer) = server.accept_stream().await.expect("peer stream");
        spin_until(|| *delegate.opens.lock().unwrap() == 1).await;
        assert!(stream.is_open().await);

        let key = crate::model::DocumentKey::from_string("rooms/eros").unwrap();
        let target_data = TargetData::new(
            crate::core::Target::for_document(&key),
            3,
            TargetPurpose::LimboResolution,
            1,
        );
        stream.watch(&target_data).await.expect("watch");
        stream.unwatch(3).await.expect("unwatch");

        let request: JsonValue = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["database"], json!("projects/project/databases/(default)"));
        assert_eq!(request["addTarget"]["targetId"], json!(3));
        assert_eq!(request["labels"], json!({ "goog-listen-tags": "limbo-document" }));

        let request: JsonValue = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["removeTarget"], json!(3));
        stream.stop();
    }

    #[tokio::test]
    async fn delivers_watch_changes_with_snapshot_version() {
        let (stream, delegate, server) = start();
        let (_, peer) = server.accept_stream().await.expect("peer stream");
        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        spin_until(|| *delegate.opens.lock().unwrap() == 1).await;
        stream
            .watch(&TargetData::new(query.to_target(), 1, TargetPurpose::Listen, 1))
            .await
            .expect("watch");
        let request: JsonValue = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        assert!(request.get("labels").is_none());

        let changes = [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [1] } }),
            json!({ "targetChange": { "readTime": "1970-01-01T00:00:05Z" } }),
        ];
        for change in changes {
            peer.send(serde_json::to_vec(&change).unwrap()).await.expect("send");
        }

        spin_until(|| delegate.changes.lock().unwrap().len() == 2).await;
        let changes = delegate.changes.lock().unwrap();
        match &changes[0] {
            (WatchChange::TargetChange(change), version) => {
                assert_eq!(change.state, WatchTargetChangeState::Added);
                assert!(version.is_min());
            }
            other => panic!("unexpected change: {other:?}"),
        }
        assert_eq!(changes[1].1, SnapshotVersion::from_micros(5_000_000));
        drop(changes);
        stream.stop();
    }
}
