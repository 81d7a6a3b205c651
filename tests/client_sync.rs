#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_offline_sync::api::{DocumentChangeType, FirestoreClient, FirestoreSettings, ListenOptions, QuerySnapshot};
use firestore_offline_sync::core::Query;
use firestore_offline_sync::error::{permission_denied, FirestoreErrorCode};
use firestore_offline_sync::model::{DatabaseId, DocumentKey, FieldPath, Mutation, Precondition, ResourcePath, User};
use firestore_offline_sync::platform::runtime;
use firestore_offline_sync::remote::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, NoopTokenProvider, StreamKind, StreamingDatastoreImpl,
};
use firestore_offline_sync::util::RetrySettings;
use firestore_offline_sync::value::{FirestoreValue, MapValue};
use serde_json::{json, Value};

/// A client wired to an in-process backend the test drives by hand.
struct Backend {
    client: FirestoreClient,
    server: MultiplexedConnection,
}

impl Backend {
    async fn start() -> Self {
        let (client_side, server_side) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client_side));
        let settings = FirestoreSettings::new(DatabaseId::new("project", "(default)"))
            .with_retry(RetrySettings::default().with_initial_delay(Duration::from_millis(5)));
        let client = FirestoreClient::new(
            settings,
            Arc::new(StreamingDatastoreImpl::new(connection)),
            Arc::new(NoopTokenProvider),
        )
        .await
        .expect("start client");
        Self {
            client,
            server: MultiplexedConnection::new(server_side),
        }
    }

    async fn accept(&self, expected: StreamKind) -> MultiplexedStream {
        let (kind, stream) = self.server.accept_stream().await.expect("client stream");
        assert_eq!(kind, expected);
        stream
    }

    /// Answers the write handshake and returns the first write request.
    async fn accept_write(&self) -> (MultiplexedStream, Value) {
        let stream = self.accept(StreamKind::Write).await;
        next_json(&stream).await;
        send_json(&stream, json!({ "streamToken": "AQ==" })).await;
        let request = next_json(&stream).await;
        (stream, request)
    }
}

async fn next_json(stream: &MultiplexedStream) -> Value {
    serde_json::from_slice(&stream.next().await.expect("frame").expect("payload")).expect("json")
}

async fn send_json(stream: &MultiplexedStream, value: Value) {
    stream.send(serde_json::to_vec(&value).unwrap()).await.expect("send");
}

async fn spin_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        runtime::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn rooms() -> Query {
    Query::new(ResourcePath::from_string("rooms").unwrap())
}

fn set(path: &str, x: i64) -> Mutation {
    let mut fields = BTreeMap::new();
    fields.insert("x".to_string(), FirestoreValue::from_integer(x));
    Mutation::set(key(path), MapValue::new(fields), Precondition::None)
}

fn document_json(path: &str, seconds: i64) -> Value {
    json!({
        "name": format!("projects/project/databases/(default)/documents/{path}"),
        "fields": { "x": { "integerValue": "7" } },
        "updateTime": format!("1970-01-01T00:00:{seconds:02}Z"),
    })
}

fn ack(seconds: i64) -> Value {
    json!({
        "streamToken": "Ag==",
        "commitTime": format!("1970-01-01T00:00:{seconds:02}Z"),
        "writeResults": [{}],
    })
}

fn captured_listener() -> (
    Arc<Mutex<Vec<QuerySnapshot>>>,
    impl Fn(firestore_offline_sync::FirestoreResult<QuerySnapshot>) + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&events);
    (events, move |result| {
        if let Ok(snapshot) = result {
            captured.lock().unwrap().push(snapshot);
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_readable_at_once_and_settles_after_ack() {
    let backend = Backend::start().await;
    let client = &backend.client;
    client.disable_network().await.unwrap();

    let write = client.write(vec![set("rooms/a", 1)]).await.unwrap();
    let local = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
    assert!(local.exists());
    assert!(local.has_pending_writes());
    assert_eq!(
        local.get(&FieldPath::from_dot_separated("x").unwrap()),
        Some(&FirestoreValue::from_integer(1))
    );

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.wait_for_pending_writes().await }
    });
    assert!(write.try_result().is_none());

    client.enable_network().await.unwrap();
    let (stream, request) = backend.accept_write().await;
    assert_eq!(
        request["writes"][0]["update"]["name"],
        json!("projects/project/databases/(default)/documents/rooms/a")
    );
    send_json(&stream, ack(4)).await;

    write.acknowledged().await.unwrap();
    waiter.await.unwrap().unwrap();
    let settled = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
    assert!(settled.exists());
    assert!(!settled.has_pending_writes());
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_sees_local_writes_before_the_backend() {
    let backend = Backend::start().await;
    let client = &backend.client;
    client.disable_network().await.unwrap();

    let (events, observer) = captured_listener();
    let registration = client.listen(rooms(), ListenOptions::default(), observer).await.unwrap();
    spin_until(|| events.lock().unwrap().len() == 1).await;
    {
        let events = events.lock().unwrap();
        assert!(events[0].is_empty());
        assert!(events[0].metadata().from_cache());
    }

    client.write(vec![set("rooms/a", 1)]).await.unwrap();
    spin_until(|| events.lock().unwrap().len() == 2).await;
    {
        let events = events.lock().unwrap();
        let snapshot = &events[1];
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.metadata().has_pending_writes());
        assert_eq!(snapshot.doc_changes()[0].change_type, DocumentChangeType::Added);
        assert_eq!(snapshot.doc_changes()[0].new_index, Some(0));
    }

    registration.remove();
    client.write(vec![set("rooms/b", 2)]).await.unwrap();
    client.queue().drain().await.unwrap();
    assert_eq!(events.lock().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn first_snapshot_waits_for_the_backend_when_cache_is_empty() {
    let backend = Backend::start().await;
    let client = &backend.client;

    let (events, observer) = captured_listener();
    let _registration = client.listen(rooms(), ListenOptions::default(), observer).await.unwrap();
    let watch = backend.accept(StreamKind::Listen).await;
    let request = next_json(&watch).await;
    let target_id = request["addTarget"]["targetId"].clone();
    assert!(events.lock().unwrap().is_empty());

    send_json(&watch, json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] } })).await;
    send_json(
        &watch,
        json!({ "documentChange": { "document": document_json("rooms/a", 1), "targetIds": [target_id] } }),
    )
    .await;
    send_json(
        &watch,
        json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [target_id], "resumeToken": "AQ==" } }),
    )
    .await;
    send_json(&watch, json!({ "targetChange": { "readTime": "1970-01-01T00:00:02Z" } })).await;

    spin_until(|| !events.lock().unwrap().is_empty()).await;
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].metadata().from_cache());
    assert_eq!(events[0].documents()[0].id(), "a");
    assert!(!events[0].documents()[0].has_pending_writes());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_is_reverted_locally() {
    let backend = Backend::start().await;
    let client = &backend.client;

    let write = client.write(vec![set("rooms/a", 1)]).await.unwrap();
    let (stream, _) = backend.accept_write().await;
    stream.fail(permission_denied("missing permission")).await.unwrap();

    let err = write.acknowledged().await.unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
    let err = client.get_document_from_local_cache(key("rooms/a")).await.unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::Unavailable);
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_document_missing_from_target_is_resolved_through_limbo() {
    let backend = Backend::start().await;
    let client = &backend.client;

    let (events, observer) = captured_listener();
    let _registration = client.listen(rooms(), ListenOptions::default(), observer).await.unwrap();
    let watch = backend.accept(StreamKind::Listen).await;
    let request = next_json(&watch).await;
    let target_id = request["addTarget"]["targetId"].clone();
    send_json(&watch, json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] } })).await;
    send_json(
        &watch,
        json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [target_id], "resumeToken": "AQ==" } }),
    )
    .await;
    send_json(&watch, json!({ "targetChange": { "readTime": "1970-01-01T00:00:01Z" } })).await;
    spin_until(|| events.lock().unwrap().len() == 1).await;

    let write = client.write(vec![set("rooms/b", 1)]).await.unwrap();
    let (stream, _) = backend.accept_write().await;
    send_json(&stream, ack(2)).await;
    write.acknowledged().await.unwrap();

    // The committed document is not part of the synced target, so its
    // existence is checked with a dedicated document target.
    let limbo_request = next_json(&watch).await;
    let limbo_target = limbo_request["addTarget"]["targetId"].clone();
    assert_eq!(
        limbo_request["addTarget"]["documents"]["documents"],
        json!(["projects/project/databases/(default)/documents/rooms/b"])
    );
    let engine = Arc::clone(client.sync_engine());
    assert!(engine.active_limbo_document_keys().contains(&key("rooms/b")));

    // The backend answers without the document: it was deleted meanwhile.
    send_json(&watch, json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [limbo_target] } })).await;
    send_json(
        &watch,
        json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [limbo_target], "resumeToken": "Ag==" } }),
    )
    .await;
    send_json(&watch, json!({ "targetChange": { "readTime": "1970-01-01T00:00:03Z" } })).await;

    let release = next_json(&watch).await;
    assert_eq!(release["removeTarget"], limbo_target);
    spin_until(|| engine.active_limbo_document_keys().is_empty()).await;
    spin_until(|| events.lock().unwrap().last().is_some_and(|snapshot| snapshot.is_empty())).await;
    let deleted = client.get_document_from_local_cache(key("rooms/b")).await.unwrap();
    assert!(!deleted.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_user_cancels_the_previous_users_writes() {
    let backend = Backend::start().await;
    let client = &backend.client;
    client.disable_network().await.unwrap();

    let write = client.write(vec![set("rooms/a", 1)]).await.unwrap();
    client.set_user(User::authenticated("alice")).await.unwrap();

    let err = write.acknowledged().await.unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    let err = client.get_document_from_local_cache(key("rooms/a")).await.unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::Unavailable);

    client.set_user(User::anonymous()).await.unwrap();
    let restored = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
    assert!(restored.has_pending_writes());
}
