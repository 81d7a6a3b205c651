use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::remote::datastore::StreamHandle;
use crate::remote::network::{NetworkLayer, NetworkStreamHandler, StreamCredentials};
use crate::remote::serializer::{decode_bytes, JsonProtoSerializer};
use crate::remote::stream::{PersistentStreamHandle, StreamState};

/// Receives events of one write stream incarnation.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    /// The stream is open; the delegate must send the handshake.
    async fn on_write_stream_open(&self);

    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()>;

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()>;

    /// `handshake_complete` tells whether the failure hit an in-flight write
    /// or the handshake itself.
    async fn on_write_stream_close(&self, error: Option<FirestoreError>, handshake_complete: bool);
}

#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// The long-lived write stream. A handshake establishes the stream token;
/// each later request carries the latest token and one batch of writes.
pub struct WriteStream<D>
where
    D: WriteStreamDelegate,
{
    handler: Arc<WriteStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> WriteStream<D>
where
    D: WriteStreamDelegate,
{
    pub fn start(layer: &NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let handler = Arc::new(WriteStreamHandler {
            serializer,
            delegate,
            state: Mutex::new(WriteStreamState {
                stream: None,
                handshake_complete: false,
                last_stream_token: Vec::new(),
            }),
            running: AtomicBool::new(true),
        });
        let handle = layer.write(Arc::clone(&handler));
        Self { handler, handle }
    }

    pub async fn is_open(&self) -> bool {
        self.handler.state.lock().await.stream.is_some()
    }

    pub async fn handshake_complete(&self) -> bool {
        self.handler.state.lock().await.handshake_complete
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    /// Sends the initial request, resuming from `stream_token` when the
    /// client persisted one.
    pub async fn write_handshake(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let stream = {
            let mut state = self.handler.state.lock().await;
            if state.handshake_complete {
                return Err(failed_precondition("Handshake already completed"));
            }
            state.last_stream_token = stream_token;
            state.stream.clone().ok_or_else(|| internal_error("Write stream is not open"))?
        };
        let mut request = serde_json::Map::new();
        request.insert("database".to_string(), json!(self.handler.serializer.database_name()));
        let token = self.handler.state.lock().await.last_stream_token.clone();
        if !token.is_empty() {
            request.insert("streamToken".to_string(), json!(BASE64_STANDARD.encode(token)));
        }
        send_json(stream.as_ref(), &JsonValue::Object(request)).await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let (stream, token) = {
            let state = self.handler.state.lock().await;
            if !state.handshake_complete {
                return Err(failed_precondition("Handshake must complete before writing mutations"));
            }
            let stream = state.stream.clone().ok_or_else(|| internal_error("Write stream is not open"))?;
            (stream, state.last_stream_token.clone())
        };
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.handler.serializer.encode_mutation(mutation))
            .collect();
        let request = json!({
            "streamToken": BASE64_STANDARD.encode(token),
            "writes": writes,
        });
        send_json(stream.as_ref(), &request).await
    }

    pub fn inhibit_backoff(&self) {
        self.handle.inhibit_backoff();
    }

    pub fn stop(&self) {
        self.handler.running.store(false, Ordering::SeqCst);
        self.handle.stop();
    }
}

async fn send_json(stream: &dyn StreamHandle, request: &JsonValue) -> FirestoreResult<()> {
    let bytes =
        serde_json::to_vec(request).map_err(|err| internal_error(format!("Failed to encode write request: {err}")))?;
    stream.send(bytes).await
}

struct WriteStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

struct WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    serializer: JsonProtoSerializer,
    delegate: Arc<D>,
    state: Mutex<WriteStreamState>,
    running: AtomicBool,
}

impl<D> WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn decode_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = decode_bytes(value.get("streamToken"))?;
        let commit_version = match value.get("commitTime") {
            Some(commit_time) => self.serializer.decode_version(commit_time)?,
            None => SnapshotVersion::min(),
        };
        let mutation_results = match value.get("writeResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(|result| self.serializer.decode_write_result(result, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }

    async fn close_with(&self, error: Option<FirestoreError>) {
        let handshake_complete = {
            let mut state = self.state.lock().await;
            state.stream = None;
            std::mem::replace(&mut state.handshake_complete, false)
        };
        if self.is_running() {
            self.delegate.on_write_stream_close(error, handshake_complete).await;
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<D> NetworkStreamHandler for WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn label(&self) -> &'static str {
        "write"
    }

    fn should_continue(&self) -> bool {
        self.is_running()
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, _credentials: StreamCredentials) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.stream = Some(stream);
            state.handshake_complete = false;
        }
        if self.is_running() {
            self.delegate.on_write_stream_open().await;
        }
        Ok(())
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("Failed to decode write response: {err}")))?;
        let response = self.decode_response(&value)?;

        let was_handshake = {
            let mut state = self.state.lock().await;
            state.last_stream_token = response.stream_token.clone();
            !std::mem::replace(&mut state.handshake_complete, true)
        };

        if was_handshake {
            self.delegate.on_handshake_complete(response.stream_token).await
        } else {
            self.delegate.on_write_response(response).await
        }
    }

    async fn on_close(&self) {
        self.close_with(None).await;
    }

    async fn on_error(&self, error: FirestoreError) {
        self.close_with(Some(error)).await;
    }
}
