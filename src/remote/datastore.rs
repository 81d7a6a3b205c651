use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::FirestoreResult;
use crate::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamKind};

#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// One open duplex stream to the backend.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// `None` once the backend closed the stream cleanly.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the long-lived listen and write streams.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_stream(&self, kind: StreamKind) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        match kind {
            StreamKind::Listen => self.open_listen_stream(),
            StreamKind::Write => self.open_write_stream(),
        }
    }
}

/// [`StreamingDatastore`] over a [`MultiplexedConnection`].
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>) -> Self {
        Self { connection }
    }

    fn open(&self, kind: StreamKind) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let stream = connection.open_stream(kind).await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_listen_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(StreamKind::Listen)
    }

    fn open_write_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(StreamKind::Write)
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}

/// Source of a bearer token attached when a stream opens.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Forces the next `get_token` to fetch a fresh token.
    fn invalidate_token(&self);

    async fn heartbeat_header(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;
