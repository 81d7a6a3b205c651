use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::error::{internal_error, FirestoreError, FirestoreResult};
use crate::platform::runtime;

mod persistent;

pub use persistent::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamState,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Which backend service a stream talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamKind),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, kind: StreamKind) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(kind),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Opaque duplex channel carrying frames for many logical streams.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Runs many logical streams over one [`StreamTransport`].
///
/// Streams opened locally get fresh ids; an `Open` frame for an id the
/// connection has never seen is surfaced through
/// [`accept_stream`](Self::accept_stream), which is how the serving side of
/// a connection learns about new streams.
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted: Receiver<(StreamKind, MultiplexedStream)>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accept_tx, accept_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            accepted: accept_rx,
        };

        Self::start_outbound_loop(Arc::clone(&transport), outbound_rx);
        manager.start_inbound_loop(transport, accept_tx);
        manager
    }

    fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(
        &self,
        transport: Arc<dyn StreamTransport>,
        accept_tx: Sender<(StreamKind, MultiplexedStream)>,
    ) {
        let handle = self.clone_handle();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err}");
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                let event = frame.kind().clone();
                let maybe_sender = handle.sender_for(stream_id);
                match (maybe_sender, event) {
                    (None, FrameKind::Open(kind)) => {
                        let stream = handle.register(stream_id);
                        if accept_tx.send((kind, stream)).await.is_err() {
                            log::debug!("no acceptor for inbound {} stream {}", kind.label(), stream_id.value());
                        }
                    }
                    (None, _) => {
                        log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    }
                    (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                        let _ = sender.send(event).await;
                        handle.forget(stream_id);
                    }
                    (Some(sender), event) => {
                        if let Err(err) = sender.send(event).await {
                            log::debug!("dropping inbound frame for closed stream {}: {err}", stream_id.value());
                        }
                    }
                }
            }
        });
    }

    pub async fn open_stream(&self, kind: StreamKind) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let stream = self.clone_handle().register(stream_id);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, kind))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(stream)
    }

    /// Waits for the peer to open a stream. `None` once the transport is gone.
    pub async fn accept_stream(&self) -> Option<(StreamKind, MultiplexedStream)> {
        self.accepted.recv().await.ok()
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
}

impl MultiplexedConnectionHandle {
    fn register(&self, stream_id: StreamId) -> MultiplexedStream {
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream_id, inbound_tx);
        MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            manager: self.clone(),
        }
    }

    fn sender_for(&self, stream_id: StreamId) -> Option<Sender<FrameKind>> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stream_id)
            .cloned()
    }

    fn forget(&self, stream_id: StreamId) -> bool {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stream_id)
            .is_some()
    }

    pub fn close_stream(&self, stream_id: StreamId) {
        if self.forget(stream_id) {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    /// Terminates the stream with an error the peer receives from `next`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.manager.forget(self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        if !self.manager.forget(self.id) {
            return Ok(());
        }
        self.outbound
            .send(TransportFrame::close(self.id))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue close frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| internal_error(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| internal_error(format!("loopback transport recv failed: {err}")))
    }
}
