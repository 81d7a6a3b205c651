use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::{select, Either};

use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::remote::datastore::{StreamHandle, StreamingDatastore, StreamingFuture};
use crate::remote::stream::StreamKind;
use crate::util::{ExponentialBackoff, RetrySettings};

/// Connection state of a persistent stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Starting,
    Open,
    Error,
    Backoff,
    Closed,
}

pub trait PersistentStreamDelegate: Send + Sync + 'static {
    fn stream_label(&self) -> &'static str;

    fn on_stream_open(&self, stream: Arc<dyn StreamHandle>) -> StreamingFuture<'_, FirestoreResult<()>>;

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// The backend closed the stream without an error.
    fn on_stream_close(&self) -> StreamingFuture<'_, ()>;

    fn on_stream_error(&self, error: FirestoreError) -> StreamingFuture<'_, ()>;

    fn should_continue(&self) -> bool;
}

struct StreamShared {
    running: AtomicBool,
    inhibit_backoff: AtomicBool,
    state: Mutex<StreamState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// Keeps one logical stream connected, reopening it with exponential
/// backoff after failures until stopped.
pub struct PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    datastore: Arc<dyn StreamingDatastore>,
    delegate: Arc<D>,
    backoff: ExponentialBackoff,
    kind: StreamKind,
    shared: Arc<StreamShared>,
}

enum StreamOutcome {
    Stopped,
    Closed,
    Failed(FirestoreError),
}

impl<D> PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    pub fn new(datastore: Arc<dyn StreamingDatastore>, delegate: Arc<D>, retry: RetrySettings, kind: StreamKind) -> Self {
        let (wake_tx, wake_rx) = async_channel::bounded(1);
        Self {
            datastore,
            delegate,
            backoff: ExponentialBackoff::new(retry),
            kind,
            shared: Arc::new(StreamShared {
                running: AtomicBool::new(true),
                inhibit_backoff: AtomicBool::new(false),
                state: Mutex::new(StreamState::Initial),
                wake_tx,
                wake_rx,
            }),
        }
    }

    pub fn start(self) -> PersistentStreamHandle {
        let handle = PersistentStreamHandle {
            shared: Arc::clone(&self.shared),
        };
        runtime::spawn_detached(async move {
            self.run().await;
        });
        handle
    }

    fn is_active(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && self.delegate.should_continue()
    }

    fn transition(&self, next: StreamState) {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            log::debug!("{} stream: {:?} -> {:?}", self.delegate.stream_label(), *state, next);
            *state = next;
        }
    }

    async fn run(mut self) {
        while self.is_active() {
            self.transition(StreamState::Starting);
            let stream = match self.datastore.open_stream(self.kind).await {
                Ok(stream) => stream,
                Err(err) => {
                    if !self.handle_failure(err).await {
                        break;
                    }
                    continue;
                }
            };

            if !self.is_active() {
                let _ = stream.close().await;
                break;
            }

            if let Err(err) = self.delegate.on_stream_open(Arc::clone(&stream)).await {
                let _ = stream.close().await;
                if !self.handle_failure(err).await {
                    break;
                }
                continue;
            }
            self.transition(StreamState::Open);

            match self.process_stream(stream).await {
                StreamOutcome::Stopped => break,
                StreamOutcome::Closed => {
                    self.transition(StreamState::Initial);
                    self.delegate.on_stream_close().await;
                    if !self.back_off().await {
                        break;
                    }
                }
                StreamOutcome::Failed(err) => {
                    if !self.handle_failure(err).await {
                        break;
                    }
                }
            }
        }
        self.transition(StreamState::Closed);
    }

    async fn process_stream(&mut self, stream: Arc<dyn StreamHandle>) -> StreamOutcome {
        let wake_rx = self.shared.wake_rx.clone();
        loop {
            if !self.is_active() {
                let _ = stream.close().await;
                return StreamOutcome::Stopped;
            }

            let event = match select(stream.next(), Box::pin(wake_rx.recv())).await {
                Either::Left((event, _)) => Some(event),
                Either::Right(_) => None,
            };
            match event {
                None => continue,
                Some(Some(Ok(payload))) => {
                    // A message proves the connection healthy.
                    self.backoff.reset();
                    if let Err(err) = self.delegate.on_stream_message(payload).await {
                        let _ = stream.close().await;
                        return StreamOutcome::Failed(err);
                    }
                }
                Some(Some(Err(err))) => return StreamOutcome::Failed(err),
                Some(None) => return StreamOutcome::Closed,
            }
        }
    }

    async fn handle_failure(&mut self, error: FirestoreError) -> bool {
        self.transition(StreamState::Error);
        if error.code == FirestoreErrorCode::ResourceExhausted {
            log::debug!(
                "{} stream: backend reported resource exhaustion, backing off at maximum delay",
                self.delegate.stream_label()
            );
            self.backoff.reset_to_max();
        }
        self.delegate.on_stream_error(error).await;
        self.back_off().await
    }

    async fn back_off(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        let label = self.delegate.stream_label();
        if self.shared.inhibit_backoff.swap(false, Ordering::SeqCst) {
            self.backoff.reset();
        }
        let Some(delay) = self.backoff.next_delay() else {
            log::warn!("{label} stream exhausted retries");
            return false;
        };
        self.transition(StreamState::Backoff);
        log::debug!("{label} stream: reconnecting in {delay:?} (attempt {})", self.backoff.attempts());
        self.wait(delay).await;
        self.is_active()
    }

    async fn wait(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let timer = Box::pin(runtime::sleep(delay));
        let wake = Box::pin(self.shared.wake_rx.recv());
        if let Either::Right(_) = select(timer, wake).await {
            self.shared.inhibit_backoff.store(false, Ordering::SeqCst);
            log::debug!("{} stream: backoff cut short", self.delegate.stream_label());
        }
    }
}

/// Controls a started [`PersistentStream`].
#[derive(Clone)]
pub struct PersistentStreamHandle {
    shared: Arc<StreamShared>,
}

impl PersistentStreamHandle {
    /// Closes the stream and stops reconnecting.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.wake_tx.try_send(());
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next reconnect immediate, cutting short a pending backoff.
    pub fn skip_backoff(&self) {
        self.shared.inhibit_backoff.store(true, Ordering::SeqCst);
        let _ = self.shared.wake_tx.try_send(());
    }

    /// Makes the next reconnect after a failure immediate.
    pub fn inhibit_backoff(&self) {
        self.shared.inhibit_backoff.store(true, Ordering::SeqCst);
    }
}
