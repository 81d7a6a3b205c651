use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::{select, Either};

use crate::error::{cancelled, FirestoreResult};
use crate::platform::runtime::{self, box_future, BoxedFuture, MaybeSend};

type QueueTask = BoxedFuture<'static, ()>;

/// Identifies the kind of a delayed operation so tests and shutdown logic can
/// find it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamConnectionBackoff,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientLeaseRefresh,
    LruGarbageCollection,
    IndexBackfill,
}

struct DelayedEntry {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
    trigger: Sender<()>,
}

struct QueueInner {
    sender: Sender<QueueTask>,
    shutting_down: AtomicBool,
    next_delayed_id: AtomicU64,
    delayed: Mutex<BTreeMap<u64, DelayedEntry>>,
}

/// Serialized executor shared by every component of a client.
///
/// Operations run one at a time in submission order. An operation must never
/// await another operation enqueued on the same queue: the worker is busy
/// running the caller and the inner operation would never start.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let queue = Self {
            inner: Arc::new(QueueInner {
                sender,
                shutting_down: AtomicBool::new(false),
                next_delayed_id: AtomicU64::new(1),
                delayed: Mutex::new(BTreeMap::new()),
            }),
        };
        Self::start_worker(receiver);
        queue
    }

    fn start_worker(receiver: Receiver<QueueTask>) {
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
            log::debug!("async queue worker stopped");
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    fn push(&self, task: QueueTask) -> FirestoreResult<()> {
        self.inner
            .sender
            .try_send(task)
            .map_err(|_| cancelled("The client has already been terminated"))
    }

    /// Runs `op` on the queue and resolves with its result.
    pub async fn enqueue<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        if self.is_shutting_down() {
            return Err(cancelled("The client has already been terminated"));
        }
        self.enqueue_unchecked(op).await
    }

    async fn enqueue_unchecked<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        let (result_tx, result_rx) = async_channel::bounded(1);
        self.push(box_future(async move {
            let result = op.await;
            let _ = result_tx.send(result).await;
        }))?;
        result_rx
            .recv()
            .await
            .map_err(|_| cancelled("Queued operation was dropped"))?
    }

    /// Runs `op` on the queue without waiting for it.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + MaybeSend + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("dropping operation enqueued after shutdown");
            return;
        }
        if let Err(err) = self.push(box_future(op)) {
            log::debug!("failed to enqueue operation: {err}");
        }
    }

    /// Stops accepting new operations and runs `op` as the last one.
    pub async fn enqueue_and_initiate_shutdown<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(cancelled("The client has already been terminated"));
        }
        self.cancel_all_delayed_operations();
        let result = self.enqueue_unchecked(op).await;
        self.inner.sender.close();
        result
    }

    /// Schedules `op` to run on the queue after `delay`.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: Future<Output = ()> + MaybeSend + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let cancelled_flag = Arc::new(AtomicBool::new(false));
        let (trigger_tx, trigger_rx) = async_channel::bounded(1);
        let operation = DelayedOperation {
            id,
            timer_id,
            cancelled: Arc::clone(&cancelled_flag),
            trigger: trigger_tx.clone(),
            queue: Arc::downgrade(&self.inner),
        };

        if self.is_shutting_down() {
            cancelled_flag.store(true, Ordering::SeqCst);
            return operation;
        }

        if let Ok(mut delayed) = self.inner.delayed.lock() {
            delayed.insert(
                id,
                DelayedEntry {
                    timer_id,
                    cancelled: Arc::clone(&cancelled_flag),
                    trigger: trigger_tx,
                },
            );
        }

        let queue = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            let timer = Box::pin(runtime::sleep(delay));
            let early = Box::pin(async move {
                let _ = trigger_rx.recv().await;
            });
            if let Either::Right(_) = select(timer, early).await {
                log::debug!("running delayed operation {timer_id:?} early");
            }
            let Some(inner) = queue.upgrade() else {
                return;
            };
            let flag = Arc::clone(&cancelled_flag);
            let weak = Arc::downgrade(&inner);
            let task = box_future(async move {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut delayed) = inner.delayed.lock() {
                        delayed.remove(&id);
                    }
                }
                if !flag.load(Ordering::SeqCst) {
                    op.await;
                }
            });
            if !cancelled_flag.load(Ordering::SeqCst) {
                let _ = inner.sender.try_send(task);
            }
        });

        operation
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .delayed
            .lock()
            .map(|delayed| {
                delayed
                    .values()
                    .any(|entry| entry.timer_id == timer_id && !entry.cancelled.load(Ordering::SeqCst))
            })
            .unwrap_or(false)
    }

    /// Fires every pending delayed operation with `timer_id` without waiting
    /// for its delay to elapse.
    pub fn run_delayed_operations_early(&self, timer_id: TimerId) {
        if let Ok(delayed) = self.inner.delayed.lock() {
            for entry in delayed.values().filter(|entry| entry.timer_id == timer_id) {
                let _ = entry.trigger.try_send(());
            }
        }
    }

    fn cancel_all_delayed_operations(&self) {
        if let Ok(mut delayed) = self.inner.delayed.lock() {
            for entry in delayed.values() {
                entry.cancelled.store(true, Ordering::SeqCst);
                let _ = entry.trigger.try_send(());
            }
            delayed.clear();
        }
    }

    /// Resolves once every operation enqueued before the call has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue(async { Ok(()) }).await
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
    trigger: Sender<()>,
    queue: Weak<QueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. A no-op once it already ran.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.trigger.try_send(());
        if let Some(inner) = self.queue.upgrade() {
            if let Ok(mut delayed) = inner.delayed.lock() {
                delayed.remove(&self.id);
            }
        }
    }
}
