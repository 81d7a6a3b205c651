use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Available,
    Unavailable,
}

pub type ConnectivityCallback = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Source of platform network reachability events. The remote store restarts
/// its streams immediately when the network comes back instead of waiting
/// out the backoff.
pub trait ConnectivityMonitor: Send + Sync + 'static {
    fn add_callback(&self, callback: ConnectivityCallback);

    fn shutdown(&self) {}
}

/// Never reports a change.
#[derive(Default)]
pub struct NoopConnectivityMonitor;

impl ConnectivityMonitor for NoopConnectivityMonitor {
    fn add_callback(&self, _callback: ConnectivityCallback) {}
}

/// Reports whatever status the embedder sets.
#[derive(Default)]
pub struct ManualConnectivityMonitor {
    callbacks: Mutex<Vec<ConnectivityCallback>>,
}

impl ManualConnectivityMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, status: NetworkStatus) {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).clone();
        log::debug!("network status changed to {status:?}");
        for callback in callbacks {
            callback(status);
        }
    }
}

impl ConnectivityMonitor for ManualConnectivityMonitor {
    fn add_callback(&self, callback: ConnectivityCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn shutdown(&self) {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
