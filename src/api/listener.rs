use std::sync::Arc;

use crate::api::client::FirestoreClient;
use crate::core::QueryListener;

/// Handle of an active snapshot listener.
///
/// Dropping the handle removes the listener. No event is delivered after
/// [`ListenerRegistration::remove`] returns.
pub struct ListenerRegistration {
    client: FirestoreClient,
    listener: Arc<QueryListener>,
    detached: bool,
}

impl ListenerRegistration {
    pub(crate) fn new(client: FirestoreClient, listener: Arc<QueryListener>) -> Self {
        Self {
            client,
            listener,
            detached: false,
        }
    }

    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.listener.mute();
        self.client.unlisten(Arc::clone(&self.listener));
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}
