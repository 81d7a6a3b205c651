mod client;
mod listener;
mod settings;
mod snapshot;

pub use crate::core::ListenOptions;
pub use client::{FirestoreClient, FirestoreClientBuilder, PendingWrite};
pub use listener::ListenerRegistration;
pub use settings::{FirestoreSettings, PersistenceSettings};
pub use snapshot::{DocumentChange, DocumentChangeType, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
