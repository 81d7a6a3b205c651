#![doc = include_str!("RUSTDOC.md")]

pub mod api;
pub mod constants;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod util;
pub mod value;

pub use api::{
    DocumentChange, DocumentChangeType, DocumentSnapshot, FirestoreClient, FirestoreSettings,
    ListenOptions, ListenerRegistration, PendingWrite, QuerySnapshot, SnapshotMetadata,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
