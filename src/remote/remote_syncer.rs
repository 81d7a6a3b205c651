use futures::FutureExt;

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{BatchId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, User};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::RemoteEvent;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// What the remote store needs from the layer above it.
///
/// Every call happens on the client's async queue. Implementations must not
/// call back into the remote store while holding their own locks.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot assembled from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused to serve `target_id`.
    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend permanently rejected `batch_id`.
    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError)
        -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the backend is known to consider part of `target_id`.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// First pending batch with an id above `after_batch_id`.
    fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>>;

    /// Snapshot version of the last remote event applied locally.
    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion>;

    fn last_stream_token(&self) -> FirestoreResult<Vec<u8>>;

    fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()>;

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()>;

    /// Switches local state to `user`. Runs while both streams are stopped.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;
}
