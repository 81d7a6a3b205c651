pub mod bloom_filter;
pub mod connectivity;
pub mod datastore;
pub mod network;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterError};
pub use connectivity::{ConnectivityMonitor, ManualConnectivityMonitor, NetworkStatus, NoopConnectivityMonitor};
pub use datastore::{
    NoopTokenProvider, StreamHandle, StreamingDatastore, StreamingDatastoreImpl, TokenProvider, TokenProviderArc,
};
pub use network::{NetworkLayer, NetworkLayerBuilder, StreamCredentials};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use serializer::JsonProtoSerializer;
pub use stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamKind, StreamTransport};
pub use watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
