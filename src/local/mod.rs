pub mod client_lease;
pub mod document_overlay_cache;
pub mod index_backfiller;
pub mod index_manager;
pub mod index_value_writer;
pub mod kv_store;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;

#[doc(inline)]
pub use client_lease::{ClientLease, ClientMetadata, LeaseSettings};
#[doc(inline)]
pub use document_overlay_cache::DocumentOverlayCache;
#[doc(inline)]
pub use index_backfiller::IndexBackfiller;
#[doc(inline)]
pub use index_manager::{IndexManager, IndexType};
#[doc(inline)]
pub use kv_store::{KvStore, KvTransaction, MemoryKvStore, TransactionMode};
#[doc(inline)]
pub use local_documents_view::{LocalDocumentsResult, LocalDocumentsView};
#[doc(inline)]
pub use local_store::{
    LocalStore, LocalStoreSettings, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
#[doc(inline)]
pub use lru_garbage_collector::{GcSchedule, LruGarbageCollector, LruParams, LruResults};
#[doc(inline)]
pub use mutation_queue::{BatchState, MutationQueue};
#[doc(inline)]
pub use persistence::{Persistence, Transaction};
#[doc(inline)]
pub use query_engine::{IndexAutoCreationSettings, QueryContext, QueryEngine};
#[doc(inline)]
pub use reference_set::ReferenceSet;
#[doc(inline)]
pub use remote_document_cache::RemoteDocumentCache;
#[doc(inline)]
pub use target_cache::TargetCache;
