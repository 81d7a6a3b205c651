pub mod document_set;
pub mod event_manager;
pub mod filter;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_data;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use document_set::{DocumentComparator, DocumentSet};
pub use event_manager::{EventManager, ListenOptions, QueryListener, SnapshotObserver};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, FilterOperator};
pub use query::{Bound, Direction, LimitType, OrderBy, Query};
pub use sync_engine::{SyncEngine, SyncEngineConfig, SyncEngineListener, WriteCallback};
pub use target::Target;
pub use target_data::{TargetData, TargetPurpose};
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
