use std::fmt;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::constants::{
    CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS, MINIMUM_CACHE_SIZE_BYTES,
};
use crate::error::{invalid_argument, FirestoreResult};
use crate::local::{GcSchedule, IndexAutoCreationSettings, KvStore, LeaseSettings, LocalStoreSettings, LruParams};
use crate::model::DatabaseId;
use crate::util::RetrySettings;

/// Where the local cache lives.
///
/// Without a store the cache is kept in memory and lost with the client.
/// Clients that share one store elect a primary through the client lease.
#[derive(Clone, Default)]
pub struct PersistenceSettings {
    pub store: Option<Arc<dyn KvStore>>,
    /// Stable identity of this client in the shared store. A random id is
    /// generated when unset.
    pub client_id: Option<String>,
}

impl PersistenceSettings {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub(crate) fn resolve_client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(generate_client_id)
    }
}

impl fmt::Debug for PersistenceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceSettings")
            .field("store", &self.store.as_ref().map(|_| "KvStore"))
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct FirestoreSettings {
    pub database_id: DatabaseId,
    pub persistence: PersistenceSettings,
    /// Cache size that triggers LRU garbage collection, or
    /// [`CACHE_SIZE_UNLIMITED`].
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    pub index_auto_creation: IndexAutoCreationSettings,
    /// Backoff of the watch and write streams.
    pub retry: RetrySettings,
    pub lease: LeaseSettings,
    pub gc_schedule: GcSchedule,
}

impl FirestoreSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            persistence: PersistenceSettings::default(),
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            index_auto_creation: IndexAutoCreationSettings::default(),
            retry: RetrySettings::default(),
            lease: LeaseSettings::default(),
            gc_schedule: GcSchedule::default(),
        }
    }

    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    /// Fails when `bytes` is below the 1 MiB minimum and not
    /// [`CACHE_SIZE_UNLIMITED`].
    pub fn with_cache_size_bytes(mut self, bytes: i64) -> FirestoreResult<Self> {
        if bytes != CACHE_SIZE_UNLIMITED && bytes < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        self.cache_size_bytes = bytes;
        Ok(self)
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_index_auto_creation(mut self, settings: IndexAutoCreationSettings) -> Self {
        self.index_auto_creation = settings;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease(mut self, lease: LeaseSettings) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_gc_schedule(mut self, schedule: GcSchedule) -> Self {
        self.gc_schedule = schedule;
        self
    }

    pub(crate) fn local_store_settings(&self) -> LocalStoreSettings {
        LocalStoreSettings {
            lru_params: LruParams::with_cache_size(self.cache_size_bytes),
            index_auto_creation: self.index_auto_creation,
        }
    }
}

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(20)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreErrorCode;
    use std::time::Duration;

    fn settings() -> FirestoreSettings {
        FirestoreSettings::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn defaults() {
        let settings = settings();
        assert_eq!(settings.cache_size_bytes, 40 * 1024 * 1024);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.lease.refresh_interval, Duration::from_secs(4));
        assert_eq!(settings.gc_schedule.initial_delay, Duration::from_secs(60));
        assert!(settings.persistence.store.is_none());
    }

    #[test]
    fn cache_size_has_a_floor() {
        let err = settings().with_cache_size_bytes(1024).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);

        let unlimited = settings().with_cache_size_bytes(CACHE_SIZE_UNLIMITED).unwrap();
        assert_eq!(
            unlimited.local_store_settings().lru_params,
            LruParams::disabled()
        );
        assert!(settings().with_cache_size_bytes(MINIMUM_CACHE_SIZE_BYTES).is_ok());
    }

    #[test]
    fn generated_client_ids_differ() {
        let persistence = PersistenceSettings::memory();
        assert_ne!(persistence.resolve_client_id(), persistence.resolve_client_id());
        assert_eq!(
            persistence.with_client_id("tab-1").resolve_client_id(),
            "tab-1"
        );
    }
}
