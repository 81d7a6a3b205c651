pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Reserved document field used by queries to order and filter on the key.
pub const DOCUMENT_KEY_FIELD: &str = "__name__";

/// Sentinel meaning "never collect garbage" for the cache size setting.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Batch id used before any batch exists; acknowledged ids are always larger.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// Sequence number reported when no transaction has assigned one.
pub const INVALID_SEQUENCE_NUMBER: i64 = -1;

/// Minimum time between persisted resume token updates for a target.
pub const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;
