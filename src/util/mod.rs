pub mod assert;
pub mod async_queue;
pub mod backoff;

pub use assert::{fail, hard_assert};
pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::{ExponentialBackoff, RetrySettings};
