//! Shared helpers: the crate-wide error, logger setup and retry policies.

pub mod error;
pub mod logging;
pub mod retry;

pub use error::ReplogError;
pub use logging::{init_logging, init_test_logging, DEFAULT_LOG_FILTER};
pub use retry::{RetryHandle, RetryPolicy, RetryStrategy};
