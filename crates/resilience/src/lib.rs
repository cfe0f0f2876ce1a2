//! Client-side resilience layer for DocuChain operations.
//!
//! Wraps fallible asynchronous operations — uploads, document registration,
//! chain submissions — with automatic retry, adaptive backoff, and
//! per-operation circuit breaking, so transient failures are absorbed
//! instead of surfacing to the user or hammering an unreliable backend.
//!
//! # Components
//!
//! - [`classify`](classify::classify): pure mapping from a raw
//!   [`OperationError`] to a canonical [`ErrorKind`] and retry verdict
//! - [`BackoffPolicy`]: capped exponential backoff with fixed-window
//!   additive jitter
//! - [`RetryExecutor`]: the retry orchestrator, driving strictly sequential
//!   attempts and publishing lifecycle [`RetryEvent`]s
//! - [`CircuitBreakerRegistry`]: per-operation-identifier circuits that shed
//!   load while a backend is failing
//! - [`TransactionRetrier`]: chain-submission specialization that escalates
//!   the gas price after gas-related failures
//!
//! # Example
//!
//! ```rust,no_run
//! use docuchain_resilience::{OperationError, RetryConfig, RetryExecutor};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = RetryExecutor::new(RetryConfig::default());
//! let receipt = executor
//!     .execute(|| async { upload_document().await })
//!     .await?;
//! # Ok(())
//! # }
//! # async fn upload_document() -> Result<String, OperationError> { Ok(String::new()) }
//! ```
//!
//! The crate owns no storage and guarantees neither exactly-once execution
//! of wrapped operations nor circuit state persistence across restarts.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod error;
pub mod events;
pub mod retry;
pub mod transaction;

pub use backoff::{BackoffPolicy, JITTER_RANGE_MS};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_RESET_TIMEOUT,
};
pub use classify::classify;
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{
    ChainCode, ClassifiedError, ErrorKind, OperationError, RetryError, RetryResult,
};
pub use events::{ChannelSink, EventSink, NoopSink, RetryEvent, TracingSink};
pub use retry::{
    execute_with_retry, OnRetry, RetryConfig, RetryConfigBuilder, RetryExecutor,
    DEFAULT_MAX_RETRIES,
};
pub use transaction::{
    TransactionRetrier, TxRetryConfig, DEFAULT_GAS_MULTIPLIER, DEFAULT_TX_MAX_RETRIES,
};
