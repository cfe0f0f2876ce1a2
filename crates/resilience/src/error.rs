//! Error vocabulary shared across the resilience layer
//!
//! Three layers of error information flow through the crate:
//!
//! 1. **`OperationError`**: the structured raw failure a wrapped operation
//!    reports. It carries the optional kind tag, transport status and chain
//!    provider code that the classifier understands, replacing the ad hoc
//!    duck-typed error shape of earlier clients.
//!
//! 2. **`ClassifiedError`**: the classifier's verdict — a canonical
//!    [`ErrorKind`] plus a retryable flag, wrapping the raw failure. Produced
//!    fresh per failure and never persisted.
//!
//! 3. **`RetryError`**: the terminal error surface of the retry executor and
//!    circuit breaker registry. Every terminal path (non-retryable failure,
//!    exhaustion, open circuit, cancellation) resolves to exactly one variant
//!    with the classified failure attached where one exists.

use std::fmt;

use thiserror::Error;

/// Canonical failure categories recognized by the resilience layer.
///
/// This is a closed enumeration: the classifier maps every raw failure into
/// exactly one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection-level failure reaching the backend or chain RPC
    Network,
    /// The operation or transport timed out
    Timeout,
    /// Backend responded with a server-side failure
    Server,
    /// Backend throttled the caller
    RateLimited,
    /// Chain mempool congestion delayed or dropped the transaction
    Congestion,
    /// Transaction was rejected for offering too low a gas price
    GasUnderpriced,
    /// Transaction nonce was already consumed or expired
    NonceExpired,
    /// Input rejected by validation; retrying cannot help
    Validation,
    /// Anything the classifier could not identify
    Unknown,
}

impl ErrorKind {
    /// Whether this kind is retryable absent any other evidence.
    ///
    /// The baked-in retryable subset covers transient transport and chain
    /// conditions; gas and nonce failures are handled by the transaction
    /// retrier through chain codes rather than this set.
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Server | Self::RateLimited | Self::Congestion
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network_error",
            Self::Timeout => "timeout",
            Self::Server => "server_error",
            Self::RateLimited => "rate_limited",
            Self::Congestion => "congestion",
            Self::GasUnderpriced => "gas_underpriced",
            Self::NonceExpired => "nonce_expired",
            Self::Validation => "validation_error",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Chain provider error codes the classifier recognizes.
///
/// These mirror the code strings EVM JSON-RPC providers attach to failed
/// submissions. All of them describe conditions worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainCode {
    NetworkError,
    Timeout,
    ServerError,
    ReplacementUnderpriced,
    NonceExpired,
}

impl fmt::Display for ChainCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ServerError => "SERVER_ERROR",
            Self::ReplacementUnderpriced => "REPLACEMENT_UNDERPRICED",
            Self::NonceExpired => "NONCE_EXPIRED",
        };
        write!(f, "{code}")
    }
}

/// Structured raw failure reported by a wrapped operation.
///
/// Every field besides the message is optional; the classifier consults them
/// in a fixed precedence order (kind tag, transport status, chain code,
/// message text).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct OperationError {
    /// Human-readable description of the failure
    pub message: String,
    /// Explicit kind tag, when the operation already knows its category
    pub kind: Option<ErrorKind>,
    /// HTTP status code from the transport, when one exists
    pub status: Option<u16>,
    /// Chain provider error code, when the failure came from an RPC node
    pub code: Option<ChainCode>,
}

impl OperationError {
    /// Create a raw failure carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), kind: None, status: None, code: None }
    }

    /// Attach an explicit kind tag.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Attach a transport status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a chain provider error code.
    pub fn with_code(mut self, code: ChainCode) -> Self {
        self.code = Some(code);
        self
    }
}

/// A raw failure together with the classifier's verdict.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {source}")]
pub struct ClassifiedError {
    /// Canonical category this failure was mapped to
    pub kind: ErrorKind,
    /// Whether the retry executor may attempt the operation again
    pub retryable: bool,
    /// The raw failure that was classified
    #[source]
    pub source: OperationError,
}

/// Terminal errors surfaced by the retry executor and circuit breaker
/// registry.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every allowed attempt failed with a retryable error
    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: ClassifiedError },

    /// The operation failed with an error classification that forbids retry
    #[error("non-retryable failure: {0}")]
    NonRetryable(ClassifiedError),

    /// The circuit for this operation identifier is open and shedding load
    #[error("circuit open for operation `{operation_id}`")]
    CircuitOpen { operation_id: String },

    /// The caller's cancellation token fired mid-sequence
    #[error("retry sequence cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    /// Configuration failed validation
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl RetryError {
    /// The classified failure behind this terminal error, when one exists.
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::NonRetryable(classified) => Some(classified),
            Self::CircuitOpen { .. } | Self::Cancelled { .. } | Self::InvalidConfig { .. } => None,
        }
    }
}

/// Result type for retry operations.
pub type RetryResult<T> = Result<T, RetryError>;
