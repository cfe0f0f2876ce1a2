//! Pure failure classifier
//!
//! Maps a raw [`OperationError`] into a [`ClassifiedError`] using a fixed
//! precedence order: explicit kind tag, transport status code, chain provider
//! code, then message text. The first matching source of evidence wins.
//!
//! The function has no side effects and is deterministic for identical input,
//! which keeps retry decisions reproducible in tests.

use crate::error::{ChainCode, ClassifiedError, ErrorKind, OperationError};

/// Transport status codes that indicate a transient server-side condition.
const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Message fragments that mark an otherwise unidentified failure as
/// transient. Matched case-insensitively.
const TRANSIENT_MESSAGE_PATTERNS: [&str; 5] =
    ["network error", "timeout", "rate limit", "congestion", "temporary"];

/// Classify a raw failure into a canonical kind and retry verdict.
pub fn classify(error: OperationError) -> ClassifiedError {
    // 1. Explicit kind tag from the operation itself.
    if let Some(kind) = error.kind {
        return ClassifiedError { kind, retryable: kind.is_retryable_by_default(), source: error };
    }

    // 2. Transport status code.
    if let Some(status) = error.status {
        let (kind, retryable) = if status == 429 {
            (ErrorKind::RateLimited, true)
        } else if RETRYABLE_STATUS_CODES.contains(&status) {
            (ErrorKind::Server, true)
        } else {
            (ErrorKind::Unknown, false)
        };
        return ClassifiedError { kind, retryable, source: error };
    }

    // 3. Chain provider code. All recognized codes describe retryable
    // conditions; underpriced and expired-nonce submissions are retried with
    // adjusted parameters by the transaction retrier.
    if let Some(code) = error.code {
        let kind = match code {
            ChainCode::NetworkError => ErrorKind::Network,
            ChainCode::Timeout => ErrorKind::Timeout,
            ChainCode::ServerError => ErrorKind::Server,
            ChainCode::ReplacementUnderpriced => ErrorKind::GasUnderpriced,
            ChainCode::NonceExpired => ErrorKind::NonceExpired,
        };
        return ClassifiedError { kind, retryable: true, source: error };
    }

    // 4. Fall back to message text.
    let lowered = error.message.to_lowercase();
    let retryable = TRANSIENT_MESSAGE_PATTERNS.iter().any(|pattern| lowered.contains(pattern));
    ClassifiedError { kind: ErrorKind::Unknown, retryable, source: error }
}
