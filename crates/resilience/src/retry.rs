//! Retry orchestrator
//!
//! [`RetryExecutor`] drives a wrapped asynchronous operation through up to
//! `max_retries + 1` strictly sequential attempts. After each failure it
//! consults the classifier for a retry verdict and the backoff policy for a
//! wait, and publishes lifecycle events so a notification layer can react.
//! Attempt N+1 never starts before attempt N's outcome is known and its
//! backoff delay has elapsed.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::classify::classify;
use crate::error::{ClassifiedError, ErrorKind, OperationError, RetryError, RetryResult};
use crate::events::{EventSink, NoopSink, RetryEvent};

/// Default retry budget for generic operations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Callback invoked with the attempt index before each backoff wait.
pub type OnRetry = Arc<dyn Fn(u32) + Send + Sync>;

/// Configuration for a retry sequence.
///
/// `max_retries` bounds the retries, so the total number of attempts is
/// `max_retries + 1`. An empty `retryable_kinds` set defers entirely to the
/// classifier's verdict; a non-empty set additionally restricts retries to
/// the listed kinds.
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// Backoff schedule between attempts
    pub backoff: BackoffPolicy,
    /// Kinds eligible for retry on top of the classifier's verdict
    pub retryable_kinds: HashSet<ErrorKind>,
    /// Optional per-retry callback, invoked before the backoff wait
    pub on_retry: Option<OnRetry>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            retryable_kinds: HashSet::new(),
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("retryable_kinds", &self.retryable_kinds)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl RetryConfig {
    /// Create a configuration builder.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), RetryError> {
        self.backoff.validate()
    }
}

/// Builder for [`RetryConfig`] with validation on `build`.
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: std::time::Duration) -> Self {
        self.config.backoff.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: std::time::Duration) -> Self {
        self.config.backoff.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff.factor = factor;
        self
    }

    /// Restrict retries to the given kinds, on top of the classifier's
    /// verdict.
    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.config.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn on_retry(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.config.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<RetryConfig, RetryError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Drives retry sequences for fallible asynchronous operations.
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    events: Arc<dyn EventSink>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    /// Create an executor with the given configuration and no subscriber.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, events: Arc::new(NoopSink), cancel: None }
    }

    /// Attach an event subscriber.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Attach a cancellation token. A fired token aborts the sequence at the
    /// next suspension point with [`RetryError::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `operation`, retrying classified-transient failures up to the
    /// configured budget.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.execute_with_recovery(operation, |_| {}).await
    }

    /// Execute `operation` with a recovery hook.
    ///
    /// `on_failure` runs after a failure has been classified as retryable and
    /// before the backoff wait. The transaction retrier uses this seam to
    /// escalate its gas price between attempts.
    #[instrument(skip_all, fields(max_retries = self.config.max_retries))]
    pub async fn execute_with_recovery<F, Fut, T, R>(
        &self,
        mut operation: F,
        mut on_failure: R,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        R: FnMut(&ClassifiedError),
    {
        let mut attempt: u32 = 0;

        loop {
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    debug!(attempts = attempt, "retry sequence cancelled before attempt");
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
            }

            debug!(attempt, "executing operation");

            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "operation recovered after retries");
                        self.events.publish(RetryEvent::Recovered { retries: attempt });
                    }
                    return Ok(value);
                }
                Err(raw) => {
                    let classified = classify(raw);

                    if !self.is_eligible(&classified) {
                        debug!(kind = %classified.kind, "failure is not retryable, giving up");
                        return Err(RetryError::NonRetryable(classified));
                    }

                    if attempt == self.config.max_retries {
                        let attempts = attempt + 1;
                        error!(
                            max_retries_exceeded = true,
                            total_attempts = attempts,
                            kind = %classified.kind,
                            "retries exhausted: {}",
                            classified.source
                        );
                        self.events.publish(RetryEvent::Exhausted {
                            kind: classified.kind,
                            total_attempts: attempts,
                        });
                        return Err(RetryError::Exhausted { attempts, last: classified });
                    }

                    on_failure(&classified);

                    let delay = self.config.backoff.jittered_delay(attempt);
                    if let Some(callback) = &self.config.on_retry {
                        callback(attempt);
                    }
                    self.events.publish(RetryEvent::Retrying { attempt, delay });
                    warn!(attempt, ?delay, kind = %classified.kind, "operation failed, retrying");

                    match &self.cancel {
                        Some(token) => {
                            tokio::select! {
                                _ = token.cancelled() => {
                                    debug!(attempts = attempt + 1, "retry sequence cancelled during backoff");
                                    return Err(RetryError::Cancelled { attempts: attempt + 1 });
                                }
                                _ = sleep(delay) => {}
                            }
                        }
                        None => sleep(delay).await,
                    }

                    attempt += 1;
                }
            }
        }
    }

    /// Retry verdict: the classifier must allow it, and a non-empty
    /// `retryable_kinds` set must also contain the kind.
    fn is_eligible(&self, classified: &ClassifiedError) -> bool {
        classified.retryable
            && (self.config.retryable_kinds.is_empty()
                || self.config.retryable_kinds.contains(&classified.kind))
    }
}

/// Convenience wrapper: build an executor for one call.
pub async fn execute_with_retry<F, Fut, T>(config: RetryConfig, operation: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    RetryExecutor::new(config).execute(operation).await
}
