//! Blockchain transaction retrier with gas escalation
//!
//! A specialization of [`RetryExecutor`] for chain submissions: between
//! attempts it inspects the classified failure and, when the failure is
//! gas-related, multiplies the current gas price before the next submission.
//! Non-gas failures leave the price untouched. The price is scoped to a
//! single [`TransactionRetrier::retry_transaction`] call and is monotonically
//! non-decreasing within it.

use std::future::Future;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;

use crate::error::{ClassifiedError, ErrorKind, OperationError, RetryError, RetryResult};
use crate::events::{EventSink, NoopSink};
use crate::retry::{RetryConfig, RetryExecutor};

/// Default retry budget for chain submissions. Higher than the generic
/// default to tolerate mempool congestion.
pub const DEFAULT_TX_MAX_RETRIES: u32 = 5;

/// Default multiplier applied to the gas price after a gas-related failure.
pub const DEFAULT_GAS_MULTIPLIER: f64 = 1.1;

/// Messages that identify a gas-related rejection.
static GAS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)gas|underpriced|insufficient funds|out of gas")
        .expect("gas pattern is a valid regex")
});

/// Whether a classified failure should trigger gas escalation.
fn is_gas_related(classified: &ClassifiedError) -> bool {
    classified.kind == ErrorKind::GasUnderpriced || GAS_PATTERN.is_match(&classified.source.message)
}

/// Multiply a gas price, guaranteeing a strict increase even when the
/// multiplier rounds away on small prices. Rounds to nearest so binary
/// representation error in the product cannot inflate the bump.
fn escalate(price: u128, multiplier: f64) -> u128 {
    let bumped = (price as f64 * multiplier).round() as u128;
    bumped.max(price.saturating_add(1))
}

/// Configuration for transaction retries.
#[derive(Debug, Clone)]
pub struct TxRetryConfig {
    /// Underlying retry configuration; defaults to a budget of
    /// [`DEFAULT_TX_MAX_RETRIES`] retries
    pub retry: RetryConfig,
    /// Gas price offered on the first submission. `None` lets the provider
    /// price the transaction, in which case escalation is unavailable.
    pub initial_gas_price: Option<u128>,
    /// Multiplier applied after each gas-related failure; must exceed 1
    pub gas_multiplier: f64,
}

impl Default for TxRetryConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig { max_retries: DEFAULT_TX_MAX_RETRIES, ..RetryConfig::default() },
            initial_gas_price: None,
            gas_multiplier: DEFAULT_GAS_MULTIPLIER,
        }
    }
}

impl TxRetryConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), RetryError> {
        self.retry.validate()?;
        if self.gas_multiplier <= 1.0 {
            return Err(RetryError::InvalidConfig {
                message: format!("gas_multiplier must exceed 1, got {}", self.gas_multiplier),
            });
        }
        Ok(())
    }
}

/// Retries chain submissions, escalating the gas price on gas-related
/// failures.
#[derive(Clone)]
pub struct TransactionRetrier {
    config: TxRetryConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TransactionRetrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRetrier").field("config", &self.config).finish()
    }
}

impl TransactionRetrier {
    /// Create a retrier with the given configuration.
    pub fn new(config: TxRetryConfig) -> Result<Self, RetryError> {
        config.validate()?;
        Ok(Self { config, events: Arc::new(NoopSink) })
    }

    /// Create a retrier with default configuration.
    pub fn with_defaults() -> Self {
        Self { config: TxRetryConfig::default(), events: Arc::new(NoopSink) }
    }

    /// Attach an event subscriber.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &TxRetryConfig {
        &self.config
    }

    /// Submit a transaction with retry and gas escalation.
    ///
    /// `submit` receives the gas price to offer; `None` means provider
    /// pricing. After a gas-related failure the price is multiplied by
    /// `gas_multiplier` before the next attempt; other failures follow the
    /// ordinary retry path unchanged.
    pub async fn retry_transaction<F, Fut, T>(&self, mut submit: F) -> RetryResult<T>
    where
        F: FnMut(Option<u128>) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let price = Arc::new(Mutex::new(self.config.initial_gas_price));
        let escalation_price = Arc::clone(&price);
        let multiplier = self.config.gas_multiplier;

        let executor =
            RetryExecutor::new(self.config.retry.clone()).with_events(Arc::clone(&self.events));

        executor
            .execute_with_recovery(
                || submit(*price.lock()),
                move |classified| {
                    if !is_gas_related(classified) {
                        return;
                    }
                    let mut current = escalation_price.lock();
                    if let Some(offered) = *current {
                        let bumped = escalate(offered, multiplier);
                        debug!(offered, bumped, "escalating gas price after gas-related failure");
                        *current = Some(bumped);
                    }
                },
            )
            .await
    }
}
