//! Per-operation circuit breaker registry
//!
//! Keeps one circuit per caller-chosen operation identifier and wraps retry
//! sequences with a load-shedding gate: while a circuit is open, calls fail
//! with [`RetryError::CircuitOpen`] without invoking the operation at all.
//!
//! The registry is an explicit, injected store rather than module-level
//! state; its lifetime is the application session and nothing is persisted
//! across restarts. Entries are created lazily in `Closed` with zero
//! failures and are never removed. Concurrent callers sharing an identifier
//! serialize their state updates on the per-key map entry.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{OperationError, RetryError, RetryResult};
use crate::events::{EventSink, NoopSink, RetryEvent};
use crate::retry::RetryExecutor;

/// Default number of consecutive failed sequences before a circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cooldown before an open circuit allows a probe.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Circuit lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Shedding load, calls are rejected
    Open,
    /// Cooldown elapsed, a single probe is allowed through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed sequences that open the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, reset_timeout: DEFAULT_RESET_TIMEOUT }
    }
}

impl CircuitBreakerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.failure_threshold == 0 {
            return Err(RetryError::InvalidConfig {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }
        if self.reset_timeout.is_zero() {
            return Err(RetryError::InvalidConfig {
                message: "reset_timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Mutable per-identifier circuit state. Only touched while holding the
/// registry's entry for that identifier.
#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// A half-open probe is in flight; further calls are rejected until its
    /// outcome is recorded.
    probing: bool,
}

impl CircuitEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probing: false,
        }
    }
}

/// Registry of circuits keyed by operation identifier.
pub struct CircuitBreakerRegistry<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitEntry>,
    clock: Arc<C>,
    events: Arc<dyn EventSink>,
}

impl<C: Clock> fmt::Debug for CircuitBreakerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .finish()
    }
}

impl CircuitBreakerRegistry<SystemClock> {
    /// Create a registry using the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, RetryError> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a registry with default configuration.
    pub fn with_defaults() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            circuits: DashMap::new(),
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopSink),
        }
    }
}

impl<C: Clock> CircuitBreakerRegistry<C> {
    /// Create a registry with an injected clock, for deterministic tests.
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> Result<Self, RetryError> {
        config.validate()?;
        Ok(Self { config, circuits: DashMap::new(), clock: Arc::new(clock), events: Arc::new(NoopSink) })
    }

    /// Attach an event subscriber for `CircuitOpened` notifications.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Execute a retry sequence for `operation_id` behind the circuit gate.
    ///
    /// While the circuit is open and the cooldown has not elapsed, the
    /// operation is never invoked. A sequence that ultimately succeeds
    /// closes the circuit; a sequence that ultimately fails counts as one
    /// consecutive failure. A cancelled sequence neither counts as a failure
    /// nor clears the streak; it only releases the probe slot it may hold.
    #[instrument(skip(self, executor, operation))]
    pub async fn guard<F, Fut, T>(
        &self,
        operation_id: &str,
        executor: &RetryExecutor,
        operation: F,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.check_gate(operation_id)?;

        let result = executor.execute(operation).await;

        match &result {
            Ok(_) => self.record_success(operation_id),
            Err(RetryError::Cancelled { .. }) => self.release_probe(operation_id),
            Err(_) => self.record_failure(operation_id),
        }

        result
    }

    /// Gate check for an identifier, transitioning `Open -> HalfOpen` when
    /// the cooldown has elapsed. Exactly one probe passes through a
    /// half-open circuit.
    fn check_gate(&self, operation_id: &str) -> Result<(), RetryError> {
        let mut entry =
            self.circuits.entry(operation_id.to_string()).or_insert_with(CircuitEntry::new);

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if entry.probing {
                    debug!(operation_id, "probe already in flight, rejecting call");
                    return Err(RetryError::CircuitOpen {
                        operation_id: operation_id.to_string(),
                    });
                }
                entry.probing = true;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = entry
                    .last_failure
                    .map(|at| self.clock.now().duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed < self.config.reset_timeout {
                    debug!(operation_id, state = %entry.state, "circuit rejecting call");
                    return Err(RetryError::CircuitOpen {
                        operation_id: operation_id.to_string(),
                    });
                }
                entry.state = CircuitState::HalfOpen;
                entry.probing = true;
                info!(operation_id, "circuit half-open, allowing probe");
                Ok(())
            }
        }
    }

    /// Record an overall successful sequence: close the circuit and clear
    /// the failure streak.
    fn record_success(&self, operation_id: &str) {
        let mut entry =
            self.circuits.entry(operation_id.to_string()).or_insert_with(CircuitEntry::new);
        if entry.state != CircuitState::Closed {
            info!(operation_id, from = %entry.state, "circuit closed");
        }
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.probing = false;
    }

    /// Record an overall failed sequence, opening the circuit at the
    /// threshold. The entry lock is released before the event is published
    /// so a sink may call back into the registry.
    fn record_failure(&self, operation_id: &str) {
        let opened_at = {
            let mut entry =
                self.circuits.entry(operation_id.to_string()).or_insert_with(CircuitEntry::new);
            entry.consecutive_failures += 1;
            entry.last_failure = Some(self.clock.now());
            entry.probing = false;

            if entry.consecutive_failures >= self.config.failure_threshold {
                let was_open = entry.state == CircuitState::Open;
                entry.state = CircuitState::Open;
                if was_open {
                    None
                } else {
                    Some(entry.consecutive_failures)
                }
            } else {
                entry.state = CircuitState::Closed;
                None
            }
        };

        if let Some(failures) = opened_at {
            warn!(operation_id, failures, "circuit opened");
            self.events
                .publish(RetryEvent::CircuitOpened { operation_id: operation_id.to_string() });
        }
    }

    /// Current state for an identifier. Identifiers never seen report
    /// `Closed`.
    pub fn state(&self, operation_id: &str) -> CircuitState {
        self.circuits.get(operation_id).map(|entry| entry.state).unwrap_or(CircuitState::Closed)
    }

    /// Current failure streak for an identifier.
    pub fn consecutive_failures(&self, operation_id: &str) -> u32 {
        self.circuits.get(operation_id).map(|entry| entry.consecutive_failures).unwrap_or(0)
    }

    /// A cancelled sequence says nothing about backend health: give the
    /// probe slot back and return a half-open circuit to open so the next
    /// caller can probe instead.
    fn release_probe(&self, operation_id: &str) {
        if let Some(mut entry) = self.circuits.get_mut(operation_id) {
            if entry.state == CircuitState::HalfOpen {
                entry.state = CircuitState::Open;
            }
            entry.probing = false;
        }
    }

    /// Manually close a circuit and clear its failure streak.
    pub fn reset(&self, operation_id: &str) {
        if let Some(mut entry) = self.circuits.get_mut(operation_id) {
            entry.state = CircuitState::Closed;
            entry.consecutive_failures = 0;
            entry.last_failure = None;
            entry.probing = false;
            info!(operation_id, "circuit manually reset");
        }
    }
}

impl Default for CircuitBreakerRegistry<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::clock::MockClock;
    use crate::error::{ErrorKind, OperationError};
    use crate::retry::RetryConfig;

    fn no_retry_executor() -> RetryExecutor {
        let config = RetryConfig::builder()
            .max_retries(0)
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build()
            .expect("valid test config");
        RetryExecutor::new(config)
    }

    fn failing_op() -> impl FnMut() -> std::future::Ready<Result<(), OperationError>> {
        || std::future::ready(Err(OperationError::new("down").with_kind(ErrorKind::Network)))
    }

    fn registry(threshold: u32, timeout: Duration, clock: MockClock) -> CircuitBreakerRegistry<MockClock> {
        CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig { failure_threshold: threshold, reset_timeout: timeout },
            clock,
        )
        .expect("valid test config")
    }

    #[test]
    fn config_validation_rejects_zero_threshold() {
        let config = CircuitBreakerConfig { failure_threshold: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_identifier_reports_closed() {
        let registry = CircuitBreakerRegistry::with_defaults();
        assert_eq!(registry.state("never-seen"), CircuitState::Closed);
        assert_eq!(registry.consecutive_failures("never-seen"), 0);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_sheds_load() {
        let clock = MockClock::new();
        let registry = registry(3, Duration::from_secs(60), clock);
        let executor = no_retry_executor();

        for _ in 0..3 {
            let result = registry.guard("upload", &executor, failing_op()).await;
            assert!(matches!(result, Err(RetryError::Exhausted { .. })));
        }
        assert_eq!(registry.state("upload"), CircuitState::Open);

        // While open, the operation must never run.
        let calls = AtomicU32::new(0);
        let result = registry
            .guard("upload", &executor, || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(()))
            })
            .await;
        assert!(matches!(result, Err(RetryError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn identifiers_are_isolated() {
        let clock = MockClock::new();
        let registry = registry(1, Duration::from_secs(60), clock);
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;
        assert_eq!(registry.state("upload"), CircuitState::Open);
        assert_eq!(registry.state("register"), CircuitState::Closed);

        let result = registry.guard("register", &executor, || std::future::ready(Ok(42))).await;
        assert_eq!(result.expect("independent circuit"), 42);
    }

    /// After the reset timeout an open circuit must admit exactly one probe;
    /// a successful probe closes the circuit and clears the streak.
    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let clock = MockClock::new();
        let registry = registry(2, Duration::from_secs(60), clock.clone());
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;
        let _ = registry.guard("upload", &executor, failing_op()).await;
        assert_eq!(registry.state("upload"), CircuitState::Open);

        clock.advance(Duration::from_secs(61));

        let result = registry.guard("upload", &executor, || std::future::ready(Ok("ok"))).await;
        assert_eq!(result.expect("probe should pass"), "ok");
        assert_eq!(registry.state("upload"), CircuitState::Closed);
        assert_eq!(registry.consecutive_failures("upload"), 0);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let clock = MockClock::new();
        let registry = registry(2, Duration::from_secs(60), clock.clone());
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;
        let _ = registry.guard("upload", &executor, failing_op()).await;
        assert_eq!(registry.state("upload"), CircuitState::Open);

        clock.advance(Duration::from_secs(61));

        let result = registry.guard("upload", &executor, failing_op()).await;
        assert!(matches!(result, Err(RetryError::Exhausted { .. })));
        assert_eq!(registry.state("upload"), CircuitState::Open);

        // Back to shedding until the cooldown elapses again.
        let result = registry.guard("upload", &executor, failing_op()).await;
        assert!(matches!(result, Err(RetryError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn timeout_not_elapsed_keeps_shedding() {
        let clock = MockClock::new();
        let registry = registry(1, Duration::from_secs(60), clock.clone());
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;
        assert_eq!(registry.state("upload"), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        let result = registry.guard("upload", &executor, failing_op()).await;
        assert!(matches!(result, Err(RetryError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn success_below_threshold_clears_streak() {
        let clock = MockClock::new();
        let registry = registry(5, Duration::from_secs(60), clock);
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;
        let _ = registry.guard("upload", &executor, failing_op()).await;
        assert_eq!(registry.consecutive_failures("upload"), 2);

        let _ = registry.guard("upload", &executor, || std::future::ready(Ok(()))).await;
        assert_eq!(registry.consecutive_failures("upload"), 0);
        assert_eq!(registry.state("upload"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opening_emits_event_once_per_transition() {
        let (sink, mut rx) = crate::events::ChannelSink::new();
        let clock = MockClock::new();
        let registry = registry(1, Duration::from_secs(60), clock).with_events(Arc::new(sink));
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;

        match rx.try_recv() {
            Ok(RetryEvent::CircuitOpened { operation_id }) => assert_eq!(operation_id, "upload"),
            other => panic!("expected CircuitOpened, got {other:?}"),
        }

        // A gate-rejected call while open must not re-emit the event.
        let result = registry.guard("upload", &executor, failing_op()).await;
        assert!(matches!(result, Err(RetryError::CircuitOpen { .. })));
        assert!(rx.try_recv().is_err(), "no duplicate event while already open");
    }

    /// With the cooldown elapsed, exactly one caller wins the probe slot;
    /// callers arriving while the probe is in flight are rejected.
    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let clock = MockClock::new();
        let registry = Arc::new(registry(1, Duration::from_secs(60), clock.clone()));
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;
        assert_eq!(registry.state("upload"), CircuitState::Open);

        clock.advance(Duration::from_secs(61));

        // The probe signals once it is running, then blocks until released.
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_registry = Arc::clone(&registry);
        let probe_executor = executor.clone();
        let probe = tokio::spawn(async move {
            let mut started = Some(started_tx);
            let mut release = Some(release_rx);
            probe_registry
                .guard("upload", &probe_executor, move || {
                    let started = started.take();
                    let release = release.take();
                    async move {
                        if let Some(tx) = started {
                            let _ = tx.send(());
                        }
                        if let Some(rx) = release {
                            let _ = rx.await;
                        }
                        Ok("ok")
                    }
                })
                .await
        });
        started_rx.await.expect("probe should start");
        assert_eq!(registry.state("upload"), CircuitState::HalfOpen);

        // Second caller while the probe is in flight is shed without
        // invoking its operation.
        let result = registry.guard("upload", &executor, || std::future::ready(Ok(()))).await;
        assert!(matches!(result, Err(RetryError::CircuitOpen { .. })));

        release_tx.send(()).expect("probe still waiting");
        let outcome = probe.await.expect("probe task");
        assert_eq!(outcome.expect("probe should pass"), "ok");
        assert_eq!(registry.state("upload"), CircuitState::Closed);
    }

    /// A sink may call back into the registry for the same identifier; the
    /// entry lock must not be held across `publish`.
    #[tokio::test]
    async fn sink_may_reenter_registry_when_circuit_opens() {
        struct ReentrantSink {
            registry: Arc<Mutex<Option<Arc<CircuitBreakerRegistry<MockClock>>>>>,
            observed: Arc<Mutex<Option<CircuitState>>>,
        }

        impl EventSink for ReentrantSink {
            fn publish(&self, event: RetryEvent) {
                if let RetryEvent::CircuitOpened { operation_id } = event {
                    if let Some(registry) = self.registry.lock().as_ref() {
                        *self.observed.lock() = Some(registry.state(&operation_id));
                    }
                }
            }
        }

        let slot = Arc::new(Mutex::new(None));
        let observed = Arc::new(Mutex::new(None));
        let sink =
            ReentrantSink { registry: Arc::clone(&slot), observed: Arc::clone(&observed) };

        let clock = MockClock::new();
        let registry =
            Arc::new(registry(1, Duration::from_secs(60), clock).with_events(Arc::new(sink)));
        *slot.lock() = Some(Arc::clone(&registry));

        let executor = no_retry_executor();
        let _ = registry.guard("upload", &executor, failing_op()).await;

        assert_eq!(*observed.lock(), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn manual_reset_closes_circuit() {
        let clock = MockClock::new();
        let registry = registry(1, Duration::from_secs(60), clock);
        let executor = no_retry_executor();

        let _ = registry.guard("upload", &executor, failing_op()).await;
        assert_eq!(registry.state("upload"), CircuitState::Open);

        registry.reset("upload");
        assert_eq!(registry.state("upload"), CircuitState::Closed);
        assert_eq!(registry.consecutive_failures("upload"), 0);
    }
}
