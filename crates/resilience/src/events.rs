//! Structured retry lifecycle events
//!
//! The resilience core never renders notifications itself; it publishes
//! [`RetryEvent`] values through an [`EventSink`] and leaves presentation to
//! whoever subscribed. A UI layer typically installs a [`ChannelSink`] and
//! drives banners from the receiving end.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::ErrorKind;

/// Lifecycle events emitted by the retry executor and circuit breaker
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// An attempt failed and another will start after `delay`
    Retrying {
        /// Zero-based index of the attempt that just failed
        attempt: u32,
        /// Backoff delay before the next attempt, jitter included
        delay: Duration,
    },
    /// The operation succeeded after at least one retry
    Recovered {
        /// Number of retries it took to recover
        retries: u32,
    },
    /// Every allowed attempt failed
    Exhausted {
        /// Classification of the final failure
        kind: ErrorKind,
        /// Total attempts executed, initial call included
        total_attempts: u32,
    },
    /// A circuit transitioned to open and is now shedding load
    CircuitOpened {
        /// Identifier of the guarded operation
        operation_id: String,
    },
}

/// Observer interface for retry lifecycle events.
///
/// Implementations must not block: `publish` is called inline from the retry
/// loop between suspension points.
pub trait EventSink: Send + Sync {
    /// Deliver one event to the subscriber.
    fn publish(&self, event: RetryEvent);
}

/// Sink that discards every event. The default for executors built without
/// an explicit subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: RetryEvent) {}
}

/// Sink that forwards events to the `tracing` subscriber as structured log
/// lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: RetryEvent) {
        match event {
            RetryEvent::Retrying { attempt, delay } => {
                info!(attempt, ?delay, "retrying operation");
            }
            RetryEvent::Recovered { retries } => {
                info!(retries, "operation recovered");
            }
            RetryEvent::Exhausted { kind, total_attempts } => {
                warn!(%kind, total_attempts, "retries exhausted");
            }
            RetryEvent::CircuitOpened { operation_id } => {
                warn!(operation_id, "circuit opened");
            }
        }
    }
}

/// Sink that forwards events over an unbounded channel.
///
/// Dropped receivers are tolerated; publishing then becomes a no-op rather
/// than an error, since event delivery is best-effort by contract.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RetryEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver a subscriber drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: RetryEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_events_in_order() {
        let (sink, mut rx) = ChannelSink::new();

        sink.publish(RetryEvent::Retrying { attempt: 0, delay: Duration::from_millis(100) });
        sink.publish(RetryEvent::Recovered { retries: 1 });

        assert_eq!(
            rx.recv().await,
            Some(RetryEvent::Retrying { attempt: 0, delay: Duration::from_millis(100) })
        );
        assert_eq!(rx.recv().await, Some(RetryEvent::Recovered { retries: 1 }));
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // Must not panic or error.
        sink.publish(RetryEvent::CircuitOpened { operation_id: "upload".to_string() });
    }
}
