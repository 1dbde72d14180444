// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-backend circuit breaker using the recloser crate.
//!
//! A relay that keeps failing is skipped for a while instead of being hit on
//! every cycle. While the circuit is open, calls fail fast with
//! [`CircuitError::Rejected`], which the engine treats exactly like a
//! transport failure: nothing is applied, no cursor moves.
//!
//! States:
//! - Closed: calls pass through, outcomes fill a sliding window
//! - Open: calls rejected until the recovery timeout elapses
//! - HalfOpen: a few probe calls decide whether to close again

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Last observed circuit state, for status and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not attempted
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls in the sliding window; the circuit trips once the window is full
    /// and more than half of it failed
    pub window: usize,
    /// Probe calls allowed while half-open
    pub probes: usize,
    /// Time spent open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 10,
            probes: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    #[must_use]
    pub fn from_engine(config: &crate::config::SyncEngineConfig) -> Self {
        Self {
            window: config.circuit_window.max(1),
            probes: 2,
            recovery_timeout: Duration::from_millis(config.circuit_recovery_ms),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            window: 2,
            probes: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A circuit breaker guarding one relay backend.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    state: AtomicU8,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.window)
            .half_open_len(config.probes.max(1))
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State as of the most recent call outcome.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Relaxed) {
            1 => CircuitState::HalfOpen,
            2 => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.state.store(CircuitState::Closed as u8, Ordering::Relaxed);
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.state.store(CircuitState::Open as u8, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit open, relay call rejected");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if self.state() == CircuitState::Open {
                    self.state.store(CircuitState::HalfOpen as u8, Ordering::Relaxed);
                }
                debug!(circuit = %self.name, "Relay call failed");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_successful_calls() {
        let cb = CircuitBreaker::new("relay", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_tracks_failures() {
        let cb = CircuitBreaker::new("relay", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;
        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_trips_after_failing_window() {
        let config = CircuitConfig {
            window: 2,
            probes: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("relay", config);

        for _ in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;

        assert!(cb.rejections() >= 1);
        assert_eq!(cb.calls_total(), 5);
    }

    #[tokio::test]
    async fn test_rejected_call_is_not_executed() {
        let config = CircuitConfig {
            window: 1,
            probes: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("relay", config);
        for _ in 0..3 {
            let _: Result<(), CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }

        let executed = std::sync::atomic::AtomicBool::new(false);
        let result: Result<(), CircuitError<&str>> = cb
            .call(|| async {
                executed.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        if matches!(result, Err(CircuitError::Rejected)) {
            assert!(!executed.load(Ordering::SeqCst));
            assert_eq!(cb.state(), CircuitState::Open);
        }
    }

    #[test]
    fn test_config_from_engine() {
        let engine = crate::config::SyncEngineConfig {
            circuit_window: 7,
            circuit_recovery_ms: 1500,
            ..Default::default()
        };
        let config = CircuitConfig::from_engine(&engine);
        assert_eq!(config.window, 7);
        assert_eq!(config.recovery_timeout, Duration::from_millis(1500));
    }
}
