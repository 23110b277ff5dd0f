//! Timeout-and-fallback execution
//!
//! Every outbound transport write and every sub-agent call goes through
//! [`ReliabilityExecutor`]. Failures come back as a [`FailureReason`] value;
//! nothing raised by the wrapped operation escapes the call.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;

use crate::metrics;

/// Why a guarded operation did not produce its primary value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    TimedOut { operation: String, after: Duration },
    Failed { operation: String, message: String },
    Panicked { operation: String },
    FallbackFailed { operation: String, message: String },
}

impl FailureReason {
    pub fn operation(&self) -> &str {
        match self {
            FailureReason::TimedOut { operation, .. }
            | FailureReason::Failed { operation, .. }
            | FailureReason::Panicked { operation }
            | FailureReason::FallbackFailed { operation, .. } => operation,
        }
    }

    /// Error text reported by the operation itself, without the operation name
    pub fn error_message(&self) -> Option<&str> {
        match self {
            FailureReason::Failed { message, .. }
            | FailureReason::FallbackFailed { message, .. } => Some(message),
            FailureReason::TimedOut { .. } | FailureReason::Panicked { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FailureReason::TimedOut { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TimedOut { operation, after } => {
                write!(f, "{} timed out after {}ms", operation, after.as_millis())
            }
            FailureReason::Failed { operation, message } => {
                write!(f, "{} failed: {}", operation, message)
            }
            FailureReason::Panicked { operation } => write!(f, "{} panicked", operation),
            FailureReason::FallbackFailed { operation, message } => {
                write!(f, "fallback for {} failed: {}", operation, message)
            }
        }
    }
}

/// Result of [`ReliabilityExecutor::execute_safely`] when a value was produced
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered<T> {
    Primary(T),
    Fallback { value: T, cause: FailureReason },
}

impl<T> Recovered<T> {
    pub fn into_inner(self) -> T {
        match self {
            Recovered::Primary(value) | Recovered::Fallback { value, .. } => value,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Recovered::Primary(value) | Recovered::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Recovered::Fallback { .. })
    }
}

#[derive(Debug, Default)]
struct ReliabilityStats {
    succeeded: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    fallbacks_used: AtomicU64,
    fallbacks_failed: AtomicU64,
}

/// Point-in-time copy of executor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReliabilitySnapshot {
    pub succeeded: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub fallbacks_used: u64,
    pub fallbacks_failed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReliabilityExecutor {
    stats: Arc<ReliabilityStats>,
}

impl ReliabilityExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` under `timeout`, converting timeouts, errors and panics
    /// into a [`FailureReason`].
    pub async fn guard<T, E, Fut>(
        &self,
        name: &str,
        operation: Fut,
        timeout: Duration,
    ) -> Result<T, FailureReason>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(timeout, AssertUnwindSafe(operation).catch_unwind()).await;

        let result = match outcome {
            Ok(Ok(Ok(value))) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                metrics::record_reliability_outcome("success");
                return Ok(value);
            }
            Ok(Ok(Err(e))) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_reliability_outcome("error");
                FailureReason::Failed {
                    operation: name.to_string(),
                    message: e.to_string(),
                }
            }
            Ok(Err(_)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_reliability_outcome("panic");
                FailureReason::Panicked {
                    operation: name.to_string(),
                }
            }
            Err(_) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                metrics::record_reliability_outcome("timeout");
                FailureReason::TimedOut {
                    operation: name.to_string(),
                    after: timeout,
                }
            }
        };

        tracing::warn!(
            "[RELIABILITY] {} after {}ms",
            result,
            started.elapsed().as_millis()
        );
        Err(result)
    }

    /// Run `operation`; on any failure run `fallback` exactly once with the
    /// failure reason. A failing fallback yields `Err(FallbackFailed)`.
    pub async fn execute_safely<T, E, Fut, FE, FFut, FB>(
        &self,
        name: &str,
        operation: Fut,
        fallback: FB,
        timeout: Duration,
    ) -> Result<Recovered<T>, FailureReason>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        FB: FnOnce(FailureReason) -> FFut,
        FFut: Future<Output = Result<T, FE>>,
        FE: fmt::Display,
    {
        let cause = match self.guard(name, operation, timeout).await {
            Ok(value) => return Ok(Recovered::Primary(value)),
            Err(cause) => cause,
        };

        match AssertUnwindSafe(fallback(cause.clone())).catch_unwind().await {
            Ok(Ok(value)) => {
                self.stats.fallbacks_used.fetch_add(1, Ordering::Relaxed);
                metrics::record_reliability_outcome("fallback");
                tracing::info!("[RELIABILITY] Fallback used for {}: {}", name, cause);
                Ok(Recovered::Fallback { value, cause })
            }
            Ok(Err(e)) => Err(self.fallback_failed(name, e.to_string())),
            Err(_) => Err(self.fallback_failed(name, "fallback panicked".to_string())),
        }
    }

    /// Transport-write form: `true` when `operation` completed in time
    pub async fn send_safely<E, Fut>(&self, name: &str, operation: Fut, timeout: Duration) -> bool
    where
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        self.guard(name, operation, timeout).await.is_ok()
    }

    pub fn snapshot(&self) -> ReliabilitySnapshot {
        ReliabilitySnapshot {
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            fallbacks_used: self.stats.fallbacks_used.load(Ordering::Relaxed),
            fallbacks_failed: self.stats.fallbacks_failed.load(Ordering::Relaxed),
        }
    }

    fn fallback_failed(&self, name: &str, message: String) -> FailureReason {
        self.stats.fallbacks_failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_reliability_outcome("fallback_failed");
        tracing::error!("[RELIABILITY] Fallback for {} failed: {}", name, message);
        FailureReason::FallbackFailed {
            operation: name.to_string(),
            message,
        }
    }
}
