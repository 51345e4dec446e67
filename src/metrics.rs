//! Metrics tracking abstraction for pools
//!
//! A pool never talks to a metrics backend directly. It owns one
//! [`MetricsTrackerDelegate`] which wraps whatever [`MetricsTracker`] the bound
//! [`MetricsTrackerFactory`] produced, or [`NoopMetricsTracker`] when nothing
//! was bound.

use crate::errors::BackendResult;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use serde::Serialize;

/// Build the namespaced name of a pool metric or health check
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::metric_name;
///
/// assert_eq!(metric_name("orders", "Wait"), "orders.pool.Wait");
/// ```
pub fn metric_name(pool_name: &str, metric: &str) -> String {
    format!("{}.pool.{}", pool_name, metric)
}

/// Instantaneous resource counts of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "metrics", derive(Serialize))]
pub struct PoolCounts {
    /// Resources currently owned by the pool (idle + active)
    pub total: usize,

    /// Resources checked out by callers
    pub active: usize,

    /// Resources sitting in the pool ready for use
    pub idle: usize,

    /// Threads blocked waiting for a resource
    pub waiting: usize,

    /// Upper bound on `total`
    pub max: usize,
}

/// Live counter source handed to a metrics tracker
pub trait PoolStats: Send + Sync {
    /// Read the current counts
    fn counts(&self) -> PoolCounts;
}

/// Backend-specific recorder of pool observations
///
/// Every method has a no-op default so a backend only implements what it
/// stores. Errors and panics are contained by the pool and never reach the
/// acquiring caller.
pub trait MetricsTracker: Send + Sync {
    /// Time taken to create a new resource
    fn record_connection_created_millis(&self, _millis: u64) -> BackendResult<()> {
        Ok(())
    }

    /// Time a caller waited to acquire a resource
    fn record_connection_acquired_nanos(&self, _nanos: u64) -> BackendResult<()> {
        Ok(())
    }

    /// Time a resource was held before being returned
    fn record_connection_usage_millis(&self, _millis: u64) -> BackendResult<()> {
        Ok(())
    }

    /// An acquisition gave up after its timeout
    fn record_connection_timeout(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Unregister everything this tracker created. Must be idempotent.
    fn close(&self) {}
}

/// Builds a [`MetricsTracker`] for one named pool
pub trait MetricsTrackerFactory: Send + Sync {
    fn create(
        &self,
        pool_name: &str,
        pool_stats: Arc<dyn PoolStats>,
    ) -> BackendResult<Box<dyn MetricsTracker>>;
}

/// Tracker that discards every observation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsTracker;

impl MetricsTracker for NoopMetricsTracker {}

/// Factory producing [`NoopMetricsTracker`]
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsTrackerFactory;

impl MetricsTrackerFactory for NoopMetricsTrackerFactory {
    fn create(
        &self,
        _pool_name: &str,
        _pool_stats: Arc<dyn PoolStats>,
    ) -> BackendResult<Box<dyn MetricsTracker>> {
        Ok(Box::new(NoopMetricsTracker))
    }
}

/// Pool-side wrapper that keeps backend failures away from pool traffic
pub(crate) struct MetricsTrackerDelegate {
    tracker: Box<dyn MetricsTracker>,
    errors: AtomicU64,
    closed: AtomicBool,
}

impl MetricsTrackerDelegate {
    pub fn new(tracker: Box<dyn MetricsTracker>) -> Self {
        Self {
            tracker,
            errors: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn noop() -> Self {
        Self::new(Box::new(NoopMetricsTracker))
    }

    pub fn record_connection_created(&self, elapsed: Duration) {
        self.guard("record_connection_created_millis", |t| {
            t.record_connection_created_millis(elapsed.as_millis() as u64)
        });
    }

    pub fn record_borrow_stats(&self, started: Instant) {
        let nanos = started.elapsed().as_nanos() as u64;
        self.guard("record_connection_acquired_nanos", |t| {
            t.record_connection_acquired_nanos(nanos)
        });
    }

    pub fn record_connection_usage(&self, held: Duration) {
        self.guard("record_connection_usage_millis", |t| {
            t.record_connection_usage_millis(held.as_millis() as u64)
        });
    }

    pub fn record_connection_timeout(&self) {
        self.guard("record_connection_timeout", |t| t.record_connection_timeout());
    }

    /// Number of backend failures swallowed so far
    pub fn instrumentation_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.tracker.close()));
        if outcome.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("metrics tracker panicked while closing");
        }
    }

    fn guard<F>(&self, op: &'static str, f: F)
    where
        F: FnOnce(&dyn MetricsTracker) -> BackendResult<()>,
    {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| f(self.tracker.as_ref()))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation = op, error = %err, "metrics backend call failed");
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(operation = op, "metrics backend panicked");
            }
        }
    }
}

impl Default for MetricsTrackerDelegate {
    fn default() -> Self {
        Self::noop()
    }
}
