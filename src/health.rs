//! Health checks for object pools
//!
//! Checks are registered by name in a [`HealthCheckRegistry`] and evaluated on
//! demand by whoever owns the registry. Nothing here schedules checks.

use crate::errors::{ConfigurationError, HealthCheckError, PoolResult};
use crate::metrics::metric_name;
use crate::registry::Timer;

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

#[cfg(feature = "metrics")]
use serde::Serialize;

/// Name of the connectivity check, relative to the pool namespace
pub const CONNECTIVITY_CHECK: &str = "ConnectivityCheck";

/// Name of the 99th percentile wait time check, relative to the pool namespace
pub const CONNECTION_99_PERCENT: &str = "Connection99Percent";

/// Outcome of a single health check evaluation
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::HealthCheckResult;
///
/// let result = HealthCheckResult::unhealthy("no connection within 1000ms");
/// assert!(!result.is_healthy());
/// assert_eq!(result.message(), Some("no connection within 1000ms"));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "metrics", derive(Serialize))]
pub struct HealthCheckResult {
    healthy: bool,
    message: Option<String>,
    timestamp: SystemTime,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn healthy_with(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: Some(message.into()),
            timestamp: SystemTime::now(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            timestamp: SystemTime::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// When the result was produced
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// A named, independently invocable probe
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> Result<HealthCheckResult, HealthCheckError>;
}

/// Blocking acquisition used by [`ConnectivityCheck`]
///
/// Implementations must honor `timeout` inside the acquisition itself and
/// release whatever they acquired before returning.
pub trait ConnectionProbe: Send + Sync {
    fn probe(&self, timeout: Duration) -> PoolResult<()>;
}

/// Verifies a resource can be acquired within a timeout
///
/// Runs on the caller's thread and may block for up to the timeout, so it must
/// not be invoked from code already holding a resource of the same pool.
pub struct ConnectivityCheck {
    pool: Weak<dyn ConnectionProbe>,
    timeout: Duration,
}

impl ConnectivityCheck {
    pub fn new(pool: Weak<dyn ConnectionProbe>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl HealthCheck for ConnectivityCheck {
    fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(HealthCheckResult::unhealthy("pool has been dropped"));
        };

        Ok(match pool.probe(self.timeout) {
            Ok(()) => HealthCheckResult::healthy(),
            Err(err) => HealthCheckResult::unhealthy(err.to_string()),
        })
    }
}

/// Compares the 99th percentile acquisition wait against a threshold
pub struct SlaPercentileCheck {
    wait_timer: Arc<Timer>,
    expected_millis: u64,
}

impl SlaPercentileCheck {
    pub fn new(wait_timer: Arc<Timer>, expected_millis: u64) -> Self {
        Self {
            wait_timer,
            expected_millis,
        }
    }
}

impl HealthCheck for SlaPercentileCheck {
    fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
        let snapshot = self.wait_timer.snapshot();
        let minimum = self.wait_timer.minimum_samples();
        if snapshot.size() < minimum {
            return Ok(HealthCheckResult::healthy_with(format!(
                "insufficient data: {} of {} samples",
                snapshot.size(),
                minimum
            )));
        }

        // compared in nanoseconds so a sub-millisecond overshoot still counts
        let observed_nanos = snapshot.percentile_99();
        if observed_nanos <= self.expected_millis as f64 * 1_000_000.0 {
            Ok(HealthCheckResult::healthy())
        } else {
            Ok(HealthCheckResult::unhealthy(format!(
                "99th percentile connection wait time of {:.1}ms exceeds the threshold {}ms",
                observed_nanos / 1_000_000.0,
                self.expected_millis
            )))
        }
    }
}

/// Thread-safe collection of named health checks
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::{HealthCheck, HealthCheckRegistry, HealthCheckResult, HealthCheckError};
/// use std::sync::Arc;
///
/// struct AlwaysUp;
///
/// impl HealthCheck for AlwaysUp {
///     fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
///         Ok(HealthCheckResult::healthy())
///     }
/// }
///
/// let registry = HealthCheckRegistry::new();
/// registry.register("up", Arc::new(AlwaysUp)).unwrap();
///
/// let results = registry.run_health_checks();
/// assert!(results["up"].is_healthy());
/// ```
#[derive(Default)]
pub struct HealthCheckRegistry {
    checks: DashMap<String, Arc<dyn HealthCheck>>,
}

impl HealthCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, check: Arc<dyn HealthCheck>) -> Result<(), ConfigurationError> {
        match self.checks.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConfigurationError::DuplicateHealthCheck(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(check);
                Ok(())
            }
        }
    }

    /// Remove a check, returning whether it was registered
    pub fn unregister(&self, name: &str) -> bool {
        self.checks.remove(name).is_some()
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.checks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run one check. Returns `None` if nothing is registered under `name`.
    pub fn run_health_check(&self, name: &str) -> Option<HealthCheckResult> {
        // clone out so the map shard is not locked while a probe blocks
        let check = self.checks.get(name).map(|entry| Arc::clone(entry.value()))?;
        Some(execute(name, check.as_ref()))
    }

    /// Run every registered check
    pub fn run_health_checks(&self) -> BTreeMap<String, HealthCheckResult> {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .checks
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        checks
            .into_iter()
            .map(|(name, check)| {
                let result = execute(&name, check.as_ref());
                (name, result)
            })
            .collect()
    }
}

impl fmt::Debug for HealthCheckRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckRegistry")
            .field("checks", &self.names())
            .finish()
    }
}

fn execute(name: &str, check: &dyn HealthCheck) -> HealthCheckResult {
    match panic::catch_unwind(AssertUnwindSafe(|| check.check())) {
        Ok(Ok(result)) => {
            if !result.is_healthy() {
                tracing::debug!(check = name, message = ?result.message(), "health check failed");
            }
            result
        }
        Ok(Err(err)) => {
            tracing::warn!(check = name, error = %err, "health check could not be executed");
            HealthCheckResult::unhealthy(err.to_string())
        }
        Err(_) => {
            tracing::warn!(check = name, "health check panicked");
            HealthCheckResult::unhealthy(format!("health check {} panicked", name))
        }
    }
}

/// Settings for the health checks a pool contributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckProperties {
    /// Maximum wait of the connectivity check; the pool's connection timeout when unset
    pub connectivity_check_timeout: Option<Duration>,

    /// Threshold of the 99th percentile wait check in milliseconds; 0 disables it
    pub expected_99th_percentile_ms: u64,
}

impl HealthCheckProperties {
    /// Apply a string property as used in configuration files
    ///
    /// Recognises `connectivityCheckTimeoutMs` and `expected99thPercentileMs`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigurationError> {
        let invalid = || ConfigurationError::InvalidHealthCheckProperty {
            key: key.to_string(),
            value: value.to_string(),
        };
        let millis: u64 = value.trim().parse().map_err(|_| invalid())?;

        match key {
            "connectivityCheckTimeoutMs" => {
                self.connectivity_check_timeout = Some(Duration::from_millis(millis));
            }
            "expected99thPercentileMs" => {
                self.expected_99th_percentile_ms = millis;
            }
            _ => return Err(invalid()),
        }
        Ok(())
    }
}

/// Register the pool's health checks, returning the names registered
///
/// The percentile check is only added when a threshold is configured and the
/// pool's own tracker registered a wait timer in a
/// [`MetricRegistry`](crate::MetricRegistry).
pub(crate) fn register_health_checks(
    pool_name: &str,
    properties: &HealthCheckProperties,
    default_timeout: Duration,
    pool: Weak<dyn ConnectionProbe>,
    wait_timer: Option<Arc<Timer>>,
    health_registry: &HealthCheckRegistry,
) -> Vec<String> {
    let mut registered = Vec::new();

    let timeout = match properties.connectivity_check_timeout {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => default_timeout,
    };
    let name = metric_name(pool_name, CONNECTIVITY_CHECK);
    match health_registry.register(&name, Arc::new(ConnectivityCheck::new(pool, timeout))) {
        Ok(()) => registered.push(name),
        Err(err) => tracing::warn!(error = %err, "skipping connectivity check"),
    }

    let expected = properties.expected_99th_percentile_ms;
    if expected == 0 {
        return registered;
    }
    let Some(timer) = wait_timer else {
        tracing::warn!(pool = %pool_name, "no wait timer recorded for this pool, skipping wait time percentile check");
        return registered;
    };
    let name = metric_name(pool_name, CONNECTION_99_PERCENT);
    match health_registry.register(&name, Arc::new(SlaPercentileCheck::new(timer, expected))) {
        Ok(()) => registered.push(name),
        Err(err) => tracing::warn!(error = %err, "skipping wait time percentile check"),
    }

    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PoolError;
    use std::time::Instant;

    struct FakePool {
        available: bool,
    }

    impl ConnectionProbe for FakePool {
        fn probe(&self, timeout: Duration) -> PoolResult<()> {
            if self.available {
                Ok(())
            } else {
                std::thread::sleep(timeout);
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    fn connectivity(pool: &Arc<FakePool>, timeout: Duration) -> ConnectivityCheck {
        let probe: Arc<dyn ConnectionProbe> = Arc::clone(pool) as Arc<dyn ConnectionProbe>;
        ConnectivityCheck::new(Arc::downgrade(&probe), timeout)
    }

    #[test]
    fn test_connectivity_healthy() {
        let pool = Arc::new(FakePool { available: true });
        let result = connectivity(&pool, Duration::from_millis(100)).check().unwrap();
        assert!(result.is_healthy());
    }

    #[test]
    fn test_connectivity_times_out() {
        let pool = Arc::new(FakePool { available: false });
        let check = connectivity(&pool, Duration::from_millis(50));

        let start = Instant::now();
        let result = check.check().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!result.is_healthy());
        assert!(result.message().unwrap().contains("timed out"));
    }

    #[test]
    fn test_connectivity_dropped_pool() {
        let check = {
            let pool = Arc::new(FakePool { available: true });
            connectivity(&pool, Duration::from_millis(10))
        };
        assert!(!check.check().unwrap().is_healthy());
    }

    #[test]
    fn test_sla_insufficient_data_is_healthy() {
        let timer = Arc::new(Timer::new(64, 10));
        for _ in 0..9 {
            timer.update(Duration::from_millis(500));
        }
        let result = SlaPercentileCheck::new(timer, 100).check().unwrap();
        assert!(result.is_healthy());
        assert!(result.message().unwrap().contains("insufficient"));
    }

    #[test]
    fn test_sla_threshold() {
        let slow = Arc::new(Timer::new(64, 10));
        let fast = Arc::new(Timer::new(64, 10));
        for _ in 0..20 {
            slow.update(Duration::from_millis(150));
            fast.update(Duration::from_millis(5));
        }

        let result = SlaPercentileCheck::new(slow, 100).check().unwrap();
        assert!(!result.is_healthy());
        assert!(result.message().unwrap().contains("150.0ms"));

        assert!(SlaPercentileCheck::new(fast, 100).check().unwrap().is_healthy());
    }

    #[test]
    fn test_sla_fractional_overshoot_is_unhealthy() {
        let timer = Arc::new(Timer::new(64, 10));
        for _ in 0..20 {
            timer.update(Duration::from_micros(100_400));
        }

        let result = SlaPercentileCheck::new(Arc::clone(&timer), 100).check().unwrap();
        assert!(!result.is_healthy());
        assert!(result.message().unwrap().contains("100.4ms"));
        assert!(SlaPercentileCheck::new(timer, 101).check().unwrap().is_healthy());
    }

    struct Exploding;

    impl HealthCheck for Exploding {
        fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
            panic!("probe bug");
        }
    }

    struct Erroring;

    impl HealthCheck for Erroring {
        fn check(&self) -> Result<HealthCheckResult, HealthCheckError> {
            Err(HealthCheckError::ExecutionFailed("backend unreachable".to_string()))
        }
    }

    #[test]
    fn test_registry_contains_failures() {
        let registry = HealthCheckRegistry::new();
        registry.register("boom", Arc::new(Exploding)).unwrap();
        registry.register("err", Arc::new(Erroring)).unwrap();

        let results = registry.run_health_checks();
        assert_eq!(results.len(), 2);
        assert!(!results["boom"].is_healthy());
        assert!(results["err"].message().unwrap().contains("backend unreachable"));
        assert!(registry.run_health_check("missing").is_none());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = HealthCheckRegistry::new();
        registry.register("a", Arc::new(Erroring)).unwrap();
        assert_eq!(
            registry.register("a", Arc::new(Erroring)),
            Err(ConfigurationError::DuplicateHealthCheck("a".to_string()))
        );
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
    }

    #[test]
    fn test_properties_parse() {
        let mut props = HealthCheckProperties::default();
        props.set("connectivityCheckTimeoutMs", "1000").unwrap();
        props.set("expected99thPercentileMs", "100").unwrap();
        assert_eq!(props.connectivity_check_timeout, Some(Duration::from_secs(1)));
        assert_eq!(props.expected_99th_percentile_ms, 100);

        assert!(props.set("expected99thPercentileMs", "fast").is_err());
        assert!(props.set("unknownProperty", "1").is_err());
    }

    #[test]
    fn test_register_health_checks_names() {
        let pool = Arc::new(FakePool { available: true });
        let probe: Arc<dyn ConnectionProbe> = pool;
        let health = HealthCheckRegistry::new();
        let props = HealthCheckProperties {
            connectivity_check_timeout: None,
            expected_99th_percentile_ms: 100,
        };

        let names = register_health_checks(
            "orders",
            &props,
            Duration::from_secs(1),
            Arc::downgrade(&probe),
            Some(Arc::new(Timer::new(64, 10))),
            &health,
        );

        assert_eq!(
            names,
            vec!["orders.pool.ConnectivityCheck".to_string(), "orders.pool.Connection99Percent".to_string()]
        );
    }

    #[test]
    fn test_percentile_check_skipped_without_wait_timer() {
        let pool = Arc::new(FakePool { available: true });
        let probe: Arc<dyn ConnectionProbe> = pool;
        let health = HealthCheckRegistry::new();
        let props = HealthCheckProperties {
            connectivity_check_timeout: None,
            expected_99th_percentile_ms: 100,
        };

        let names = register_health_checks(
            "orders",
            &props,
            Duration::from_secs(1),
            Arc::downgrade(&probe),
            None,
            &health,
        );

        assert_eq!(names, vec!["orders.pool.ConnectivityCheck".to_string()]);
        assert_eq!(health.names(), names);
    }
}
