//! Pool configuration options

use crate::errors::ConfigurationError;
use crate::gate::MetricsBinding;
use crate::health::{HealthCheckProperties, HealthCheckRegistry};
use crate::metrics::MetricsTrackerFactory;
use crate::registry::MetricRegistry;

use std::sync::Arc;
use std::time::Duration;

/// Configuration for pool behavior and instrumentation
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::{MetricRegistry, PoolConfiguration};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::<i32>::new()
///     .with_pool_name("orders")
///     .with_max_pool_size(10)
///     .with_timeout(Duration::from_secs(5))
///     .with_metric_registry(Arc::new(MetricRegistry::new()))
///     .with_health_check_property("expected99thPercentileMs", "100")
///     .unwrap();
///
/// assert_eq!(config.max_pool_size, 10);
/// assert_eq!(config.health_check_properties.expected_99th_percentile_ms, 100);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration<T> {
    /// Name used to namespace metrics and health checks; generated when unset
    pub pool_name: Option<String>,

    /// Maximum number of objects that can exist in the pool
    pub max_pool_size: usize,

    /// How long an acquisition waits for an object before timing out
    pub connection_timeout: Duration,

    /// Whether to validate objects when they are returned to the pool
    pub validate_on_return: bool,

    /// Custom validation function
    pub validation_function: Option<fn(&T) -> bool>,

    /// Metrics backend bound at construction
    pub metrics: Option<MetricsBinding>,

    /// Health check registry bound at construction
    pub health_check_registry: Option<Arc<HealthCheckRegistry>>,

    /// Settings of the pool's own health checks
    pub health_check_properties: HealthCheckProperties,
}

impl<T> Default for PoolConfiguration<T> {
    fn default() -> Self {
        Self {
            pool_name: None,
            max_pool_size: 10,
            connection_timeout: Duration::from_secs(30),
            validate_on_return: false,
            validation_function: None,
            metrics: None,
            health_check_registry: None,
            health_check_properties: HealthCheckProperties::default(),
        }
    }
}

impl<T> PoolConfiguration<T> {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool name
    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = Some(name.into());
        self
    }

    /// Set the maximum pool size
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_poolmetrics::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::<i32>::new()
    ///     .with_max_pool_size(50);
    ///
    /// assert_eq!(config.max_pool_size, 50);
    /// ```
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Enable validation on return
    pub fn with_validation(mut self, func: fn(&T) -> bool) -> Self {
        self.validate_on_return = true;
        self.validation_function = Some(func);
        self
    }

    /// Set the acquisition timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Report metrics to the given backend
    pub fn with_metrics(mut self, metrics: MetricsBinding) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report metrics to an in-memory [`MetricRegistry`]
    pub fn with_metric_registry(self, registry: Arc<MetricRegistry>) -> Self {
        self.with_metrics(MetricsBinding::registry(registry))
    }

    /// Report metrics through a custom tracker factory
    pub fn with_metrics_tracker_factory(self, factory: Arc<dyn MetricsTrackerFactory>) -> Self {
        self.with_metrics(MetricsBinding::factory(factory))
    }

    /// Register the pool's health checks in `registry`
    pub fn with_health_check_registry(mut self, registry: Arc<HealthCheckRegistry>) -> Self {
        self.health_check_registry = Some(registry);
        self
    }

    /// Replace the health check settings
    pub fn with_health_check_properties(mut self, properties: HealthCheckProperties) -> Self {
        self.health_check_properties = properties;
        self
    }

    /// Set a single health check property by its configuration key
    pub fn with_health_check_property(mut self, key: &str, value: &str) -> Result<Self, ConfigurationError> {
        self.health_check_properties.set(key, value)?;
        Ok(self)
    }
}
