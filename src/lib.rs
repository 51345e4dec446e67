//! # EsoxSolutions.PoolMetrics
//!
//! Pluggable metrics tracking and health checks for thread-safe resource
//! pools.
//!
//! ## Features
//!
//! - Metrics tracker abstraction with a no-op default, an in-memory registry
//!   backend and a Prometheus backend
//! - Acquisition wait timer and usage histogram per pool
//! - Connectivity and 99th percentile wait time health checks
//! - Registry lifecycle gate: registries can be rebound until the pool serves
//!   its first object, never afterwards
//! - Backend failures are contained and counted, never surfaced to callers
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_poolmetrics::{HealthCheckRegistry, MetricRegistry, ObjectPool, PoolConfiguration};
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(MetricRegistry::new());
//! let health = Arc::new(HealthCheckRegistry::new());
//!
//! let pool = ObjectPool::new(
//!     vec![1, 2, 3],
//!     PoolConfiguration::new()
//!         .with_pool_name("orders")
//!         .with_metric_registry(Arc::clone(&metrics))
//!         .with_health_check_registry(Arc::clone(&health)),
//! );
//!
//! {
//!     let obj = pool.get_object().unwrap();
//!     println!("Got: {}", *obj);
//! }
//!
//! let results = health.run_health_checks();
//! assert!(results["orders.pool.ConnectivityCheck"].is_healthy());
//! ```

mod config;
mod errors;
mod gate;
mod health;
mod metrics;
mod pool;
#[cfg(feature = "metrics")]
mod prometheus_tracker;
mod registry;

pub use config::PoolConfiguration;
pub use errors::{BackendError, BackendResult, ConfigurationError, HealthCheckError, PoolError, PoolResult};
pub use gate::{GateState, MetricsBinding, RegistryBindings, RegistryLifecycleGate};
pub use health::{
    CONNECTION_99_PERCENT, CONNECTIVITY_CHECK, ConnectionProbe, ConnectivityCheck, HealthCheck,
    HealthCheckProperties, HealthCheckRegistry, HealthCheckResult, SlaPercentileCheck,
};
pub use metrics::{
    MetricsTracker, MetricsTrackerFactory, NoopMetricsTracker, NoopMetricsTrackerFactory, PoolCounts,
    PoolStats, metric_name,
};
pub use pool::{ObjectPool, PooledObject};
#[cfg(feature = "metrics")]
pub use prometheus_tracker::{PrometheusMetricsTracker, PrometheusMetricsTrackerFactory};
pub use registry::{
    DEFAULT_MINIMUM_SAMPLES, DEFAULT_WINDOW_SIZE, Gauge, Histogram, Meter, Metric, MetricRegistry,
    RegistryMetricsTracker, RegistryMetricsTrackerFactory, Snapshot, Timer,
};
