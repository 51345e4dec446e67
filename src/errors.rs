//! Error types for the pool and its instrumentation

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the pool facade to callers acquiring resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool is empty - no objects available")]
    PoolEmpty,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Object validation failed")]
    ValidationFailed,

    #[error("Pool has been closed")]
    PoolClosed,
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised while configuring registries or health checks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("registry already locked")]
    RegistryLocked,

    #[error("Invalid health check property {key}={value}")]
    InvalidHealthCheckProperty { key: String, value: String },

    #[error("A health check named {0} already exists")]
    DuplicateHealthCheck(String),
}

/// Failures reported by a metrics backend
///
/// These never reach pool callers; the tracker delegate counts and drops them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Metric {0} is already registered with a different type")]
    MetricKindMismatch(String),

    #[error("Metric registration failed: {0}")]
    Registration(String),

    #[error("Backend call failed: {0}")]
    Failed(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A health check that could not be evaluated at all
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error("Health check execution failed: {0}")]
    ExecutionFailed(String),
}
