//! Registry lifecycle gate
//!
//! Metrics and health registries may be bound and rebound freely until the
//! pool services its first acquisition. At that moment the gate locks, hands
//! the final bindings to the pool and refuses every later bind.

use crate::errors::ConfigurationError;
use crate::health::HealthCheckRegistry;
use crate::metrics::{MetricsTrackerFactory, NoopMetricsTrackerFactory};
use crate::registry::{MetricRegistry, RegistryMetricsTrackerFactory};

use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// Metrics backend a pool reports to
#[derive(Clone)]
pub enum MetricsBinding {
    /// The in-memory [`MetricRegistry`]; also enables the percentile health check
    Registry(Arc<MetricRegistry>),

    /// Any other backend
    Factory(Arc<dyn MetricsTrackerFactory>),
}

impl MetricsBinding {
    pub fn registry(registry: Arc<MetricRegistry>) -> Self {
        Self::Registry(registry)
    }

    pub fn factory(factory: Arc<dyn MetricsTrackerFactory>) -> Self {
        Self::Factory(factory)
    }

    /// Report to a Prometheus registry
    #[cfg(feature = "metrics")]
    pub fn prometheus(registry: prometheus::Registry) -> Self {
        Self::Factory(Arc::new(crate::prometheus_tracker::PrometheusMetricsTrackerFactory::new(
            registry,
        )))
    }

    /// Factory that builds the pool's tracker for this backend
    pub fn tracker_factory(&self) -> Arc<dyn MetricsTrackerFactory> {
        match self {
            Self::Registry(registry) => Arc::new(RegistryMetricsTrackerFactory::new(Arc::clone(registry))),
            Self::Factory(factory) => Arc::clone(factory),
        }
    }

    pub fn metric_registry(&self) -> Option<&Arc<MetricRegistry>> {
        match self {
            Self::Registry(registry) => Some(registry),
            Self::Factory(_) => None,
        }
    }
}

impl fmt::Debug for MetricsBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(registry) => f.debug_tuple("Registry").field(registry).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// Registries captured by the gate when it locks
#[derive(Debug, Clone, Default)]
pub struct RegistryBindings {
    pub metrics: Option<MetricsBinding>,
    pub health: Option<Arc<HealthCheckRegistry>>,
}

impl RegistryBindings {
    /// Factory for the pool's tracker, the no-op one when no metrics are bound
    pub fn tracker_factory(&self) -> Arc<dyn MetricsTrackerFactory> {
        match &self.metrics {
            Some(binding) => binding.tracker_factory(),
            None => Arc::new(NoopMetricsTrackerFactory),
        }
    }
}

/// Observable state of a [`RegistryLifecycleGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unbound,
    Bound,
    Locked,
}

enum Slot {
    Unbound,
    Bound(RegistryBindings),
    Locked,
}

/// One-shot lock over a pool's registry bindings
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::{ConfigurationError, GateState, HealthCheckRegistry, RegistryLifecycleGate};
/// use std::sync::Arc;
///
/// let gate = RegistryLifecycleGate::new();
/// gate.bind_health(Arc::new(HealthCheckRegistry::new())).unwrap();
/// assert_eq!(gate.state(), GateState::Bound);
///
/// let bindings = gate.on_first_acquisition().unwrap();
/// assert!(bindings.health.is_some());
///
/// assert_eq!(
///     gate.bind_health(Arc::new(HealthCheckRegistry::new())),
///     Err(ConfigurationError::RegistryLocked)
/// );
/// ```
pub struct RegistryLifecycleGate {
    slot: Mutex<Slot>,
}

impl RegistryLifecycleGate {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Unbound),
        }
    }

    pub fn state(&self) -> GateState {
        match *self.slot.lock() {
            Slot::Unbound => GateState::Unbound,
            Slot::Bound(_) => GateState::Bound,
            Slot::Locked => GateState::Locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state() == GateState::Locked
    }

    /// Replace both bindings
    pub fn bind(
        &self,
        metrics: Option<MetricsBinding>,
        health: Option<Arc<HealthCheckRegistry>>,
    ) -> Result<(), ConfigurationError> {
        self.update(|bindings| RegistryBindings {
            metrics: mem::replace(&mut bindings.metrics, metrics),
            health: mem::replace(&mut bindings.health, health),
        })
    }

    /// Replace only the metrics binding
    pub fn bind_metrics(&self, metrics: MetricsBinding) -> Result<(), ConfigurationError> {
        self.update(|bindings| RegistryBindings {
            metrics: bindings.metrics.replace(metrics),
            health: None,
        })
    }

    /// Replace only the health check registry
    pub fn bind_health(&self, health: Arc<HealthCheckRegistry>) -> Result<(), ConfigurationError> {
        self.update(|bindings| RegistryBindings {
            metrics: None,
            health: bindings.health.replace(health),
        })
    }

    /// Lock the gate and take the final bindings
    ///
    /// Returns `None` if the gate was already locked.
    pub fn on_first_acquisition(&self) -> Option<RegistryBindings> {
        let previous = mem::replace(&mut *self.slot.lock(), Slot::Locked);
        match previous {
            Slot::Unbound => Some(RegistryBindings::default()),
            Slot::Bound(bindings) => Some(bindings),
            Slot::Locked => None,
        }
    }

    /// Apply a rebinding. `apply` returns the displaced bindings, which are
    /// dropped only after the slot lock is released.
    fn update<F>(&self, apply: F) -> Result<(), ConfigurationError>
    where
        F: FnOnce(&mut RegistryBindings) -> RegistryBindings,
    {
        let displaced = {
            let mut slot = self.slot.lock();
            if let Slot::Unbound = *slot {
                *slot = Slot::Bound(RegistryBindings::default());
            }
            match &mut *slot {
                Slot::Bound(bindings) => Ok(apply(bindings)),
                _ => Err(ConfigurationError::RegistryLocked),
            }
        };

        match displaced {
            Ok(previous) => {
                drop(previous);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("rejected registry bind after the pool started");
                Err(err)
            }
        }
    }
}

impl Default for RegistryLifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegistryLifecycleGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLifecycleGate")
            .field("state", &self.state())
            .finish()
    }
}
