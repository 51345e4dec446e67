//! Instrumented object pool
//!
//! The pool owns its [`RegistryLifecycleGate`]. The first successful
//! acquisition locks the gate, builds the metrics tracker from whatever was
//! bound and registers the pool's health checks. Every later acquisition and
//! release reports to that tracker without taking any pool-wide lock.

use crate::config::PoolConfiguration;
use crate::errors::{ConfigurationError, PoolError, PoolResult};
use crate::gate::{GateState, MetricsBinding, RegistryBindings, RegistryLifecycleGate};
use crate::health::{ConnectionProbe, HealthCheckRegistry, register_health_checks};
use crate::metrics::{MetricsTrackerDelegate, NoopMetricsTracker, PoolCounts, PoolStats, metric_name};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

static POOL_NUMBER: AtomicUsize = AtomicUsize::new(1);

/// Longest a waiting caller blocks before re-checking for close or free capacity
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A pooled object that automatically returns to the pool when dropped
pub struct PooledObject<T> {
    value: Option<T>,
    object_id: usize,
    return_fn: Arc<dyn Fn(T, usize) + Send + Sync>,
}

impl<T> PooledObject<T> {
    fn new(value: T, object_id: usize, return_fn: Arc<dyn Fn(T, usize) + Send + Sync>) -> Self {
        Self {
            value: Some(value),
            object_id,
            return_fn,
        }
    }

    /// Pool-assigned identifier of the object
    pub fn id(&self) -> usize {
        self.object_id
    }
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("Value already taken")
    }
}

impl<T> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("Value already taken")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            (self.return_fn)(value, self.object_id);
        }
    }
}

/// Live counters shared with the metrics tracker
struct PoolCounters {
    checkouts: DashMap<usize, Instant>,
    total: AtomicUsize,
    idle: AtomicUsize,
    waiting: AtomicUsize,
    max: usize,
}

impl PoolStats for PoolCounters {
    fn counts(&self) -> PoolCounts {
        PoolCounts {
            total: self.total.load(Ordering::Relaxed),
            active: self.checkouts.len(),
            idle: self.idle.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            max: self.max,
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;

struct PoolInner<T> {
    name: String,
    self_ref: Weak<PoolInner<T>>,
    sender: Sender<(T, usize)>,
    receiver: Receiver<(T, usize)>,
    counters: Arc<PoolCounters>,
    config: PoolConfiguration<T>,
    factory: Option<Factory<T>>,
    gate: RegistryLifecycleGate,
    tracker: OnceLock<MetricsTrackerDelegate>,
    noop: MetricsTrackerDelegate,
    health_checks: Mutex<Option<(Arc<HealthCheckRegistry>, Vec<String>)>>,
    next_id: AtomicUsize,
    closed: AtomicBool,
}

impl<T: Send + Sync + 'static> PoolInner<T> {
    fn tracker(&self) -> &MetricsTrackerDelegate {
        self.tracker.get().unwrap_or(&self.noop)
    }

    fn acquire(&self, timeout: Duration) -> PoolResult<PooledObject<T>> {
        let started = Instant::now();
        match self.acquire_now(started) {
            Err(PoolError::PoolEmpty) => {}
            other => return other,
        }

        let deadline = started + timeout;
        let _waiting = WaitingGuard::new(&self.counters.waiting);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.receiver.recv_timeout(remaining.min(WAIT_SLICE)) {
                Ok(entry) => {
                    self.counters.idle.fetch_sub(1, Ordering::Relaxed);
                    return Ok(self.checkout(entry, started));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(entry) = self.try_create() {
                        return Ok(self.checkout(entry, started));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(PoolError::PoolClosed),
            }

            if self.closed.load(Ordering::Acquire) {
                return Err(PoolError::PoolClosed);
            }
        }

        self.tracker().record_connection_timeout();
        Err(PoolError::Timeout(timeout))
    }

    fn acquire_now(&self, started: Instant) -> PoolResult<PooledObject<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }

        match self.receiver.try_recv() {
            Ok(entry) => {
                self.counters.idle.fetch_sub(1, Ordering::Relaxed);
                return Ok(self.checkout(entry, started));
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Err(PoolError::PoolClosed),
        }

        match self.try_create() {
            Some(entry) => Ok(self.checkout(entry, started)),
            None => Err(PoolError::PoolEmpty),
        }
    }

    fn try_create(&self) -> Option<(T, usize)> {
        let factory = self.factory.as_ref()?;
        let max = self.counters.max;
        self.counters
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                (total < max).then_some(total + 1)
            })
            .ok()?;

        let started = Instant::now();
        let object = factory();
        self.tracker().record_connection_created(started.elapsed());
        Some((object, self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn checkout(&self, (object, id): (T, usize), started: Instant) -> PooledObject<T> {
        self.tracker.get_or_init(|| self.start());
        self.counters.checkouts.insert(id, Instant::now());
        self.tracker().record_borrow_stats(started);
        PooledObject::new(object, id, self.make_return_fn())
    }

    fn start(&self) -> MetricsTrackerDelegate {
        let bindings = self.gate.on_first_acquisition().unwrap_or_default();
        let stats: Arc<dyn PoolStats> = Arc::clone(&self.counters) as Arc<dyn PoolStats>;
        let factory = bindings.tracker_factory();

        let created = panic::catch_unwind(AssertUnwindSafe(|| factory.create(&self.name, stats)));
        let (tracker, recording) = match created {
            Ok(Ok(tracker)) => (MetricsTrackerDelegate::new(tracker), true),
            Ok(Err(err)) => {
                tracing::warn!(pool = %self.name, error = %err, "metrics tracker unavailable, recording disabled");
                (MetricsTrackerDelegate::new(Box::new(NoopMetricsTracker)), false)
            }
            Err(_) => {
                tracing::warn!(pool = %self.name, "metrics tracker factory panicked, recording disabled");
                (MetricsTrackerDelegate::new(Box::new(NoopMetricsTracker)), false)
            }
        };

        if self.closed.load(Ordering::Acquire) {
            tracker.close();
            return tracker;
        }

        self.register_health_checks(&bindings, recording);
        tracing::debug!(pool = %self.name, "pool started, registries locked");
        tracker
    }

    fn register_health_checks(&self, bindings: &RegistryBindings, recording: bool) {
        let Some(health) = &bindings.health else {
            return;
        };

        // a registered tracker owns this name, so the timer is the one it feeds
        let wait_timer = bindings
            .metrics
            .as_ref()
            .and_then(MetricsBinding::metric_registry)
            .filter(|_| recording)
            .and_then(|registry| registry.get_timer(&metric_name(&self.name, "Wait")));

        let probe: Weak<dyn ConnectionProbe> = self.self_ref.clone();
        let names = register_health_checks(
            &self.name,
            &self.config.health_check_properties,
            self.config.connection_timeout,
            probe,
            wait_timer,
            health,
        );
        *self.health_checks.lock() = Some((Arc::clone(health), names));
    }

    fn make_return_fn(&self) -> Arc<dyn Fn(T, usize) + Send + Sync> {
        let pool = self.self_ref.clone();

        Arc::new(move |obj, id| {
            if let Some(pool) = pool.upgrade() {
                pool.release(obj, id);
            }
        })
    }

    fn release(&self, obj: T, id: usize) {
        if let Some((_, checked_out)) = self.counters.checkouts.remove(&id) {
            self.tracker().record_connection_usage(checked_out.elapsed());
        }

        // Validate if configured
        if self.config.validate_on_return {
            if let Some(validate) = self.config.validation_function {
                if !validate(&obj) {
                    self.discard();
                    return;
                }
            }
        }

        if self.closed.load(Ordering::Acquire) {
            self.discard();
            return;
        }

        self.counters.idle.fetch_add(1, Ordering::Relaxed);
        if self.sender.try_send((obj, id)).is_err() {
            self.counters.idle.fetch_sub(1, Ordering::Relaxed);
            self.discard();
        }
    }
}

impl<T> PoolInner<T> {
    fn discard(&self) {
        self.counters.total.fetch_sub(1, Ordering::AcqRel);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        while self.receiver.try_recv().is_ok() {
            self.counters.idle.fetch_sub(1, Ordering::Relaxed);
            self.discard();
        }

        if let Some(tracker) = self.tracker.get() {
            tracker.close();
        }

        if let Some((registry, names)) = self.health_checks.lock().take() {
            for name in names {
                registry.unregister(&name);
            }
        }

        tracing::debug!(pool = %self.name, "pool closed");
    }
}

impl<T: Send + Sync + 'static> ConnectionProbe for PoolInner<T> {
    fn probe(&self, timeout: Duration) -> PoolResult<()> {
        let object = self.acquire(timeout)?;
        if let Some(validate) = self.config.validation_function {
            if !validate(&object) {
                return Err(PoolError::ValidationFailed);
            }
        }
        Ok(())
    }
}

impl<T> Drop for PoolInner<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Thread-safe, instrumented object pool
///
/// Cloning the pool yields another handle to the same objects.
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::{MetricRegistry, ObjectPool, PoolConfiguration};
/// use std::sync::Arc;
///
/// let metrics = Arc::new(MetricRegistry::new());
/// let config = PoolConfiguration::new()
///     .with_pool_name("orders")
///     .with_metric_registry(Arc::clone(&metrics));
/// let pool = ObjectPool::new(vec![1, 2, 3], config);
///
/// {
///     let obj = pool.get_object().unwrap();
///     assert!([1, 2, 3].contains(&*obj));
/// }
///
/// assert_eq!(metrics.get_timer("orders.pool.Wait").unwrap().count(), 1);
/// assert_eq!(metrics.get_histogram("orders.pool.Usage").unwrap().count(), 1);
/// ```
pub struct ObjectPool<T: Send> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> ObjectPool<T> {
    /// Create a pool over a fixed set of objects
    pub fn new(objects: Vec<T>, config: PoolConfiguration<T>) -> Self {
        Self::build(objects, None, config)
    }

    /// Create a pool that creates objects on demand, up to `max_pool_size`
    pub fn with_factory<F>(factory: F, config: PoolConfiguration<T>) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(Vec::new(), Some(Arc::new(factory)), config)
    }

    fn build(objects: Vec<T>, factory: Option<Factory<T>>, config: PoolConfiguration<T>) -> Self {
        let capacity = objects.len().max(config.max_pool_size).max(1);
        let (sender, receiver) = channel::bounded(capacity);

        let counters = Arc::new(PoolCounters {
            checkouts: DashMap::new(),
            total: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            max: capacity,
        });

        let mut next_id = 0;
        for obj in objects {
            if sender.try_send((obj, next_id)).is_ok() {
                counters.total.fetch_add(1, Ordering::Relaxed);
                counters.idle.fetch_add(1, Ordering::Relaxed);
            }
            next_id += 1;
        }

        let name = config
            .pool_name
            .clone()
            .unwrap_or_else(|| format!("pool-{}", POOL_NUMBER.fetch_add(1, Ordering::Relaxed)));

        let gate = RegistryLifecycleGate::new();
        if config.metrics.is_some() || config.health_check_registry.is_some() {
            // a fresh gate is never locked
            let _ = gate.bind(config.metrics.clone(), config.health_check_registry.clone());
        }

        let inner = Arc::new_cyclic(|self_ref| PoolInner {
            name,
            self_ref: self_ref.clone(),
            sender,
            receiver,
            counters,
            config,
            factory,
            gate,
            tracker: OnceLock::new(),
            noop: MetricsTrackerDelegate::noop(),
            health_checks: Mutex::new(None),
            next_id: AtomicUsize::new(next_id),
            closed: AtomicBool::new(false),
        });

        Self { inner }
    }

    /// Name namespacing this pool's metrics and health checks
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get an object, waiting up to the configured connection timeout
    pub fn get_object(&self) -> PoolResult<PooledObject<T>> {
        self.inner.acquire(self.inner.config.connection_timeout)
    }

    /// Get an object, waiting up to `timeout`
    pub fn get_object_timeout(&self, timeout: Duration) -> PoolResult<PooledObject<T>> {
        self.inner.acquire(timeout)
    }

    /// Try to get an object without waiting
    pub fn try_get_object(&self) -> Option<PooledObject<T>> {
        self.inner.acquire_now(Instant::now()).ok()
    }

    /// Get an object asynchronously with timeout
    pub async fn get_object_async(&self) -> PoolResult<PooledObject<T>> {
        let timeout = self.inner.config.connection_timeout;
        let started = Instant::now();
        let inner = &self.inner;

        let result = tokio::time::timeout(timeout, async {
            let mut waiting = None;
            loop {
                match inner.acquire_now(started) {
                    Err(PoolError::PoolEmpty) => {
                        waiting.get_or_insert_with(|| WaitingGuard::new(&inner.counters.waiting));
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    other => return other,
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                inner.tracker().record_connection_timeout();
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    /// Replace the metrics backend and health check registry
    ///
    /// Fails with [`ConfigurationError::RegistryLocked`] once the pool has
    /// served its first object.
    pub fn bind_registries(
        &self,
        metrics: Option<MetricsBinding>,
        health: Option<Arc<HealthCheckRegistry>>,
    ) -> Result<(), ConfigurationError> {
        self.inner.gate.bind(metrics, health)
    }

    /// Replace the metrics backend
    pub fn set_metrics(&self, metrics: MetricsBinding) -> Result<(), ConfigurationError> {
        self.inner.gate.bind_metrics(metrics)
    }

    /// Replace the health check registry
    pub fn set_health_check_registry(&self, registry: Arc<HealthCheckRegistry>) -> Result<(), ConfigurationError> {
        self.inner.gate.bind_health(registry)
    }

    /// State of the registry lifecycle gate
    pub fn gate_state(&self) -> GateState {
        self.inner.gate.state()
    }

    /// Current resource counts
    pub fn counts(&self) -> PoolCounts {
        self.inner.counters.counts()
    }

    /// Get available count
    pub fn available_count(&self) -> usize {
        self.inner.counters.idle.load(Ordering::Relaxed)
    }

    /// Get active count
    pub fn active_count(&self) -> usize {
        self.inner.counters.checkouts.len()
    }

    /// Backend failures swallowed while recording metrics
    pub fn instrumentation_errors(&self) -> u64 {
        self.inner.tracker().instrumentation_errors()
    }

    /// Close the pool: drop idle objects, unregister metrics and health checks
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
