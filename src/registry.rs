//! In-memory metric registry and the tracker that feeds it
//!
//! This is a deliberately small backend: each timer and histogram keeps a
//! bounded sliding window of recent samples and computes percentiles over that
//! window on demand. It exists so a pool can expose its wait and usage times
//! without pulling in an external metrics system.

use crate::errors::{BackendError, BackendResult};
use crate::metrics::{MetricsTracker, MetricsTrackerFactory, PoolStats, metric_name};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use serde::Serialize;

/// Number of recent samples retained per timer or histogram
pub const DEFAULT_WINDOW_SIZE: usize = 1028;

/// Samples a timer needs before percentile-based health checks trust it
pub const DEFAULT_MINIMUM_SAMPLES: usize = 10;

/// Point-in-time copy of the samples held by a timer or histogram
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "metrics", derive(Serialize))]
pub struct Snapshot {
    values: Vec<u64>,
}

impl Snapshot {
    /// Create a snapshot from unsorted samples
    pub fn new(mut values: Vec<u64>) -> Self {
        values.sort_unstable();
        Self { values }
    }

    /// Value at `quantile` (0.0..=1.0), interpolated between neighbouring samples
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_poolmetrics::Snapshot;
    ///
    /// let snapshot = Snapshot::new(vec![40, 10, 30, 20]);
    /// assert_eq!(snapshot.value(0.0), 10.0);
    /// assert_eq!(snapshot.value(1.0), 40.0);
    /// assert_eq!(snapshot.median(), 25.0);
    /// ```
    pub fn value(&self, quantile: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }

        let quantile = quantile.clamp(0.0, 1.0);
        let len = self.values.len();
        let pos = quantile * (len + 1) as f64;
        let index = pos as usize;

        if index < 1 {
            return self.values[0] as f64;
        }
        if index >= len {
            return self.values[len - 1] as f64;
        }

        let lower = self.values[index - 1] as f64;
        let upper = self.values[index] as f64;
        lower + (pos - pos.floor()) * (upper - lower)
    }

    pub fn median(&self) -> f64 {
        self.value(0.5)
    }

    pub fn percentile_75(&self) -> f64 {
        self.value(0.75)
    }

    pub fn percentile_99(&self) -> f64 {
        self.value(0.99)
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().map(|v| *v as f64).sum::<f64>() / self.values.len() as f64
    }

    pub fn min(&self) -> u64 {
        self.values.first().copied().unwrap_or(0)
    }

    pub fn max(&self) -> u64 {
        self.values.last().copied().unwrap_or(0)
    }

    /// Number of samples in the snapshot
    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Samples in ascending order
    pub fn values(&self) -> &[u64] {
        &self.values
    }
}

struct SlidingWindow {
    values: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl SlidingWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn update(&self, value: u64) {
        let mut values = self.values.lock();
        if values.len() == self.capacity {
            values.pop_front();
        }
        values.push_back(value);
    }

    fn snapshot(&self) -> Snapshot {
        let values = self.values.lock();
        Snapshot::new(values.iter().copied().collect())
    }
}

/// Distribution of values with a running count
pub struct Histogram {
    count: AtomicU64,
    window: SlidingWindow,
}

impl Histogram {
    pub fn new(window_size: usize) -> Self {
        Self {
            count: AtomicU64::new(0),
            window: SlidingWindow::new(window_size),
        }
    }

    pub fn update(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.window.update(value);
    }

    /// Total values ever recorded, including ones evicted from the window
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.window.snapshot()
    }
}

/// Event counter with a mean rate since creation
pub struct Meter {
    count: AtomicU64,
    started: Instant,
}

impl Meter {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn mark(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Events per second since the meter was created
    pub fn mean_rate(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            count as f64 / elapsed
        } else {
            count as f64
        }
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

/// Meter plus a histogram of durations in nanoseconds
pub struct Timer {
    meter: Meter,
    histogram: Histogram,
    minimum_samples: usize,
}

impl Timer {
    pub fn new(window_size: usize, minimum_samples: usize) -> Self {
        Self {
            meter: Meter::new(),
            histogram: Histogram::new(window_size),
            minimum_samples,
        }
    }

    pub fn update(&self, duration: Duration) {
        self.update_nanos(duration.as_nanos() as u64);
    }

    pub fn update_nanos(&self, nanos: u64) {
        self.meter.mark();
        self.histogram.update(nanos);
    }

    pub fn count(&self) -> u64 {
        self.meter.count()
    }

    pub fn mean_rate(&self) -> f64 {
        self.meter.mean_rate()
    }

    /// Snapshot of recent durations, in nanoseconds
    pub fn snapshot(&self) -> Snapshot {
        self.histogram.snapshot()
    }

    /// Samples needed before percentiles of this timer are meaningful
    pub fn minimum_samples(&self) -> usize {
        self.minimum_samples
    }
}

/// Lazily evaluated gauge
pub type Gauge = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A metric stored in a [`MetricRegistry`]
#[derive(Clone)]
pub enum Metric {
    Timer(Arc<Timer>),
    Histogram(Arc<Histogram>),
    Meter(Arc<Meter>),
    Gauge(Gauge),
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Timer(t) => write!(f, "Timer(count={})", t.count()),
            Metric::Histogram(h) => write!(f, "Histogram(count={})", h.count()),
            Metric::Meter(m) => write!(f, "Meter(count={})", m.count()),
            Metric::Gauge(g) => write!(f, "Gauge({})", g()),
        }
    }
}

/// Thread-safe collection of named metrics
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::MetricRegistry;
/// use std::time::Duration;
///
/// let registry = MetricRegistry::new();
/// let timer = registry.timer("orders.pool.Wait").unwrap();
/// timer.update(Duration::from_millis(3));
///
/// assert_eq!(registry.get_timer("orders.pool.Wait").unwrap().count(), 1);
/// assert!(registry.histogram("orders.pool.Wait").is_err());
/// ```
pub struct MetricRegistry {
    metrics: DashMap<String, Metric>,
    window_size: usize,
    minimum_samples: usize,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            metrics: DashMap::new(),
            window_size: DEFAULT_WINDOW_SIZE,
            minimum_samples: DEFAULT_MINIMUM_SAMPLES,
        }
    }

    /// Set how many recent samples each timer and histogram keeps
    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size.max(1);
        self
    }

    /// Set the sample count below which timers report insufficient data
    pub fn with_minimum_samples(mut self, samples: usize) -> Self {
        self.minimum_samples = samples;
        self
    }

    /// Get or create the timer called `name`
    pub fn timer(&self, name: &str) -> BackendResult<Arc<Timer>> {
        match self.metrics.entry(name.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Metric::Timer(timer) => Ok(Arc::clone(timer)),
                _ => Err(BackendError::MetricKindMismatch(name.to_string())),
            },
            Entry::Vacant(entry) => {
                let timer = Arc::new(Timer::new(self.window_size, self.minimum_samples));
                entry.insert(Metric::Timer(Arc::clone(&timer)));
                Ok(timer)
            }
        }
    }

    /// Get or create the histogram called `name`
    pub fn histogram(&self, name: &str) -> BackendResult<Arc<Histogram>> {
        match self.metrics.entry(name.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Metric::Histogram(histogram) => Ok(Arc::clone(histogram)),
                _ => Err(BackendError::MetricKindMismatch(name.to_string())),
            },
            Entry::Vacant(entry) => {
                let histogram = Arc::new(Histogram::new(self.window_size));
                entry.insert(Metric::Histogram(Arc::clone(&histogram)));
                Ok(histogram)
            }
        }
    }

    /// Get or create the meter called `name`
    pub fn meter(&self, name: &str) -> BackendResult<Arc<Meter>> {
        match self.metrics.entry(name.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Metric::Meter(meter) => Ok(Arc::clone(meter)),
                _ => Err(BackendError::MetricKindMismatch(name.to_string())),
            },
            Entry::Vacant(entry) => {
                let meter = Arc::new(Meter::new());
                entry.insert(Metric::Meter(Arc::clone(&meter)));
                Ok(meter)
            }
        }
    }

    /// Register a gauge. Fails if anything is already registered under `name`.
    pub fn register_gauge<F>(&self, name: &str, gauge: F) -> BackendResult<()>
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.insert_new(name, Metric::Gauge(Arc::new(gauge)))
    }

    /// Register a new timer. Unlike [`MetricRegistry::timer`] this fails if
    /// `name` is taken, so the caller knows it owns the result.
    pub fn register_timer(&self, name: &str) -> BackendResult<Arc<Timer>> {
        let timer = Arc::new(Timer::new(self.window_size, self.minimum_samples));
        self.insert_new(name, Metric::Timer(Arc::clone(&timer)))?;
        Ok(timer)
    }

    /// Register a new histogram, failing if `name` is taken
    pub fn register_histogram(&self, name: &str) -> BackendResult<Arc<Histogram>> {
        let histogram = Arc::new(Histogram::new(self.window_size));
        self.insert_new(name, Metric::Histogram(Arc::clone(&histogram)))?;
        Ok(histogram)
    }

    /// Register a new meter, failing if `name` is taken
    pub fn register_meter(&self, name: &str) -> BackendResult<Arc<Meter>> {
        let meter = Arc::new(Meter::new());
        self.insert_new(name, Metric::Meter(Arc::clone(&meter)))?;
        Ok(meter)
    }

    fn insert_new(&self, name: &str, metric: Metric) -> BackendResult<()> {
        match self.metrics.entry(name.to_string()) {
            Entry::Occupied(_) => Err(BackendError::Registration(format!(
                "{} is already registered",
                name
            ))),
            Entry::Vacant(entry) => {
                entry.insert(metric);
                Ok(())
            }
        }
    }

    pub fn get_timer(&self, name: &str) -> Option<Arc<Timer>> {
        match self.metrics.get(name).as_deref() {
            Some(Metric::Timer(timer)) => Some(Arc::clone(timer)),
            _ => None,
        }
    }

    pub fn get_histogram(&self, name: &str) -> Option<Arc<Histogram>> {
        match self.metrics.get(name).as_deref() {
            Some(Metric::Histogram(histogram)) => Some(Arc::clone(histogram)),
            _ => None,
        }
    }

    pub fn get_meter(&self, name: &str) -> Option<Arc<Meter>> {
        match self.metrics.get(name).as_deref() {
            Some(Metric::Meter(meter)) => Some(Arc::clone(meter)),
            _ => None,
        }
    }

    /// Evaluate the gauge called `name`
    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        let gauge = match self.metrics.get(name).as_deref() {
            Some(Metric::Gauge(gauge)) => Arc::clone(gauge),
            _ => return None,
        };
        Some(gauge())
    }

    /// Remove a metric, returning whether it existed
    pub fn remove(&self, name: &str) -> bool {
        self.metrics.remove(name).is_some()
    }

    /// All registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("names", &self.names())
            .field("window_size", &self.window_size)
            .field("minimum_samples", &self.minimum_samples)
            .finish()
    }
}

/// Creates [`RegistryMetricsTracker`]s writing into one [`MetricRegistry`]
#[derive(Debug, Clone)]
pub struct RegistryMetricsTrackerFactory {
    registry: Arc<MetricRegistry>,
}

impl RegistryMetricsTrackerFactory {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }
}

impl MetricsTrackerFactory for RegistryMetricsTrackerFactory {
    fn create(
        &self,
        pool_name: &str,
        pool_stats: Arc<dyn PoolStats>,
    ) -> BackendResult<Box<dyn MetricsTracker>> {
        let tracker = RegistryMetricsTracker::register(pool_name, Arc::clone(&self.registry), pool_stats)?;
        Ok(Box::new(tracker))
    }
}

/// Tracker registering `<pool>.pool.*` metrics in a [`MetricRegistry`]
pub struct RegistryMetricsTracker {
    registry: Arc<MetricRegistry>,
    names: Vec<String>,
    wait: Arc<Timer>,
    usage: Arc<Histogram>,
    creation: Arc<Histogram>,
    timeouts: Arc<Meter>,
    closed: AtomicBool,
}

impl RegistryMetricsTracker {
    fn register(
        pool_name: &str,
        registry: Arc<MetricRegistry>,
        pool_stats: Arc<dyn PoolStats>,
    ) -> BackendResult<Self> {
        let mut names = Vec::new();
        match Self::register_all(pool_name, &registry, pool_stats, &mut names) {
            Ok((wait, usage, creation, timeouts)) => Ok(Self {
                registry,
                names,
                wait,
                usage,
                creation,
                timeouts,
                closed: AtomicBool::new(false),
            }),
            Err(err) => {
                for name in &names {
                    registry.remove(name);
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn register_all(
        pool_name: &str,
        registry: &MetricRegistry,
        pool_stats: Arc<dyn PoolStats>,
        names: &mut Vec<String>,
    ) -> BackendResult<(Arc<Timer>, Arc<Histogram>, Arc<Histogram>, Arc<Meter>)> {
        let name = metric_name(pool_name, "Wait");
        let wait = registry.register_timer(&name)?;
        names.push(name);

        let name = metric_name(pool_name, "Usage");
        let usage = registry.register_histogram(&name)?;
        names.push(name);

        let name = metric_name(pool_name, "ConnectionCreation");
        let creation = registry.register_histogram(&name)?;
        names.push(name);

        let name = metric_name(pool_name, "ConnectionTimeoutRate");
        let timeouts = registry.register_meter(&name)?;
        names.push(name);

        let gauges: [(&str, fn(&crate::metrics::PoolCounts) -> usize); 5] = [
            ("TotalConnections", |c| c.total),
            ("IdleConnections", |c| c.idle),
            ("ActiveConnections", |c| c.active),
            ("PendingConnections", |c| c.waiting),
            ("MaxConnections", |c| c.max),
        ];
        for (metric, read) in gauges {
            let name = metric_name(pool_name, metric);
            let stats = Arc::clone(&pool_stats);
            registry.register_gauge(&name, move || read(&stats.counts()) as i64)?;
            names.push(name);
        }

        Ok((wait, usage, creation, timeouts))
    }

    /// Names this tracker registered
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl MetricsTracker for RegistryMetricsTracker {
    fn record_connection_created_millis(&self, millis: u64) -> BackendResult<()> {
        self.creation.update(millis);
        Ok(())
    }

    fn record_connection_acquired_nanos(&self, nanos: u64) -> BackendResult<()> {
        self.wait.update_nanos(nanos);
        Ok(())
    }

    fn record_connection_usage_millis(&self, millis: u64) -> BackendResult<()> {
        self.usage.update(millis);
        Ok(())
    }

    fn record_connection_timeout(&self) -> BackendResult<()> {
        self.timeouts.mark();
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for name in &self.names {
            self.registry.remove(name);
        }
        tracing::debug!(metrics = self.names.len(), "unregistered pool metrics");
    }
}
