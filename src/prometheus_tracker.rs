//! Prometheus metrics backend

use crate::errors::{BackendError, BackendResult};
use crate::metrics::{MetricsTracker, MetricsTrackerFactory, PoolStats};

use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

fn registration_error(err: prometheus::Error) -> BackendError {
    BackendError::Registration(err.to_string())
}

/// Creates [`PrometheusMetricsTracker`]s registered in a `prometheus::Registry`
///
/// # Examples
///
/// ```
/// use esox_poolmetrics::{MetricsBinding, PrometheusMetricsTrackerFactory};
/// use std::sync::Arc;
///
/// let registry = prometheus::Registry::new();
/// let binding = MetricsBinding::factory(Arc::new(PrometheusMetricsTrackerFactory::new(registry)));
/// assert!(binding.metric_registry().is_none());
/// ```
#[derive(Clone)]
pub struct PrometheusMetricsTrackerFactory {
    registry: Registry,
}

impl PrometheusMetricsTrackerFactory {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

impl MetricsTrackerFactory for PrometheusMetricsTrackerFactory {
    fn create(
        &self,
        pool_name: &str,
        pool_stats: Arc<dyn PoolStats>,
    ) -> BackendResult<Box<dyn MetricsTracker>> {
        let tracker = PrometheusMetricsTracker::register(pool_name, self.registry.clone(), pool_stats)?;
        Ok(Box::new(tracker))
    }
}

/// Pool counts sampled from [`PoolStats`] whenever the registry is gathered
#[derive(Clone)]
struct PoolGauges {
    stats: Arc<dyn PoolStats>,
    total: IntGauge,
    idle: IntGauge,
    active: IntGauge,
    pending: IntGauge,
}

impl PoolGauges {
    fn gauges(&self) -> [&IntGauge; 4] {
        [&self.total, &self.idle, &self.active, &self.pending]
    }
}

impl Collector for PoolGauges {
    fn desc(&self) -> Vec<&Desc> {
        self.gauges().into_iter().flat_map(|gauge| gauge.desc()).collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let counts = self.stats.counts();
        self.total.set(counts.total as i64);
        self.idle.set(counts.idle as i64);
        self.active.set(counts.active as i64);
        self.pending.set(counts.waiting as i64);
        self.gauges().into_iter().flat_map(|gauge| gauge.collect()).collect()
    }
}

/// Tracker exporting `objectpool_*` series labelled with the pool name
pub struct PrometheusMetricsTracker {
    registry: Registry,
    registered: Mutex<Vec<Box<dyn Collector>>>,
    wait: Histogram,
    usage: Histogram,
    creation: Histogram,
    timeouts: IntCounter,
    gauges: PoolGauges,
}

impl PrometheusMetricsTracker {
    fn register(pool_name: &str, registry: Registry, stats: Arc<dyn PoolStats>) -> BackendResult<Self> {
        let latency_buckets =
            prometheus::exponential_buckets(0.0005, 2.0, 16).map_err(registration_error)?;

        let histogram = |name: &str, help: &str| {
            Histogram::with_opts(
                HistogramOpts::new(name, help)
                    .const_label("pool", pool_name)
                    .buckets(latency_buckets.clone()),
            )
            .map_err(registration_error)
        };
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help).const_label("pool", pool_name))
                .map_err(registration_error)
        };

        let tracker = Self {
            wait: histogram("objectpool_wait_seconds", "Time spent waiting to acquire a resource")?,
            usage: histogram("objectpool_usage_seconds", "Time a resource was held before release")?,
            creation: histogram("objectpool_creation_seconds", "Time taken to create a resource")?,
            timeouts: IntCounter::with_opts(
                Opts::new("objectpool_timeouts_total", "Acquisitions that timed out")
                    .const_label("pool", pool_name),
            )
            .map_err(registration_error)?,
            gauges: PoolGauges {
                total: gauge("objectpool_resources_total", "Resources owned by the pool")?,
                idle: gauge("objectpool_resources_idle", "Idle resources")?,
                active: gauge("objectpool_resources_active", "Resources checked out")?,
                pending: gauge("objectpool_threads_pending", "Threads waiting for a resource")?,
                stats,
            },
            registered: Mutex::new(Vec::new()),
            registry,
        };

        for (collector, handle) in tracker.collectors().into_iter().zip(tracker.collectors()) {
            if let Err(err) = tracker.registry.register(collector) {
                tracker.close();
                return Err(registration_error(err));
            }
            tracker.registered.lock().push(handle);
        }

        Ok(tracker)
    }

    // Registry::register consumes its box, so unregistering needs fresh handles
    // to the same underlying metrics.
    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.wait.clone()),
            Box::new(self.usage.clone()),
            Box::new(self.creation.clone()),
            Box::new(self.timeouts.clone()),
            Box::new(self.gauges.clone()),
        ]
    }
}

impl MetricsTracker for PrometheusMetricsTracker {
    fn record_connection_created_millis(&self, millis: u64) -> BackendResult<()> {
        self.creation.observe(millis as f64 / 1_000.0);
        Ok(())
    }

    fn record_connection_acquired_nanos(&self, nanos: u64) -> BackendResult<()> {
        self.wait.observe(nanos as f64 / 1_000_000_000.0);
        Ok(())
    }

    fn record_connection_usage_millis(&self, millis: u64) -> BackendResult<()> {
        self.usage.observe(millis as f64 / 1_000.0);
        Ok(())
    }

    fn record_connection_timeout(&self) -> BackendResult<()> {
        self.timeouts.inc();
        Ok(())
    }

    fn close(&self) {
        let registered: Vec<Box<dyn Collector>> = self.registered.lock().drain(..).collect();
        for collector in registered {
            if let Err(err) = self.registry.unregister(collector) {
                tracing::debug!(error = %err, "failed to unregister prometheus collector");
            }
        }
    }
}
