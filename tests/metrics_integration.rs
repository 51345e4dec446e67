use esox_poolmetrics::{
    BackendError, BackendResult, ConfigurationError, GateState, HealthCheckRegistry, MetricRegistry,
    MetricsBinding, MetricsTracker, MetricsTrackerFactory, ObjectPool, PoolConfiguration, PoolStats,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn config(name: &str, size: usize) -> PoolConfiguration<usize> {
    PoolConfiguration::new()
        .with_pool_name(name)
        .with_max_pool_size(size)
}

fn pool(size: usize, config: PoolConfiguration<usize>) -> ObjectPool<usize> {
    ObjectPool::new((0..size).collect(), config)
}

#[test]
fn test_health_checks() {
    let metrics = Arc::new(MetricRegistry::new());
    let health = Arc::new(HealthCheckRegistry::new());
    let config = config("testHealthChecks", 10)
        .with_metric_registry(Arc::clone(&metrics))
        .with_health_check_registry(Arc::clone(&health))
        .with_health_check_property("connectivityCheckTimeoutMs", "1000")
        .unwrap()
        .with_health_check_property("expected99thPercentileMs", "100")
        .unwrap();
    let pool = pool(10, config);

    drop(pool.get_object().unwrap());
    drop(pool.get_object().unwrap());

    let results = health.run_health_checks();
    assert!(results["testHealthChecks.pool.ConnectivityCheck"].is_healthy());
    assert!(results["testHealthChecks.pool.Connection99Percent"].is_healthy());
}

#[test]
fn test_setters_after_start_fail() {
    let pool = pool(1, config("testSetters1", 1));
    drop(pool.get_object().unwrap());

    let metrics = Arc::new(MetricRegistry::new());
    let health = Arc::new(HealthCheckRegistry::new());
    assert_eq!(
        pool.set_metrics(MetricsBinding::registry(Arc::clone(&metrics))),
        Err(ConfigurationError::RegistryLocked)
    );
    assert_eq!(
        pool.set_health_check_registry(Arc::clone(&health)),
        Err(ConfigurationError::RegistryLocked)
    );
    assert!(metrics.is_empty());
    assert!(health.names().is_empty());
}

#[test]
fn test_setters_before_start_succeed_repeatedly() {
    let pool = pool(1, config("testSetters2", 1));
    let metrics = Arc::new(MetricRegistry::new());
    let health = Arc::new(HealthCheckRegistry::new());

    for _ in 0..3 {
        pool.set_metrics(MetricsBinding::registry(Arc::clone(&metrics))).unwrap();
        pool.set_health_check_registry(Arc::clone(&health)).unwrap();
    }

    let _connection = pool.get_object().unwrap();
    assert_eq!(pool.gate_state(), GateState::Locked);
    assert_eq!(
        pool.set_metrics(MetricsBinding::registry(Arc::clone(&metrics))),
        Err(ConfigurationError::RegistryLocked)
    );
    assert!(metrics.get_timer("testSetters2.pool.Wait").is_some());
}

#[test]
fn test_last_binding_wins() {
    let first = Arc::new(MetricRegistry::new());
    let second = Arc::new(MetricRegistry::new());
    let pool = pool(1, config("lastWins", 1).with_metric_registry(Arc::clone(&first)));

    pool.bind_registries(Some(MetricsBinding::registry(Arc::clone(&second))), None)
        .unwrap();
    drop(pool.get_object().unwrap());

    assert!(first.is_empty());
    assert_eq!(second.get_timer("lastWins.pool.Wait").unwrap().count(), 1);
}

#[test]
fn test_metric_wait() {
    let metrics = Arc::new(MetricRegistry::new());
    let pool = pool(1, config("testMetricWait", 1).with_metric_registry(Arc::clone(&metrics)));

    drop(pool.get_object().unwrap());

    let timer = metrics.get_timer("testMetricWait.pool.Wait").unwrap();
    assert_eq!(timer.count(), 1);
    assert!(timer.mean_rate() > 0.0);
}

#[test]
fn test_metric_usage() {
    let metrics = Arc::new(MetricRegistry::new());
    let pool = pool(1, config("testMetricUsage", 1).with_metric_registry(Arc::clone(&metrics)));

    {
        let _connection = pool.get_object().unwrap();
        thread::sleep(Duration::from_millis(250));
    }

    let histogram = metrics.get_histogram("testMetricUsage.pool.Usage").unwrap();
    assert_eq!(histogram.count(), 1);
    let seventy_fifth = histogram.snapshot().percentile_75();
    assert!(seventy_fifth >= 250.0, "75th percentile below 250ms: {}", seventy_fifth);
}

#[test]
fn test_counts_match_under_concurrency() {
    let metrics = Arc::new(MetricRegistry::new());
    let pool = pool(4, config("concurrent", 4).with_metric_registry(Arc::clone(&metrics)));

    let threads = 8;
    let per_thread = 250;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_thread {
                    let obj = pool.get_object_timeout(Duration::from_secs(10)).unwrap();
                    std::hint::black_box(*obj);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (threads * per_thread) as u64;
    assert_eq!(metrics.get_timer("concurrent.pool.Wait").unwrap().count(), expected);
    assert_eq!(metrics.get_histogram("concurrent.pool.Usage").unwrap().count(), expected);
    assert_eq!(pool.available_count(), 4);
    assert_eq!(pool.active_count(), 0);
}

#[test]
fn test_connectivity_check_with_held_resource() {
    let health = Arc::new(HealthCheckRegistry::new());
    let config = config("held", 1)
        .with_health_check_registry(Arc::clone(&health))
        .with_health_check_property("connectivityCheckTimeoutMs", "200")
        .unwrap();
    let pool = pool(1, config);

    let held = pool.get_object().unwrap();

    let start = Instant::now();
    let result = health.run_health_check("held.pool.ConnectivityCheck").unwrap();
    let elapsed = start.elapsed();

    assert!(!result.is_healthy());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5));
    assert!(result.message().unwrap().contains("timed out"));

    drop(held);
    assert!(health.run_health_check("held.pool.ConnectivityCheck").unwrap().is_healthy());
}

#[test]
fn test_connectivity_check_reports_validation_failure() {
    let health = Arc::new(HealthCheckRegistry::new());
    let config = config("invalid", 2)
        .with_validation(|v| *v != 1)
        .with_health_check_registry(Arc::clone(&health));
    let pool = ObjectPool::new(vec![0, 1], config);

    // take the valid object so the probe gets the invalid one
    let _valid = pool.get_object().unwrap();
    let result = health.run_health_check("invalid.pool.ConnectivityCheck").unwrap();

    assert!(!result.is_healthy());
    assert_eq!(result.message(), Some("Object validation failed"));
}

#[test]
fn test_percentile_check_detects_slow_waits() {
    let metrics = Arc::new(MetricRegistry::new().with_minimum_samples(3));
    let health = Arc::new(HealthCheckRegistry::new());
    let config = config("slow", 1)
        .with_metric_registry(Arc::clone(&metrics))
        .with_health_check_registry(Arc::clone(&health))
        .with_health_check_property("expected99thPercentileMs", "100")
        .unwrap();
    let pool = pool(1, config);

    drop(pool.get_object().unwrap());
    drop(pool.get_object().unwrap());
    let check = "slow.pool.Connection99Percent";
    let early = health.run_health_check(check).unwrap();
    assert!(early.is_healthy());
    assert!(early.message().unwrap().contains("insufficient"));

    let held = pool.get_object().unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        drop(held);
    });
    drop(pool.get_object_timeout(Duration::from_secs(5)).unwrap());
    releaser.join().unwrap();

    let result = health.run_health_check(check).unwrap();
    assert!(!result.is_healthy());
    assert!(result.message().unwrap().contains("exceeds the threshold 100ms"));
}

#[test]
fn test_close_twice_leaves_no_registrations() {
    let metrics = Arc::new(MetricRegistry::new());
    let health = Arc::new(HealthCheckRegistry::new());
    let config = config("closing", 2)
        .with_metric_registry(Arc::clone(&metrics))
        .with_health_check_registry(Arc::clone(&health))
        .with_health_check_property("expected99thPercentileMs", "50")
        .unwrap();
    let pool = pool(2, config);

    drop(pool.get_object().unwrap());
    assert_eq!(health.names().len(), 2);

    pool.close();
    pool.close();
    assert!(metrics.is_empty());
    assert!(health.names().is_empty());
}

struct CapturingFactory {
    names: Mutex<Vec<String>>,
    stats: Mutex<Option<Arc<dyn PoolStats>>>,
}

impl MetricsTrackerFactory for CapturingFactory {
    fn create(&self, pool_name: &str, pool_stats: Arc<dyn PoolStats>) -> BackendResult<Box<dyn MetricsTracker>> {
        self.names.lock().unwrap().push(pool_name.to_string());
        *self.stats.lock().unwrap() = Some(pool_stats);
        Ok(Box::new(FlakyTracker::default()))
    }
}

#[derive(Default)]
struct FlakyTracker {
    calls: AtomicUsize,
}

impl MetricsTracker for FlakyTracker {
    fn record_connection_acquired_nanos(&self, _nanos: u64) -> BackendResult<()> {
        if self.calls.fetch_add(1, Ordering::Relaxed) % 2 == 0 {
            Err(BackendError::Failed("remote push rejected".to_string()))
        } else {
            Ok(())
        }
    }

    fn record_connection_usage_millis(&self, _millis: u64) -> BackendResult<()> {
        panic!("histogram overflow");
    }
}

#[test]
fn test_custom_backend_failures_never_break_the_pool() {
    let factory = Arc::new(CapturingFactory {
        names: Mutex::new(Vec::new()),
        stats: Mutex::new(None),
    });
    let config = config("flaky", 2).with_metrics_tracker_factory(factory.clone());
    let pool = pool(2, config);

    for _ in 0..4 {
        let obj = pool.get_object().unwrap();
        assert!(*obj < 2);
    }

    assert_eq!(*factory.names.lock().unwrap(), vec!["flaky".to_string()]);
    // two failed waits and four panicking usage records
    assert_eq!(pool.instrumentation_errors(), 6);
    assert_eq!(pool.available_count(), 2);

    let stats = factory.stats.lock().unwrap().clone().unwrap();
    let counts = stats.counts();
    assert_eq!(counts.total, 2);
    assert_eq!(counts.idle, 2);
    assert_eq!(counts.active, 0);
}

#[test]
fn test_duplicate_pool_name_keeps_first_pool_metrics() {
    let metrics = Arc::new(MetricRegistry::new());
    let first = pool(1, config("dup", 1).with_metric_registry(Arc::clone(&metrics)));
    let second = pool(1, config("dup", 1).with_metric_registry(Arc::clone(&metrics)));

    drop(first.get_object().unwrap());
    drop(second.get_object().unwrap());
    drop(first.get_object().unwrap());

    let wait = metrics.get_timer("dup.pool.Wait").unwrap();
    assert_eq!(wait.count(), 2);
    assert_eq!(metrics.get_histogram("dup.pool.Usage").unwrap().count(), 2);
    assert_eq!(metrics.len(), 9);

    second.close();
    assert_eq!(metrics.len(), 9);
    first.close();
    assert!(metrics.is_empty());
}

#[test]
fn test_failed_registry_tracker_skips_percentile_check() {
    let metrics = Arc::new(MetricRegistry::new().with_minimum_samples(1));
    metrics.register_gauge("orph.pool.IdleConnections", || -1).unwrap();
    let health = Arc::new(HealthCheckRegistry::new());
    let config = config("orph", 1)
        .with_metric_registry(Arc::clone(&metrics))
        .with_health_check_registry(Arc::clone(&health))
        .with_health_check_property("expected99thPercentileMs", "100")
        .unwrap();
    let pool = pool(1, config);

    for _ in 0..5 {
        drop(pool.get_object().unwrap());
    }

    assert_eq!(pool.gate_state(), GateState::Locked);
    assert_eq!(health.names(), vec!["orph.pool.ConnectivityCheck".to_string()]);
    assert_eq!(metrics.names(), vec!["orph.pool.IdleConnections".to_string()]);

    pool.close();
    assert_eq!(metrics.names(), vec!["orph.pool.IdleConnections".to_string()]);
    assert!(health.names().is_empty());
}

struct BrokenFactory {
    panics: bool,
    calls: AtomicUsize,
}

impl MetricsTrackerFactory for BrokenFactory {
    fn create(&self, _pool_name: &str, _pool_stats: Arc<dyn PoolStats>) -> BackendResult<Box<dyn MetricsTracker>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.panics {
            panic!("backend misconfigured");
        }
        Err(BackendError::Registration("collector already exists".to_string()))
    }
}

#[test]
fn test_tracker_factory_failure_falls_back_to_noop() {
    for panics in [false, true] {
        let factory = Arc::new(BrokenFactory {
            panics,
            calls: AtomicUsize::new(0),
        });
        let health = Arc::new(HealthCheckRegistry::new());
        let config = config("broken", 2)
            .with_metrics_tracker_factory(factory.clone())
            .with_health_check_registry(Arc::clone(&health));
        let pool = pool(2, config);

        for _ in 0..3 {
            let obj = pool.get_object().unwrap();
            assert!(*obj < 2);
        }

        assert_eq!(factory.calls.load(Ordering::Relaxed), 1);
        assert_eq!(pool.gate_state(), GateState::Locked);
        assert_eq!(pool.instrumentation_errors(), 0);
        assert_eq!(pool.available_count(), 2);
        assert!(health.run_health_check("broken.pool.ConnectivityCheck").unwrap().is_healthy());
        assert_eq!(
            pool.set_metrics(MetricsBinding::registry(Arc::new(MetricRegistry::new()))),
            Err(ConfigurationError::RegistryLocked)
        );
    }
}

#[test]
fn test_pool_runs_without_backend() {
    let pool = pool(1, config("bare", 1));
    drop(pool.get_object().unwrap());
    assert_eq!(pool.gate_state(), GateState::Locked);
    assert_eq!(pool.instrumentation_errors(), 0);
}

#[cfg(feature = "metrics")]
#[test]
fn test_prometheus_backend() {
    let registry = prometheus::Registry::new();
    let pool = pool(1, config("prom", 1).with_metrics(MetricsBinding::prometheus(registry.clone())));

    drop(pool.get_object().unwrap());

    let families = registry.gather();
    let wait = families
        .iter()
        .find(|mf| mf.get_name() == "objectpool_wait_seconds")
        .unwrap();
    assert_eq!(wait.get_metric()[0].get_histogram().get_sample_count(), 1);

    pool.close();
    assert!(registry.gather().is_empty());
}

#[cfg(feature = "metrics")]
#[test]
fn test_prometheus_gauges_track_released_resources() {
    let registry = prometheus::Registry::new();
    let pool = pool(1, config("promIdle", 1).with_metrics(MetricsBinding::prometheus(registry.clone())));

    drop(pool.get_object().unwrap());

    let gauge = |name: &str| {
        registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)
            .map(|mf| mf.get_metric()[0].get_gauge().get_value())
            .unwrap()
    };
    let counts = pool.counts();
    assert_eq!(counts.idle, 1);
    assert_eq!(gauge("objectpool_resources_idle"), counts.idle as f64);
    assert_eq!(gauge("objectpool_resources_active"), counts.active as f64);
    assert_eq!(gauge("objectpool_resources_total"), counts.total as f64);

    let held = pool.get_object().unwrap();
    assert_eq!(gauge("objectpool_resources_idle"), 0.0);
    assert_eq!(gauge("objectpool_resources_active"), 1.0);
    drop(held);
}
