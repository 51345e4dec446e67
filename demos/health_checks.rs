//! Metrics and health checks for a connection pool

use esox_poolmetrics::{
    ConfigurationError, HealthCheckRegistry, MetricRegistry, MetricsBinding, ObjectPool, PoolConfiguration,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct Connection {
    id: usize,
}

fn main() {
    println!("=== EsoxSolutions.PoolMetrics - Health Checks ===\n");

    let metrics = Arc::new(MetricRegistry::new().with_minimum_samples(5));
    let health = Arc::new(HealthCheckRegistry::new());

    let config = PoolConfiguration::new()
        .with_pool_name("db")
        .with_max_pool_size(2)
        .with_timeout(Duration::from_secs(2))
        .with_health_check_property("connectivityCheckTimeoutMs", "500")
        .and_then(|c| c.with_health_check_property("expected99thPercentileMs", "100"))
        .expect("valid health check properties");

    let next_id = std::sync::atomic::AtomicUsize::new(0);
    let pool = ObjectPool::with_factory(
        move || Connection {
            id: next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        },
        config,
    );

    // Registries may be rebound freely until the first acquisition
    pool.set_metrics(MetricsBinding::registry(Arc::clone(&metrics)))
        .expect("pool not started yet");
    pool.set_health_check_registry(Arc::clone(&health))
        .expect("pool not started yet");

    println!("1. Traffic:");
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    if let Ok(conn) = pool.get_object() {
                        thread::sleep(Duration::from_millis(20 + worker as u64 * 10));
                        let _ = conn.id;
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        let _ = worker.join();
    }

    if let Some(wait) = metrics.get_timer("db.pool.Wait") {
        let snapshot = wait.snapshot();
        println!("   Wait: count={} p99={:.1}ms", wait.count(), snapshot.percentile_99() / 1_000_000.0);
    }
    if let Some(usage) = metrics.get_histogram("db.pool.Usage") {
        println!("   Usage: count={} p75={}ms", usage.count(), usage.snapshot().percentile_75());
    }
    println!("   Counts: {:?}", pool.counts());

    println!("\n2. Health checks:");
    for (name, result) in health.run_health_checks() {
        println!(
            "   {} -> healthy={} {}",
            name,
            result.is_healthy(),
            result.message().unwrap_or("")
        );
    }

    println!("\n3. Registry lock:");
    match pool.set_metrics(MetricsBinding::registry(Arc::new(MetricRegistry::new()))) {
        Err(ConfigurationError::RegistryLocked) => println!("   rebinding after start rejected"),
        other => println!("   unexpected: {:?}", other),
    }

    pool.close();
    println!("\n   Metrics left after close: {}", metrics.len());
}
