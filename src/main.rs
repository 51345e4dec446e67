// EsoxSolutions.PoolMetrics
// Metrics and health checks for thread-safe resource pools

// This is just a binary wrapper - the actual library is in lib.rs
// Run the demo with: cargo run --example health_checks

use esox_poolmetrics::{HealthCheckRegistry, MetricRegistry, ObjectPool, PoolConfiguration};
use std::sync::Arc;

fn main() {
    println!("=== EsoxSolutions.PoolMetrics ===");
    println!("See demos/ directory for usage examples");
    println!();

    let metrics = Arc::new(MetricRegistry::new());
    let health = Arc::new(HealthCheckRegistry::new());
    let config = PoolConfiguration::new()
        .with_pool_name("demo")
        .with_metric_registry(Arc::clone(&metrics))
        .with_health_check_registry(Arc::clone(&health));
    let pool = ObjectPool::new(vec![1, 2, 3], config);

    match pool.get_object() {
        Ok(obj) => println!("  Got object: {}", *obj),
        Err(err) => println!("  Could not get object: {}", err),
    }

    if let Some(wait) = metrics.get_timer("demo.pool.Wait") {
        println!("  Acquisitions recorded: {}", wait.count());
    }
    for (name, result) in health.run_health_checks() {
        println!("  {}: healthy={}", name, result.is_healthy());
    }
}
