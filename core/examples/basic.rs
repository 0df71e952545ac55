//! Basic moat keeper usage example
//!
//! Run with `RUST_LOG=moat_machines=debug` to see the library's own logs.

use moat_machines::{
    CircuitBreakerConfig, ConcurrentLimitConfig, ConfigMap, ErrorClass, Fallback, Invocation,
    MoatKeeper, RateLimitConfig, ResourceConfig, ResourceId, RetryConfig, ServiceError,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Moat Keeper Basic Example ===\n");

    let payment = ResourceId::method("payment.charge");
    let keeper = MoatKeeper::builder()
        .resource(
            payment.clone(),
            ResourceConfig::new()
                .with_rate_limit(RateLimitConfig::new(5, Duration::from_secs(1)))
                .with_circuit_breaker(CircuitBreakerConfig {
                    failure_rate_threshold: 50.0,
                    ring_buffer_size_in_closed_state: 4,
                    ring_buffer_size_in_half_open_state: 2,
                    wait_duration_in_open_state: Duration::from_millis(500),
                    ..CircuitBreakerConfig::default()
                })
                .with_retry(RetryConfig {
                    max_attempts: 2,
                    delay: Duration::from_millis(20),
                    ..RetryConfig::default()
                }),
        )
        .fallback(
            payment.clone(),
            Fallback::<u64, String>::to_function()
                .on_cause(ErrorClass::CIRCUIT_BREAKER, |_| Ok("payment queued".to_string()))
                .on_cause(ErrorClass::RATE_LIMIT, |_| Ok("slow down".to_string()))
                .on_cause_with_args(ErrorClass::RETRY_EXHAUSTED, |_, cents| {
                    Ok(format!("could not charge {cents}, will retry later"))
                })
                .build(),
        )
        .on_state_transition(|t| println!("  circuit '{}': {} -> {}", t.circuit, t.from, t.to))
        .build()
        .expect("valid configuration");

    let charge = Invocation::new("payment.charge").with_arg(0, "tenant", "acme");

    println!("--- Successful calls ---");
    for cents in [100u64, 200] {
        let result = keeper.execute(&charge, &cents, |c| Ok(format!("charged {c}")));
        println!("  {result:?}");
    }

    println!("\n--- Failing backend ---");
    for cents in [300u64, 400] {
        let result = keeper.execute(&charge, &cents, |_| {
            Err::<String, _>(ServiceError::new("biz.gateway.timeout", "gateway timed out").into())
        });
        println!("  {result:?}");
    }

    println!("\n--- Circuit open ---");
    let result = keeper.execute(&charge, &500u64, |c| Ok(format!("charged {c}")));
    println!("  {result:?}");

    if let Some(metrics) = keeper.metrics(&payment) {
        println!("\n--- Metrics ---");
        match serde_json::to_string_pretty(&metrics) {
            Ok(json) => println!("{json}"),
            Err(err) => println!("  cannot render metrics: {err}"),
        }
    }

    println!("\n--- Dynamic config: limit tenant 'acme' ---");
    let tenants = ResourceId::arg("payment.charge", 0, "tenant", "*");
    let changed = keeper.update(ConfigMap::from([(
        tenants,
        ResourceConfig::new().with_concurrent_limit(ConcurrentLimitConfig::new(1)),
    )]));
    println!("  {changed} resource(s) changed");

    std::thread::sleep(Duration::from_millis(600));
    let result = keeper.execute(&charge, &600u64, |c| Ok(format!("charged {c}")));
    println!("  {result:?}");
    println!("  live clusters: {:?}", keeper.resources());

    println!("\n--- Withdraw dynamic config ---");
    keeper.update(ConfigMap::new());
    println!("  live clusters: {:?}", keeper.resources());
}
