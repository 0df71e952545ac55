use moat_machines::{
    CircuitBreakerConfig, CircuitState, ConcurrentLimitConfig, ConfigError, ConfigMap, ErrorClass,
    Fallback, Invocation, Lifecycle, MoatError, MoatKeeper, MoatKind, MoatMetrics, Outcome,
    RateLimitConfig, RequestHandle, ResourceConfig, ResourceId, RetryConfig, ServiceError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn concurrent(threshold: usize) -> ResourceConfig {
    ResourceConfig::new().with_concurrent_limit(ConcurrentLimitConfig::new(threshold))
}

fn threshold_of(keeper: &MoatKeeper, id: &ResourceId) -> Option<usize> {
    let metrics = keeper.metrics(id)?;
    match metrics.moat(MoatKind::ConcurrentLimit) {
        Some(MoatMetrics::ConcurrentLimit { threshold, .. }) => Some(*threshold),
        _ => None,
    }
}

fn breaker(keeper: &MoatKeeper, id: &ResourceId) -> CircuitState {
    keeper
        .cluster(id)
        .and_then(|c| c.get(MoatKind::CircuitBreaker))
        .and_then(|m| m.circuit_breaker().map(|cb| cb.state()))
        .expect("breaker exists")
}

#[test]
fn test_withdrawn_config_resets_permanent_and_removes_temporary() {
    let svc = ResourceId::method("svc");
    let keeper = MoatKeeper::builder()
        .resource(svc.clone(), concurrent(2))
        .build()
        .unwrap();
    keeper.chain(&Invocation::new("svc"));

    keeper.update(ConfigMap::from([(
        svc.clone(),
        concurrent(5).with_rate_limit(RateLimitConfig::new(10, Duration::from_secs(1))),
    )]));
    let cluster = keeper.cluster(&svc).unwrap();
    assert_eq!(threshold_of(&keeper, &svc), Some(5));
    assert_eq!(
        cluster.get(MoatKind::RateLimit).unwrap().lifecycle(),
        Lifecycle::Temporary
    );

    keeper.update(ConfigMap::new());
    assert_eq!(threshold_of(&keeper, &svc), Some(2));
    assert!(cluster.get(MoatKind::RateLimit).is_none());
    assert!(keeper.cluster(&svc).is_some());
}

#[test]
fn test_cluster_with_nothing_left_is_removed() {
    let keeper = MoatKeeper::builder().build().unwrap();
    let svc = ResourceId::method("svc");
    keeper.update(ConfigMap::from([(svc.clone(), concurrent(1))]));

    keeper.execute(&Invocation::new("svc"), &(), |_| Ok(())).unwrap();
    assert_eq!(keeper.resources(), vec![svc.clone()]);

    keeper.update(ConfigMap::new());
    assert!(keeper.resources().is_empty());
}

#[test]
fn test_match_all_applies_to_every_value_without_own_entry() {
    let keeper = MoatKeeper::builder().build().unwrap();
    keeper.update(ConfigMap::from([
        (ResourceId::arg("svc", 0, "tenant", "*"), concurrent(1)),
        (ResourceId::arg("svc", 0, "tenant", "vip"), concurrent(3)),
    ]));

    for tenant in ["a", "b", "vip"] {
        keeper.chain(&Invocation::new("svc").with_arg(0, "tenant", tenant));
    }
    let id = |tenant| ResourceId::arg("svc", 0, "tenant", tenant);
    assert_eq!(threshold_of(&keeper, &id("a")), Some(1));
    assert_eq!(threshold_of(&keeper, &id("b")), Some(1));
    assert_eq!(threshold_of(&keeper, &id("vip")), Some(3));

    // changing the broadcast value reaches existing clusters
    keeper.update(ConfigMap::from([
        (ResourceId::arg("svc", 0, "tenant", "*"), concurrent(2)),
        (ResourceId::arg("svc", 0, "tenant", "vip"), concurrent(3)),
    ]));
    assert_eq!(threshold_of(&keeper, &id("a")), Some(2));
    assert_eq!(threshold_of(&keeper, &id("vip")), Some(3));
}

#[test]
fn test_creation_guard_skips_protection_past_the_cap() {
    let keeper = MoatKeeper::builder().max_values_per_arg(2).build().unwrap();
    keeper.update(ConfigMap::from([(
        ResourceId::arg("svc", 0, "tenant", "*"),
        concurrent(1),
    )]));

    for tenant in ["a", "b", "c"] {
        let inv = Invocation::new("svc").with_arg(0, "tenant", tenant);
        let result = keeper.execute(&inv, &(), |_| Ok(tenant));
        assert_eq!(result.unwrap(), tenant);
    }

    let arg = ResourceId::arg("svc", 0, "tenant", "a");
    assert_eq!(
        keeper
            .arg_statistics()
            .count(arg.as_arg().unwrap(), MoatKind::ConcurrentLimit),
        2
    );
    assert!(keeper.cluster(&ResourceId::arg("svc", 0, "tenant", "c")).is_none());
}

#[test]
fn test_concurrency_slot_held_until_handle_ends() {
    let keeper = MoatKeeper::builder()
        .resource(ResourceId::method("svc"), concurrent(1))
        .fallback(ResourceId::method("svc"), Fallback::<(), u32>::to_value(0))
        .build()
        .unwrap();
    let inv = Invocation::new("svc");

    let first: RequestHandle<u32> = keeper.try_to_execute(&inv, &());
    assert!(first.is_permitted());

    let second: RequestHandle<u32> = keeper.try_to_execute(&inv, &());
    assert!(!second.is_permitted());
    assert_eq!(second.rejection().unwrap().kind, MoatKind::ConcurrentLimit);
    assert_eq!(second.take_fallback().unwrap().unwrap(), 0);

    first.end_with_result(&7u32).unwrap();
    assert!(matches!(first.end_with_success(), Err(MoatError::AlreadyEnded)));

    let third: RequestHandle<u32> = keeper.try_to_execute(&inv, &());
    assert!(third.is_permitted());
}

#[test]
fn test_breaker_opens_then_probes_half_open() {
    let svc = ResourceId::method("svc");
    let keeper = MoatKeeper::builder()
        .resource(
            svc.clone(),
            ResourceConfig::new().with_circuit_breaker(CircuitBreakerConfig {
                failure_rate_threshold: 100.0,
                ring_buffer_size_in_closed_state: 3,
                ring_buffer_size_in_half_open_state: 1,
                wait_duration_in_open_state: Duration::from_millis(50),
                ..CircuitBreakerConfig::default()
            }),
        )
        .build()
        .unwrap();
    let inv = Invocation::new("svc");

    for _ in 0..3 {
        let result = keeper.execute(&inv, &(), |_| Err::<(), _>("down".into()));
        assert!(result.unwrap_err().is_business());
    }
    assert_eq!(breaker(&keeper, &svc), CircuitState::Open);

    let rejected = keeper.execute(&inv, &(), |_| Ok(()));
    assert_eq!(rejected.unwrap_err().class(), ErrorClass::CIRCUIT_BREAKER);

    thread::sleep(Duration::from_millis(80));
    let probe: RequestHandle = keeper.try_to_execute(&inv, &());
    assert!(probe.is_permitted());
    assert_eq!(breaker(&keeper, &svc), CircuitState::HalfOpen);

    probe.end_with_success().unwrap();
    assert_eq!(breaker(&keeper, &svc), CircuitState::Closed);
}

#[test]
fn test_breaker_rejection_dispatches_to_specific_handler() {
    let svc = ResourceId::method("svc");
    let keeper = MoatKeeper::builder()
        .resource(
            svc.clone(),
            ResourceConfig::new().with_circuit_breaker(CircuitBreakerConfig {
                forced_state: Some(moat_machines::ForcedState::Open),
                ..CircuitBreakerConfig::default()
            }),
        )
        .fallback(
            svc.clone(),
            Fallback::<String, String>::to_function()
                .otherwise(|| Ok("catch-all".to_string()))
                .on_cause(ErrorClass::RATE_LIMIT, |_| Ok("rate limited".to_string()))
                .on_cause_with_args(ErrorClass::CIRCUIT_BREAKER, |_, order: &String| {
                    Ok(format!("breaker open for {order}"))
                })
                .build(),
        )
        .build()
        .unwrap();

    let result = keeper.execute(&Invocation::new("svc"), &"order-1".to_string(), |o| Ok(o.clone()));
    assert_eq!(result.unwrap(), "breaker open for order-1");
}

#[test]
fn test_retry_then_fallback_with_arguments() {
    let svc = ResourceId::method("svc");
    let keeper = MoatKeeper::builder()
        .resource(
            svc.clone(),
            ResourceConfig::new()
                .with_concurrent_limit(ConcurrentLimitConfig::new(4))
                .with_retry(RetryConfig {
                    max_attempts: 3,
                    include: vec![ErrorClass::new("biz.transient")],
                    retry_unknown: false,
                    ..RetryConfig::default()
                }),
        )
        .fallback(
            svc.clone(),
            Fallback::<u32, String>::to_function()
                .on_cause_with_args(ErrorClass::RETRY_EXHAUSTED, |cause, id| match cause {
                    MoatError::RetryExhausted { attempts, .. } => {
                        Ok(format!("gave up on {id} after {attempts}"))
                    }
                    other => Err(other.to_string().into()),
                })
                .build()
                .apply_to_business(true),
        )
        .build()
        .unwrap();
    let inv = Invocation::new("svc");

    let calls = AtomicUsize::new(0);
    let result = keeper.execute(&inv, &42u32, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<String, _>(ServiceError::new("biz.transient.io", "flaky").into())
    });
    assert_eq!(result.unwrap(), "gave up on 42 after 3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // not retryable: a single attempt, and no handler matches the business class
    calls.store(0, Ordering::SeqCst);
    let result = keeper.execute(&inv, &42u32, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<String, _>(ServiceError::new("biz.invalid", "bad input").into())
    });
    assert!(result.unwrap_err().is_business());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let retry = keeper.metrics(&svc).unwrap().retry.unwrap();
    assert_eq!(retry.total_calls, 2);
    assert_eq!(retry.total_retries, 2);
    assert_eq!(retry.exhausted, 1);
}

#[test]
fn test_dynamic_config_from_json() {
    let json = r#"{
        "svc": { "concurrent_limit": { "threshold": 1 } },
        "svc(0:tenant=*)": {
            "rate_limit": {
                "limit_for_period": 2,
                "limit_refresh_period": { "secs": 3600, "nanos": 0 }
            }
        }
    }"#;
    let snapshot: ConfigMap = serde_json::from_str(json).unwrap();
    let source = move || -> Result<ConfigMap, ConfigError> { Ok(snapshot.clone()) };

    let keeper = MoatKeeper::builder().build().unwrap();
    assert_eq!(keeper.refresh(&source).unwrap(), 2);
    assert_eq!(keeper.refresh(&source).unwrap(), 0);

    let inv = Invocation::new("svc").with_arg(0, "tenant", "acme");
    for _ in 0..2 {
        keeper.execute(&inv, &(), |_| Ok(())).unwrap();
    }
    let err = keeper.execute(&inv, &(), |_| Ok(())).unwrap_err();
    let rejection = err.not_permitted().unwrap();
    assert_eq!(rejection.kind, MoatKind::RateLimit);
    assert_eq!(rejection.resource, ResourceId::arg("svc", 0, "tenant", "acme"));
}

#[test]
fn test_malformed_update_keeps_previous_value() {
    let keeper = MoatKeeper::builder().build().unwrap();
    let svc = ResourceId::method("svc");
    keeper.update(ConfigMap::from([(svc.clone(), concurrent(3))]));
    keeper.chain(&Invocation::new("svc"));

    let changed = keeper.update(ConfigMap::from([(svc.clone(), concurrent(0))]));
    assert_eq!(changed, 0);
    assert_eq!(threshold_of(&keeper, &svc), Some(3));
}

#[test]
fn test_invocation_listener_sees_each_completion_once() {
    let ends = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (e, f) = (Arc::clone(&ends), Arc::clone(&errors));
    let keeper = MoatKeeper::builder()
        .resource(ResourceId::method("svc"), concurrent(8))
        .invocation_listener(move |_: &ResourceId, outcome: &Outcome<'_>, _: Duration| {
            e.fetch_add(1, Ordering::SeqCst);
            if outcome.is_error() {
                f.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();
    let keeper = Arc::new(keeper);

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let keeper = Arc::clone(&keeper);
            thread::spawn(move || {
                let _ = keeper.execute(&Invocation::new("svc"), &i, |n| {
                    if n % 2 == 0 { Ok(*n) } else { Err("odd".into()) }
                });
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(ends.load(Ordering::SeqCst), 8);
    assert_eq!(errors.load(Ordering::SeqCst), 4);
}
