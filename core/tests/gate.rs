use parking_lot::Mutex;
use resilience_machines::{
    CallContext, CallGate, CircuitState, FallbackContext, GateError, Jitter, PredicateClassifier,
    Registry, RejectionKind, RetryConfig, RetryEvent,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
enum ApiError {
    Unavailable,
    BadRequest,
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test(start_paused = true)]
async fn recovers_after_four_transient_failures() {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&sleeps);

    let gate = CallGate::builder("inventory")
        .retry(RetryConfig {
            max_attempts: 5,
            base_delay: ms(100),
            multiplier: 2.0,
            max_delay: ms(2000),
            jitter: Jitter::None,
            ..Default::default()
        })
        .on_retry(move |event: &RetryEvent| recorded.lock().push(event.delay))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
    let start = Instant::now();

    let result: Result<u32, GateError<ApiError>> = gate
        .execute(&ctx, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= 4 {
                    Err(ApiError::Unavailable)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 5);
    assert_eq!(*sleeps.lock(), vec![ms(100), ms(200), ms(400), ms(800)]);

    let elapsed = start.elapsed();
    assert!(elapsed >= ms(1500), "slept {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5));

    let snapshot = gate.breaker().window_snapshot();
    assert_eq!(snapshot.total_calls, 5);
    assert_eq!(snapshot.failed_calls, 4);
    assert_eq!(gate.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn full_jitter_sleeps_stay_under_the_backoff() {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&sleeps);

    let gate = CallGate::builder("pricing")
        .retry(RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_micros(400),
            multiplier: 2.0,
            max_delay: ms(1),
            jitter: Jitter::Full,
            ..Default::default()
        })
        .on_retry(move |event: &RetryEvent| recorded.lock().push(event.delay))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result: Result<u32, GateError<ApiError>> = gate
        .execute(&CallContext::new(), move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= 3 {
                    Err(ApiError::Unavailable)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 4);

    let sleeps = sleeps.lock().clone();
    let caps = [Duration::from_micros(400), Duration::from_micros(800), ms(1)];
    assert_eq!(sleeps.len(), 3);
    for (delay, cap) in sleeps.iter().zip(caps) {
        assert!(*delay <= cap, "slept {:?}, backoff was {:?}", delay, cap);
    }
}

#[tokio::test(start_paused = true)]
async fn successful_call_counts_once_and_skips_fallback() {
    let gate = CallGate::builder("profile").build().unwrap();
    let fallback_used = Arc::new(AtomicU32::new(0));
    let used = Arc::clone(&fallback_used);
    gate.set_fallback(move |_: &FallbackContext, err: GateError<ApiError>| {
        used.fetch_add(1, Ordering::SeqCst);
        Err::<&str, _>(err)
    });

    let result = gate
        .execute(&CallContext::new(), || async { Ok::<_, ApiError>("alice") })
        .await;

    assert_eq!(result.unwrap(), "alice");
    assert_eq!(gate.metrics().breaker.total_calls, 1);
    assert_eq!(fallback_used.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_is_returned_unchanged() {
    let classifier = Arc::new(PredicateClassifier::new(|ctx| {
        !matches!(ctx.error.downcast_ref::<ApiError>(), Some(ApiError::BadRequest))
    }));
    let gate = CallGate::builder("orders")
        .retry(RetryConfig {
            max_attempts: 4,
            jitter: Jitter::None,
            ..Default::default()
        })
        .retry_classifier(classifier)
        .build()
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result: Result<(), GateError<ApiError>> = gate
        .execute(&CallContext::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::BadRequest) }
        })
        .await;

    assert!(matches!(result, Err(GateError::Inner(ApiError::BadRequest))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_reach_the_fallback() {
    let gate = CallGate::builder("quotes")
        .retry(RetryConfig {
            max_attempts: 3,
            jitter: Jitter::None,
            ..Default::default()
        })
        .build()
        .unwrap();
    gate.set_fallback(|ctx: &FallbackContext, err: GateError<ApiError>| {
        assert_eq!(ctx.kind, RejectionKind::RetriesExhausted);
        match err {
            GateError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.inner(), Some(&ApiError::Unavailable));
                Ok(0.0)
            }
            other => Err(other),
        }
    });

    let result: Result<f64, GateError<ApiError>> = gate
        .execute(&CallContext::new(), || async { Err(ApiError::Unavailable) })
        .await;

    assert_eq!(result.unwrap(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_short_circuits_to_fallback() {
    let gate = CallGate::builder("billing")
        .breaker(|b| {
            b.count_window(4)
                .wait_duration(Duration::from_secs(30))
                .permitted_calls_in_half_open(1)
        })
        .retry(RetryConfig::disabled())
        .build()
        .unwrap();
    gate.set_fallback(|ctx: &FallbackContext, _err: GateError<ApiError>| {
        assert_eq!(ctx.kind, RejectionKind::CircuitOpen);
        assert_eq!(ctx.state, CircuitState::Open);
        Ok("queued for later")
    });

    for _ in 0..4 {
        let _ = gate
            .execute(&CallContext::new(), || async { Err::<&str, _>(ApiError::Unavailable) })
            .await;
    }
    assert_eq!(gate.breaker().state(), CircuitState::Open);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result = gate
        .execute(&CallContext::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApiError>("live") }
        })
        .await;

    assert_eq!(result.unwrap(), "queued for later");
    assert_eq!(calls.load(Ordering::SeqCst), 0, "body must not run while open");
    assert_eq!(gate.metrics().breaker.rejected_calls, 1);

    // After the wait a probe goes through and closes the circuit
    tokio::time::sleep(Duration::from_secs(30)).await;
    let result = gate
        .execute(&CallContext::new(), || async { Ok::<_, ApiError>("live") })
        .await;
    assert_eq!(result.unwrap(), "live");
    assert_eq!(gate.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn full_semaphore_bulkhead_rejects_to_fallback() {
    let gate = CallGate::builder("reports")
        .semaphore_bulkhead(1, Duration::ZERO)
        .retry(RetryConfig::disabled())
        .build()
        .unwrap();
    gate.set_fallback(|ctx: &FallbackContext, err: GateError<ApiError>| {
        assert_eq!(ctx.kind, RejectionKind::BulkheadFull);
        assert!(matches!(err, GateError::BulkheadFull { limit: 1, .. }));
        Ok("busy")
    });

    let release = Arc::new(Notify::new());
    let held = {
        let gate = Arc::clone(&gate);
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            gate.execute(&CallContext::new(), move || {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok::<_, ApiError>("slow report")
                }
            })
            .await
        })
    };
    while gate.metrics().bulkhead.map_or(0, |b| b.in_flight) == 0 {
        tokio::task::yield_now().await;
    }

    let rejected = gate
        .execute(&CallContext::new(), || async { Ok::<_, ApiError>("fast report") })
        .await;
    assert_eq!(rejected.unwrap(), "busy");

    release.notify_one();
    assert_eq!(held.await.unwrap().unwrap(), "slow report");

    let bulkhead = gate.metrics().bulkhead.unwrap();
    assert_eq!(bulkhead.in_flight, 0);
    assert_eq!(bulkhead.rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn semaphore_bulkhead_waits_for_a_slot() {
    let gate = CallGate::builder("exports")
        .semaphore_bulkhead(1, Duration::from_secs(1))
        .build()
        .unwrap();

    let first = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            gate.execute(&CallContext::new(), || async {
                tokio::time::sleep(ms(200)).await;
                Ok::<_, ApiError>(1)
            })
            .await
        })
    };
    while gate.metrics().bulkhead.map_or(0, |b| b.in_flight) == 0 {
        tokio::task::yield_now().await;
    }

    let second = gate
        .execute(&CallContext::new(), || async { Ok::<_, ApiError>(2) })
        .await;

    assert_eq!(second.unwrap(), 2);
    assert_eq!(first.await.unwrap().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_bulkhead_bounds_concurrency() {
    let gate = CallGate::builder("thumbnails")
        .queue_bulkhead(2, 16)
        .retry(RetryConfig::disabled())
        .build()
        .unwrap();

    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let mut calls = Vec::new();

    for i in 0..8u32 {
        let gate = Arc::clone(&gate);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        calls.push(tokio::spawn(async move {
            gate.execute(&CallContext::new(), move || {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(ms(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ApiError>(i)
                }
            })
            .await
        }));
    }

    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap().unwrap());
    }
    results.sort_unstable();

    assert_eq!(results, (0..8).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(gate.metrics().bulkhead.unwrap().rejected, 0);
}

#[tokio::test(start_paused = true)]
async fn registry_dispatches_to_gates() {
    let mut registry = Registry::new();
    registry
        .register(CallGate::builder("users").build().unwrap())
        .unwrap();

    let ok: Result<&str, GateError<ApiError>> = registry
        .execute(&CallContext::new(), "users", || async { Ok("bob") })
        .await;
    assert_eq!(ok.unwrap(), "bob");

    let missing: Result<&str, GateError<ApiError>> = registry
        .execute(&CallContext::new(), "groups", || async { Ok("admins") })
        .await;
    assert!(matches!(missing, Err(GateError::UnknownGate(_))));
}
