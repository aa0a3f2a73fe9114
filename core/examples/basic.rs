//! Basic call gate usage example
//!
//! Run with `RUST_LOG=debug` to see retries and state changes.

use resilience_machines::{
    CallContext, CallGate, FallbackContext, GateError, Jitter, Registry, RetryConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct PaymentError(&'static str);

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Call Gate Basic Example ===\n");

    let gate = CallGate::builder("payment_api")
        .breaker(|b| {
            b.count_window(4)
                .wait_duration(Duration::from_secs(2))
                .permitted_calls_in_half_open(1)
                .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
                .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
                .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        })
        .semaphore_bulkhead(4, Duration::from_millis(50))
        .retry(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            jitter: Jitter::Full,
            ..Default::default()
        })
        .attempt_timeout(Duration::from_millis(200))
        .on_retry(|event| {
            println!(
                "   ↻ attempt {} failed, retrying in {:?}",
                event.attempt, event.delay
            )
        })
        .build()?;

    let mut registry = Registry::new();
    registry.register(gate)?;
    registry.register_fallback(
        "payment_api",
        |ctx: &FallbackContext, err: GateError<PaymentError>| {
            println!("   ⤷ fallback ({:?}): {}", ctx.kind, err);
            Ok(String::from("Payment queued for later"))
        },
    )?;

    // Flaky dependency: fails twice, then recovers
    println!("--- Flaky call recovered by retries ---");
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result = registry
        .execute(&CallContext::new(), "payment_api", move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(PaymentError("gateway reset"))
                } else {
                    Ok(format!("Payment accepted on attempt {}", attempt))
                }
            }
        })
        .await;
    report(result);

    // Hard outage: retries run out and the breaker opens
    println!("\n--- Outage ---");
    for _ in 0..2 {
        let result = registry
            .execute(&CallContext::new(), "payment_api", || async {
                Err::<String, _>(PaymentError("gateway down"))
            })
            .await;
        report(result);
    }

    println!("\n--- Call while open ---");
    let result = registry
        .execute(&CallContext::new(), "payment_api", || async {
            Ok::<_, PaymentError>(String::from("should not run"))
        })
        .await;
    report(result);

    println!("\n--- After the open wait ---");
    tokio::time::sleep(Duration::from_secs(2)).await;
    let result = registry
        .execute(&CallContext::new(), "payment_api", || async {
            Ok::<_, PaymentError>(String::from("Payment accepted"))
        })
        .await;
    report(result);

    for metrics in registry.metrics() {
        println!(
            "\n{}: state={} failure_rate={:.0}% total={} rejected={}",
            metrics.name,
            metrics.breaker.state,
            metrics.breaker.failure_rate,
            metrics.breaker.total_calls,
            metrics.breaker.rejected_calls,
        );
    }

    Ok(())
}

fn report(result: Result<String, GateError<PaymentError>>) {
    match result {
        Ok(message) => println!("✓ {}", message),
        Err(e) => println!("✗ {}", e),
    }
}
