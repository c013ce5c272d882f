//! Basic breaker usage example

use fusebox::Breaker;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Breaker Basic Example ===\n");

    let breaker = Breaker::builder()
        .name("payment_api")
        .wait_threshold(2)
        .threshold(0.5)
        .circuit_duration(Duration::from_millis(500))
        .timeout(Duration::from_millis(200))
        .on_open(|name| println!(">> breaker '{}' opened", name))
        .on_close(|name| println!(">> breaker '{}' closed", name))
        .build();

    // A flaky payment backend: healthy for two calls, then declines
    let calls = Arc::new(AtomicU32::new(0));
    let backend_calls = calls.clone();
    let circuit = breaker.circuit(move |amount: u32| {
        let calls = backend_calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Ok(format!("charged {amount}"))
            } else {
                Err(format!("charge {amount} declined"))
            }
        }
    });

    println!("--- successful calls ---");
    for amount in [10, 20] {
        match circuit.exec(amount).await {
            Ok(receipt) => println!("ok: {receipt}"),
            Err(err) => println!("error: {err}"),
        }
    }
    println!("state: {}\n", breaker.state_name());

    println!("--- triggering failures ---");
    for amount in [30, 40, 50] {
        match circuit.exec(amount).await {
            Ok(receipt) => println!("ok: {receipt}"),
            Err(err) => println!("error: {err}"),
        }
    }
    println!("state: {}\n", breaker.state_name());

    println!("--- call while open is short-circuited ---");
    match circuit.exec(60).await {
        Ok(receipt) => println!("ok: {receipt}"),
        Err(err) => println!("error: {err}"),
    }
    println!();

    println!("--- a fallback absorbs the rejection ---");
    let with_fallback = circuit
        .clone()
        .with_fallback(|amount: u32| async move { Ok(format!("queued {amount} for retry")) });
    match with_fallback.exec(70).await {
        Ok(receipt) => println!("ok: {receipt}"),
        Err(err) => println!("error: {err}"),
    }
    println!();

    println!("--- waiting for the cooldown to heal ---");
    tokio::time::sleep(Duration::from_millis(700)).await;
    println!("state: {}\n", breaker.state_name());

    let snapshot = breaker.snapshot_now();
    println!(
        "lifetime totals: {} calls, {} short-circuited",
        snapshot.stats.lifetime.count_total, snapshot.stats.lifetime.count_short_circuited
    );
}
