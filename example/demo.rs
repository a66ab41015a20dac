use stampede::{BoxError, Cache};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const FRESH_FOR_MS: u64 = 200;
const TTL_MS: u64 = 1000;
const LOAD_DELAY_MS: u64 = 100;

async fn load(calls: Arc<AtomicUsize>, key: String) -> Result<String, BoxError> {
    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(Duration::from_millis(LOAD_DELAY_MS)).await;
    Ok(format!("Value for {} (fetch #{})", key, call))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stampede=debug".into()),
        )
        .init();

    let cache = Cache::new(
        Duration::from_millis(FRESH_FOR_MS),
        Duration::from_millis(TTL_MS),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    println!("Ten concurrent requests for a missing key...");
    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get("user:1", move || load(calls, "user:1".to_string()))
                .await
        }));
    }
    for handle in handles {
        handle.await??;
    }
    println!("Fetches so far: {}", calls.load(Ordering::SeqCst));

    println!("Reading again while fresh...");
    let value = cache.get("user:1", || load(calls.clone(), "user:1".to_string())).await?;
    println!("Got: {}", value);

    tokio::time::sleep(Duration::from_millis(FRESH_FOR_MS)).await;
    println!("Reading while stale (served at once, refreshed in the background)...");
    let value = cache.get("user:1", || load(calls.clone(), "user:1".to_string())).await?;
    println!("Got: {}", value);

    tokio::time::sleep(Duration::from_millis(LOAD_DELAY_MS * 2)).await;
    let value = cache.get("user:1", || load(calls.clone(), "user:1".to_string())).await?;
    println!("After refresh: {}", value);

    tokio::time::sleep(Duration::from_millis(TTL_MS)).await;
    println!("Reading after expiry (waits for a new fetch)...");
    let value = cache.get("user:1", || load(calls.clone(), "user:1".to_string())).await?;
    println!("Got: {}", value);

    println!("Total fetches: {}", calls.load(Ordering::SeqCst));
    Ok(())
}
