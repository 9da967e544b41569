//! End-to-end semantics over a live Redis-protocol broker.
//!
//! These tests need a reachable broker and are opt-in: set
//! `WIREBUS_TEST_REDIS=1` (and optionally `WIREBUS_REDIS_URL`) to enable
//! them. Each run uses a unique channel prefix so concurrent runs cannot
//! observe each other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use wirebus::{event, Bus, BusConfig, Provider, TransportFactory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}
event!(Ping);

fn enabled() -> bool {
    if std::env::var("WIREBUS_TEST_REDIS").unwrap_or_default() == "1" {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        return true;
    }
    eprintln!("Skipping broker test: set WIREBUS_TEST_REDIS=1 to enable");
    false
}

fn config() -> BusConfig {
    BusConfig {
        broker_url: std::env::var("WIREBUS_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        channel_prefix: format!("wirebus-test-{}", uuid::Uuid::new_v4().simple()),
        ..BusConfig::default()
    }
}

async fn broker_bus(config: &BusConfig) -> Result<Bus> {
    let transport = TransportFactory::create(Provider::Broker, config).await?;
    Ok(Bus::start(transport).await?)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn cross_bus_pubsub_round_trip() -> Result<()> {
    if !enabled() {
        return Ok(());
    }
    let config = config();
    let publisher = broker_bus(&config).await?;
    let subscriber = broker_bus(&config).await?;

    let seen: Arc<Mutex<Vec<Ping>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    subscriber
        .subscribe::<Ping, _>(move |ping| sink.lock().unwrap().push(ping))
        .await?;
    // Broker subscriptions settle asynchronously on the server side
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher.publish(&Ping { seq: 7 }).await?;
    eventually(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![Ping { seq: 7 }]);

    publisher.shutdown().await?;
    subscriber.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pattern_subscription_matches_by_glob() -> Result<()> {
    if !enabled() {
        return Ok(());
    }
    let config = config();
    let bus = broker_bus(&config).await?;

    let exact = Arc::new(AtomicUsize::new(0));
    let pattern = Arc::new(AtomicUsize::new(0));

    let sink = exact.clone();
    bus.subscribe::<Ping, _>(move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .await?;
    let sink = pattern.clone();
    bus.subscribe_pattern::<Ping, _>("*::Ping", move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    bus.publish(&Ping { seq: 1 }).await?;

    // Exact and pattern routes are independent deliveries
    eventually(|| exact.load(Ordering::SeqCst) == 1 && pattern.load(Ordering::SeqCst) == 1).await;

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn queue_fifo_is_visible_across_buses() -> Result<()> {
    if !enabled() {
        return Ok(());
    }
    let config = config();
    let producer = broker_bus(&config).await?;
    let consumer = broker_bus(&config).await?;

    let queue = producer.queue("work");
    queue.put("a").await?;
    queue.put("b").await?;
    queue.put("c").await?;

    let remote = consumer.queue("work");
    assert_eq!(remote.len().await?, 3);
    assert_eq!(remote.get().await?, "a");
    assert_eq!(remote.get().await?, "b");
    assert_eq!(remote.get().await?, "c");

    producer.shutdown().await?;
    consumer.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn multi_mode_aggregates_every_responder() -> Result<()> {
    if !enabled() {
        return Ok(());
    }
    let config = config();
    let caller = broker_bus(&config).await?;

    let mut responders = Vec::new();
    for _ in 0..3 {
        let bus = broker_bus(&config).await?;
        let tag = bus.responder_id().to_string();
        bus.expose("echo", move |s: String| Ok::<_, String>(format!("{tag}:{s}")))
            .await?;
        responders.push(bus);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let responses = caller
        .rpc_multi("echo", ("x".to_string(),), Duration::from_secs(2))
        .await?;
    assert_eq!(responses.len(), 3);

    let mut ids: Vec<&str> = responses.iter().map(|r| r.responder.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "responder identities must be distinct");
    for response in &responses {
        let value: String = response.clone().into_result("echo")?;
        assert!(value.ends_with('x'));
    }

    caller.shutdown().await?;
    for bus in responders {
        bus.shutdown().await?;
    }
    Ok(())
}

#[tokio::test]
async fn single_mode_rpc_across_processes() -> Result<()> {
    if !enabled() {
        return Ok(());
    }
    let config = config();
    let server = broker_bus(&config).await?;
    let client = broker_bus(&config).await?;

    server
        .expose("product_remote", |a: i64, b: i64| Ok::<_, String>(a * b))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result: i64 = client
        .rpc_timeout("product_remote", (2i64, 4i64), Duration::from_secs(2))
        .await?;
    assert_eq!(result, 8);

    server.shutdown().await?;
    client.shutdown().await?;
    Ok(())
}
