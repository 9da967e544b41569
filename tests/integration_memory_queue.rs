//! Queue facade semantics over the in-memory transport.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use wirebus::{Bus, BusConfig, BusError, Provider, TransportFactory};

async fn memory_bus(config: BusConfig) -> Result<Bus> {
    let transport = TransportFactory::create(Provider::InMemory, &config).await?;
    Ok(Bus::start(transport).await?)
}

#[tokio::test]
async fn fifo_order_across_put_and_get() -> Result<()> {
    let bus = memory_bus(BusConfig::default()).await?;
    let queue = bus.queue("work");

    queue.put("a").await?;
    queue.put("b").await?;
    queue.put("c").await?;

    assert_eq!(queue.get().await?, "a");
    assert_eq!(queue.get().await?, "b");
    assert_eq!(queue.get().await?, "c");

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn get_nowait_on_empty_queue_fails() -> Result<()> {
    let bus = memory_bus(BusConfig::default()).await?;
    let err = bus.queue("empty").get_nowait().await.unwrap_err();
    assert!(matches!(err, BusError::QueueEmpty(name) if name == "empty"));
    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn timed_get_blocks_for_the_full_deadline() -> Result<()> {
    let bus = memory_bus(BusConfig::default()).await?;
    let started = Instant::now();
    let err = bus
        .queue("empty")
        .get_timeout(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::QueueEmpty(_)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn bounded_queue_rejects_put_nowait_when_full() -> Result<()> {
    let config = BusConfig {
        memory_queue_bound: Some(2),
        ..BusConfig::default()
    };
    let bus = memory_bus(config).await?;
    let queue = bus.queue("bounded");

    queue.put_nowait(&1u64).await?;
    queue.put_nowait(&2u64).await?;
    let err = queue.put_nowait(&3u64).await.unwrap_err();
    assert!(matches!(err, BusError::QueueFull(name) if name == "bounded"));

    // Draining frees room again
    queue.get().await?;
    queue.put_nowait(&3u64).await?;

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn blocked_put_completes_after_a_get() -> Result<()> {
    let config = BusConfig {
        memory_queue_bound: Some(1),
        ..BusConfig::default()
    };
    let bus = memory_bus(config).await?;
    let queue = bus.queue("bounded");
    queue.put(&1u64).await?;

    let blocked = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.put_timeout(&2u64, Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.get().await?, 1);

    blocked.await??;
    assert_eq!(queue.get().await?, 2);

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn size_is_best_effort_where_supported() -> Result<()> {
    let bus = memory_bus(BusConfig::default()).await?;
    let queue = bus.queue("sized");
    assert_eq!(queue.len().await?, 0);
    queue.put("x").await?;
    queue.put("y").await?;
    assert_eq!(queue.len().await?, 2);
    bus.shutdown().await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    kind: String,
    attempts: u32,
}

#[tokio::test]
async fn structured_payloads_decode_explicitly() -> Result<()> {
    let bus = memory_bus(BusConfig::default()).await?;
    let queue = bus.queue("jobs");
    let job = Job {
        kind: "rebuild".into(),
        attempts: 3,
    };
    queue.put(&job).await?;
    let back: Job = queue.get_as().await?;
    assert_eq!(back, job);
    bus.shutdown().await?;
    Ok(())
}
