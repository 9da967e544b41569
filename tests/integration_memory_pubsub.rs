//! Pub/sub semantics over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use wirebus::{event, Bus, BusConfig, BusError, Provider, TransportFactory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}
event!(Ping);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong {
    seq: u64,
}
event!(Pong);

async fn memory_bus() -> Result<Bus> {
    let transport = TransportFactory::create(Provider::InMemory, &BusConfig::default()).await?;
    Ok(Bus::start(transport).await?)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn round_trip_preserves_the_event() -> Result<()> {
    let bus = memory_bus().await?;
    let seen: Arc<Mutex<Vec<Ping>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    bus.subscribe::<Ping, _>(move |ping| sink.lock().unwrap().push(ping))
        .await?;
    bus.publish(&Ping { seq: 7 }).await?;

    eventually(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![Ping { seq: 7 }]);

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn events_stay_on_their_own_channel() -> Result<()> {
    let bus = memory_bus().await?;
    let pings = Arc::new(AtomicUsize::new(0));
    let pongs = Arc::new(AtomicUsize::new(0));

    let p = pings.clone();
    bus.subscribe::<Ping, _>(move |_| {
        p.fetch_add(1, Ordering::SeqCst);
    })
    .await?;
    let p = pongs.clone();
    bus.subscribe::<Pong, _>(move |_| {
        p.fetch_add(1, Ordering::SeqCst);
    })
    .await?;

    bus.publish(&Ping { seq: 1 }).await?;
    eventually(|| pings.load(Ordering::SeqCst) == 1).await;
    assert_eq!(pongs.load(Ordering::SeqCst), 0);

    bus.shutdown().await?;
    Ok(())
}

static FN_HANDLER_CALLS: AtomicUsize = AtomicUsize::new(0);

fn count_ping(_ping: Ping) {
    FN_HANDLER_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[tokio::test]
async fn repeated_subscribe_delivers_once() -> Result<()> {
    let bus = memory_bus().await?;

    let first = bus.subscribe::<Ping, _>(count_ping).await?;
    let second = bus.subscribe::<Ping, _>(count_ping).await?;
    assert_eq!(first, second);

    bus.publish(&Ping { seq: 1 }).await?;
    eventually(|| FN_HANDLER_CALLS.load(Ordering::SeqCst) >= 1).await;
    // Give a hypothetical duplicate delivery time to show up
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(FN_HANDLER_CALLS.load(Ordering::SeqCst), 1);

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_future_deliveries() -> Result<()> {
    let bus = memory_bus().await?;
    let seen = Arc::new(AtomicUsize::new(0));

    let sink = seen.clone();
    let id = bus
        .subscribe::<Ping, _>(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .await?;

    bus.publish(&Ping { seq: 1 }).await?;
    eventually(|| seen.load(Ordering::SeqCst) == 1).await;

    bus.unsubscribe(id).await?;
    bus.publish(&Ping { seq: 2 }).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn panicking_handler_does_not_block_siblings() -> Result<()> {
    let bus = memory_bus().await?;
    let seen = Arc::new(AtomicUsize::new(0));

    bus.subscribe::<Ping, _>(|_| panic!("handler failure")).await?;
    let sink = seen.clone();
    bus.subscribe::<Ping, _>(move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .await?;

    bus.publish(&Ping { seq: 1 }).await?;
    eventually(|| seen.load(Ordering::SeqCst) == 1).await;

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pattern_subscription_fails_at_subscribe_time() -> Result<()> {
    let bus = memory_bus().await?;
    let err = bus
        .subscribe_pattern::<Ping, _>("anything.*", |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Unsupported { .. }));
    bus.shutdown().await?;
    Ok(())
}
