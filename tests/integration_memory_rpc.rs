//! RPC semantics over the in-memory transport.

use std::time::{Duration, Instant};

use anyhow::Result;
use wirebus::{Bus, BusConfig, BusError, Provider, TransportFactory};

async fn memory_bus() -> Result<Bus> {
    let transport = TransportFactory::create(Provider::InMemory, &BusConfig::default()).await?;
    Ok(Bus::start(transport).await?)
}

fn product(a: i64, b: i64) -> Result<i64, String> {
    Ok(a * b)
}

fn divide(a: i64, b: i64) -> Result<i64, String> {
    if b == 0 {
        return Err("division by zero".to_string());
    }
    Ok(a / b)
}

#[tokio::test]
async fn single_responder_returns_the_result() -> Result<()> {
    let bus = memory_bus().await?;
    bus.expose("product_remote", product).await?;

    let result: i64 = bus
        .rpc_timeout("product_remote", (2i64, 4i64), Duration::from_secs(2))
        .await?;
    assert_eq!(result, 8);

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn remote_failure_carries_the_error_text() -> Result<()> {
    let bus = memory_bus().await?;
    bus.expose("divide", divide).await?;

    let err = bus
        .rpc_timeout::<_, i64>("divide", (1i64, 0i64), Duration::from_secs(2))
        .await
        .unwrap_err();
    match err {
        BusError::Rpc { addr, detail } => {
            assert_eq!(addr, "divide");
            assert_eq!(detail, "division by zero");
        }
        other => panic!("expected Rpc error, got {other:?}"),
    }

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn zero_timeout_without_responder_fails_promptly() -> Result<()> {
    let bus = memory_bus().await?;
    let started = Instant::now();
    let err = bus
        .rpc_timeout::<_, i64>("nobody", (1i64,), Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RpcTimeout { .. }));
    assert!(started.elapsed() < Duration::from_millis(500));
    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn multi_mode_without_responder_returns_empty() -> Result<()> {
    let bus = memory_bus().await?;
    let responses = bus
        .rpc_multi("nobody", (1i64,), Duration::ZERO)
        .await?;
    assert!(responses.is_empty());
    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn multi_mode_collects_responder_identities() -> Result<()> {
    let bus = memory_bus().await?;
    bus.expose("echo", |s: String| Ok::<_, String>(format!(">{s}")))
        .await?;

    let responses = bus
        .rpc_multi("echo", ("x".to_string(),), Duration::from_millis(300))
        .await?;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].responder, bus.responder_id());
    assert!(responses[0].error.is_none());
    let value: String = responses[0].clone().into_result("echo")?;
    assert!(value.ends_with('x'));

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn re_expose_replaces_the_callable() -> Result<()> {
    let bus = memory_bus().await?;
    bus.expose("answer", || Ok::<_, String>(1i64)).await?;
    bus.expose("answer", || Ok::<_, String>(2i64)).await?;

    // Exactly one responder answers, with the replacement in effect
    let responses = bus
        .rpc_multi("answer", (), Duration::from_millis(300))
        .await?;
    assert_eq!(responses.len(), 1);
    let value: i64 = responses[0].clone().into_result("answer")?;
    assert_eq!(value, 2);

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn unexpose_removes_the_responder() -> Result<()> {
    let bus = memory_bus().await?;
    bus.expose("gone", || Ok::<_, String>(0i64)).await?;
    bus.unexpose("gone").await?;

    let err = bus.unexpose("gone").await.unwrap_err();
    assert!(matches!(err, BusError::NoSuchRemote(_)));

    let responses = bus.rpc_multi("gone", (), Duration::from_millis(100)).await?;
    assert!(responses.is_empty());

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stub_behaves_like_a_direct_call() -> Result<()> {
    let bus = memory_bus().await?;
    bus.expose("product_remote", product).await?;

    let stub = bus.stub("product_remote").timeout(Duration::from_secs(2));
    let result: i64 = stub.call((6i64, 7i64)).await?;
    assert_eq!(result, 42);

    let responses = stub.call_multi((1i64, 1i64)).await?;
    assert_eq!(responses.len(), 1);

    bus.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn derived_addresses_resolve_like_explicit_ones() -> Result<()> {
    let bus = memory_bus().await?;
    let addr = wirebus::rpc_address(&product);
    bus.expose(&addr, product).await?;

    let result: i64 = bus
        .rpc_timeout(&addr, (3i64, 5i64), Duration::from_secs(2))
        .await?;
    assert_eq!(result, 15);

    bus.shutdown().await?;
    Ok(())
}
