//! Process-default bus.
//!
//! The explicit [`Bus`] handle is the primary API; this module adds the thin
//! process-wide wrapper for programs that want one bus and no plumbing:
//! `init` once, call the free functions anywhere, `shutdown` at exit.
//!
//! Re-initialization without a prior shutdown fails with
//! `AlreadyInitialized`; every other free function fails with
//! `NotInitialized` until `init` has run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::Bus;
use crate::dispatch::SubscriptionId;
use crate::error::{BusError, BusResult};
use crate::event::Event;
use crate::queue::Queue;
use crate::rpc::{IntoRpcCallable, RpcResponse, Stub};
use crate::transport::{BusConfig, Provider, Transport, TransportFactory};

static ACTIVE: Mutex<Option<Bus>> = Mutex::new(None);

/// Construct a transport through `factory`, start a bus over it, and install
/// it as the process-wide default.
///
/// Fails with `AlreadyInitialized` while a previous bus is still active.
pub async fn init<F, Fut>(factory: F) -> BusResult<Bus>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = BusResult<Arc<dyn Transport>>>,
{
    if ACTIVE.lock().is_some() {
        return Err(BusError::AlreadyInitialized);
    }
    let transport = factory().await?;
    let bus = Bus::start(transport).await?;
    {
        let mut active = ACTIVE.lock();
        if active.is_none() {
            *active = Some(bus.clone());
            return Ok(bus);
        }
    }
    // Lost an init race; tear the spare bus down again
    let _ = bus.shutdown().await;
    Err(BusError::AlreadyInitialized)
}

/// [`init`] with one of the built-in providers
pub async fn init_provider(provider: Provider, config: BusConfig) -> BusResult<Bus> {
    init(move || async move { TransportFactory::create(provider, &config).await }).await
}

/// The process-wide bus, if one is active
pub fn active() -> BusResult<Bus> {
    ACTIVE.lock().clone().ok_or(BusError::NotInitialized)
}

/// Shut the process-wide bus down and clear the reference; idempotent
pub async fn shutdown() -> BusResult<()> {
    let bus = ACTIVE.lock().take();
    match bus {
        Some(bus) => bus.shutdown().await,
        None => Ok(()),
    }
}

/// Publish an event on the process-wide bus
pub async fn publish<E: Event>(event: &E) -> BusResult<()> {
    active()?.publish(event).await
}

/// Subscribe a typed handler on the process-wide bus
pub async fn subscribe<E, F>(handler: F) -> BusResult<SubscriptionId>
where
    E: Event,
    F: Fn(E) + Send + Sync + 'static,
{
    active()?.subscribe::<E, F>(handler).await
}

/// Subscribe a typed handler to a glob-style pattern on the process-wide bus
pub async fn subscribe_pattern<E, F>(pattern: &str, handler: F) -> BusResult<SubscriptionId>
where
    E: Event,
    F: Fn(E) + Send + Sync + 'static,
{
    active()?.subscribe_pattern::<E, F>(pattern, handler).await
}

/// Remove a subscription from the process-wide bus
pub async fn unsubscribe(id: SubscriptionId) -> BusResult<()> {
    active()?.unsubscribe(id).await
}

/// Handle to a named queue on the process-wide bus
pub fn queue(name: &str) -> BusResult<Queue> {
    Ok(active()?.queue(name))
}

/// Expose a callable on the process-wide bus
pub async fn expose<Args, C>(addr: &str, callable: C) -> BusResult<()>
where
    C: IntoRpcCallable<Args>,
{
    active()?.expose(addr, callable).await
}

/// Remove an exposed callable from the process-wide bus
pub async fn unexpose(addr: &str) -> BusResult<()> {
    active()?.unexpose(addr).await
}

/// Single-mode RPC call through the process-wide bus
pub async fn rpc<A: Serialize, R: DeserializeOwned>(addr: &str, args: A) -> BusResult<R> {
    active()?.rpc(addr, args).await
}

/// Single-mode RPC call with a deadline through the process-wide bus
pub async fn rpc_timeout<A: Serialize, R: DeserializeOwned>(
    addr: &str,
    args: A,
    timeout: Duration,
) -> BusResult<R> {
    active()?.rpc_timeout(addr, args, timeout).await
}

/// Multi-mode RPC call through the process-wide bus
pub async fn rpc_multi<A: Serialize>(
    addr: &str,
    args: A,
    timeout: Duration,
) -> BusResult<Vec<RpcResponse>> {
    active()?.rpc_multi(addr, args, timeout).await
}

/// Call handle bound to an address on the process-wide bus
pub fn stub(addr: &str) -> BusResult<Stub> {
    Ok(active()?.stub(addr))
}
