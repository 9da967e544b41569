//! The bus handle: facade over dispatcher, transport, and RPC state.
//!
//! A [`Bus`] is an explicit, cheaply cloneable handle. All operations take
//! the handle; the process-default singleton in [`crate::global`] is a thin
//! wrapper for ergonomics. Application code publishes typed events,
//! subscribes typed handlers, opens named queues, and exposes/invokes RPC
//! callables; the bus forwards to the dispatcher and transport underneath.
//!
//! ## Shutdown
//!
//! `shutdown` is idempotent: it flips a watch flag that releases every
//! pending RPC wait with [`BusError::Shutdown`], clears the registries,
//! unsubscribes everything, and stops the transport. Handles remain valid
//! but every subsequent operation fails with `Shutdown`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec;
use crate::dispatch::{Dispatcher, SubscriptionId};
use crate::error::{BusError, BusResult};
use crate::event::Event;
use crate::queue::Queue;
use crate::rpc::{
    ExposedEntry, IntoRpcCallable, RpcRequest, RpcResponse, RpcState, Stub, RPC_CHANNEL_PREFIX,
    RPC_REPLY_PREFIX,
};
use crate::transport::{Capabilities, Delivery, DeliveryFn, Topic, Transport};

/// Handle to a running bus
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

pub(crate) struct BusInner {
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    rpc: RpcState,
    /// Opaque identity stamped into RPC responses
    responder_id: String,
    stopping_tx: watch::Sender<bool>,
    stopping_rx: watch::Receiver<bool>,
    stopped: AtomicBool,
}

/// In-flight call bookkeeping handed between `begin_call` and `finish_call`
struct PendingCall {
    id: String,
    reply_topic: Topic,
    subscription: SubscriptionId,
    rx: mpsc::UnboundedReceiver<RpcResponse>,
}

impl Bus {
    /// Start a bus over the given transport: wire the delivery callback into
    /// the dispatcher and begin the transport's delivery loop.
    pub async fn start(transport: Arc<dyn Transport>) -> BusResult<Bus> {
        let (stopping_tx, stopping_rx) = watch::channel(false);
        let node = uuid::Uuid::new_v4().simple().to_string();
        let inner = Arc::new(BusInner {
            transport,
            dispatcher: Dispatcher::new(),
            rpc: RpcState::new(),
            responder_id: format!("{}-{}", std::process::id(), &node[..8]),
            stopping_tx,
            stopping_rx,
            stopped: AtomicBool::new(false),
        });

        // The callback holds a weak reference: the transport must not keep
        // the bus alive once every handle is gone
        let weak: Weak<BusInner> = Arc::downgrade(&inner);
        let on_delivery: DeliveryFn = Arc::new(move |delivery: Delivery| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatcher.dispatch(&delivery);
            }
        });
        inner.transport.start(on_delivery).await?;
        info!(transport = inner.transport.name(), responder = %inner.responder_id, "bus started");
        Ok(Bus { inner })
    }

    /// Name of the active transport
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Capability set of the active transport
    pub fn capabilities(&self) -> Capabilities {
        self.inner.transport.capabilities()
    }

    /// Opaque identity this bus stamps into RPC responses
    pub fn responder_id(&self) -> &str {
        &self.inner.responder_id
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn ensure_running(&self) -> BusResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) || *self.inner.stopping_rx.borrow() {
            return Err(BusError::Shutdown);
        }
        Ok(())
    }

    // ---- pub/sub -----------------------------------------------------------

    /// Publish an event on the channel derived from its type
    pub async fn publish<E: Event>(&self, event: &E) -> BusResult<()> {
        self.ensure_running()?;
        let payload = codec::encode(event)?;
        debug!(channel = E::CHANNEL, bytes = payload.len(), "publishing event");
        self.inner.transport.publish(E::CHANNEL, &payload).await
    }

    /// Subscribe a handler to the channel derived from its declared event
    /// type.
    ///
    /// Registration is idempotent for zero-sized handlers (plain functions):
    /// re-subscribing returns the original token and produces exactly one
    /// delivery per publish.
    pub async fn subscribe<E, F>(&self, handler: F) -> BusResult<SubscriptionId>
    where
        E: Event,
        F: Fn(E) + Send + Sync + 'static,
    {
        self.subscribe_topic::<E, F>(Topic::Exact(E::CHANNEL.to_string()), handler)
            .await
    }

    /// Subscribe a handler to every channel matching a glob-style pattern.
    ///
    /// Fails with `Unsupported` at subscribe time on transports without
    /// pattern matching. Exact and pattern subscriptions are independent: a
    /// handler registered both ways is invoked twice per matching publish.
    pub async fn subscribe_pattern<E, F>(&self, pattern: &str, handler: F) -> BusResult<SubscriptionId>
    where
        E: Event,
        F: Fn(E) + Send + Sync + 'static,
    {
        self.subscribe_topic::<E, F>(Topic::Pattern(pattern.to_string()), handler)
            .await
    }

    async fn subscribe_topic<T, F>(&self, topic: Topic, handler: F) -> BusResult<SubscriptionId>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        // Transport first: a failed (e.g. unsupported) subscription must not
        // leave a dangling registry entry
        self.inner.transport.subscribe(&topic).await?;
        let (id, _first) = self.inner.dispatcher.subscribe::<T, F>(&topic, handler);
        Ok(id)
    }

    /// Remove a subscription by token.
    ///
    /// No message published strictly after this completes is delivered to
    /// the handler; unknown tokens are a no-op.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> BusResult<()> {
        if let Some((topic, now_empty)) = self.inner.dispatcher.unsubscribe(id) {
            if now_empty {
                self.inner.transport.unsubscribe(&topic).await?;
            }
        }
        Ok(())
    }

    // ---- queues ------------------------------------------------------------

    /// Handle to the named FIFO queue; the backing object is created lazily
    /// on first use
    pub fn queue(&self, name: &str) -> Queue {
        Queue::new(self.clone(), name)
    }

    // ---- rpc ---------------------------------------------------------------

    /// Register a callable under an address.
    ///
    /// At most one callable is registered per address per bus; re-exposing
    /// replaces the callable while keeping the single responder.
    pub async fn expose<Args, C>(&self, addr: &str, callable: C) -> BusResult<()>
    where
        C: IntoRpcCallable<Args>,
    {
        self.ensure_running()?;
        let callable = callable.into_callable();

        {
            let mut exposed = self.inner.rpc.exposed.lock();
            if let Some(entry) = exposed.get_mut(addr) {
                debug!(addr, "replacing exposed callable");
                entry.callable = callable;
                return Ok(());
            }
        }

        let topic = Topic::Exact(format!("{RPC_CHANNEL_PREFIX}{addr}"));
        self.inner.transport.subscribe(&topic).await?;

        let weak = Arc::downgrade(&self.inner);
        let addr_owned = addr.to_string();
        let handler = move |request: RpcRequest| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_invocation(&addr_owned, request);
            }
        };
        let (subscription, _) = self
            .inner
            .dispatcher
            .subscribe::<RpcRequest, _>(&topic, handler);

        let mut exposed = self.inner.rpc.exposed.lock();
        if let Some(entry) = exposed.get_mut(addr) {
            // Lost a race with a concurrent expose; fold into its entry
            entry.callable = callable;
            drop(exposed);
            self.inner.dispatcher.unsubscribe(subscription);
        } else {
            exposed.insert(
                addr.to_string(),
                ExposedEntry {
                    callable,
                    subscription,
                },
            );
            debug!(addr, "exposed callable");
        }
        Ok(())
    }

    /// Remove the callable registered under `addr`; fails with
    /// `NoSuchRemote` if nothing is exposed there
    pub async fn unexpose(&self, addr: &str) -> BusResult<()> {
        let entry = self
            .inner
            .rpc
            .exposed
            .lock()
            .remove(addr)
            .ok_or_else(|| BusError::NoSuchRemote(addr.to_string()))?;
        if let Some((topic, now_empty)) = self.inner.dispatcher.unsubscribe(entry.subscription) {
            if now_empty {
                self.inner.transport.unsubscribe(&topic).await?;
            }
        }
        debug!(addr, "unexposed callable");
        Ok(())
    }

    /// Invoke the callable at `addr` with a tuple of arguments and await the
    /// single response; blocks until a response or shutdown
    pub async fn rpc<A: Serialize, R: DeserializeOwned>(&self, addr: &str, args: A) -> BusResult<R> {
        let response = self.call_single(addr, args, None).await?;
        response.into_result(addr)
    }

    /// Like [`Bus::rpc`] with a deadline; fails with `RpcTimeout` when no
    /// response arrives in time
    pub async fn rpc_timeout<A: Serialize, R: DeserializeOwned>(
        &self,
        addr: &str,
        args: A,
        timeout: Duration,
    ) -> BusResult<R> {
        let response = self.call_single(addr, args, Some(timeout)).await?;
        response.into_result(addr)
    }

    /// Invoke the callable at `addr` on every responder, collecting the
    /// responses that arrive within `timeout`.
    ///
    /// The list may be empty when no responder exists for the address.
    pub async fn rpc_multi<A: Serialize>(
        &self,
        addr: &str,
        args: A,
        timeout: Duration,
    ) -> BusResult<Vec<RpcResponse>> {
        let mut call = self.begin_call(addr, args).await?;
        let deadline = Instant::now() + timeout;
        let mut responses = Vec::new();
        let mut stopping = self.inner.stopping_rx.clone();
        let mut shut_down = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                received = tokio::time::timeout(remaining, call.rx.recv()) => match received {
                    Ok(Some(response)) => responses.push(response),
                    Ok(None) => {
                        shut_down = true;
                        break;
                    }
                    Err(_) => break,
                },
                _ = stopping.wait_for(|stop| *stop) => {
                    shut_down = true;
                    break;
                }
            }
        }
        self.finish_call(call).await;
        if shut_down {
            return Err(BusError::Shutdown);
        }
        debug!(addr, responders = responses.len(), "multi-mode call completed");
        Ok(responses)
    }

    /// Build a call handle bound to `addr`; see [`Stub`]
    pub fn stub(&self, addr: &str) -> Stub {
        Stub::new(self.clone(), addr)
    }

    async fn call_single<A: Serialize>(
        &self,
        addr: &str,
        args: A,
        timeout: Option<Duration>,
    ) -> BusResult<RpcResponse> {
        let mut call = self.begin_call(addr, args).await?;
        let mut stopping = self.inner.stopping_rx.clone();
        let wait = async {
            tokio::select! {
                received = call.rx.recv() => received.ok_or(BusError::Shutdown),
                _ = stopping.wait_for(|stop| *stop) => Err(BusError::Shutdown),
            }
        };
        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BusError::RpcTimeout {
                    addr: addr.to_string(),
                }),
            },
            None => wait.await,
        };
        self.finish_call(call).await;
        outcome
    }

    /// Set up correlation state and publish the invocation envelope:
    /// fresh id, unique reply channel, one-shot collector, then publish.
    async fn begin_call<A: Serialize>(&self, addr: &str, args: A) -> BusResult<PendingCall> {
        self.ensure_running()?;
        let args = codec::to_value(&args)?;
        let id = uuid::Uuid::new_v4().to_string();
        let reply_channel = format!("{RPC_REPLY_PREFIX}{}", uuid::Uuid::new_v4());
        let reply_topic = Topic::Exact(reply_channel.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.rpc.pending.lock().insert(id.clone(), tx);

        // The collector routes by correlation id through the pending table;
        // a late response for an expired invocation finds no entry and is
        // discarded
        let weak = Arc::downgrade(&self.inner);
        let handler = move |response: RpcResponse| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let sink = inner.rpc.pending.lock().get(&response.id).cloned();
            match sink {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!(id = %response.id, "discarding response for expired invocation"),
            }
        };

        if let Err(err) = self.inner.transport.subscribe(&reply_topic).await {
            self.inner.rpc.pending.lock().remove(&id);
            return Err(err);
        }
        let (subscription, _) = self
            .inner
            .dispatcher
            .subscribe::<RpcResponse, _>(&reply_topic, handler);

        let request = RpcRequest {
            id: id.clone(),
            reply_channel,
            function: addr.to_string(),
            args,
        };
        let payload = codec::encode(&request)?;
        let invocation_channel = format!("{RPC_CHANNEL_PREFIX}{addr}");
        debug!(addr, id = %request.id, "publishing rpc invocation");
        if let Err(err) = self
            .inner
            .transport
            .publish(&invocation_channel, &payload)
            .await
        {
            let call = PendingCall {
                id,
                reply_topic,
                subscription,
                rx,
            };
            self.finish_call(call).await;
            return Err(err);
        }

        Ok(PendingCall {
            id,
            reply_topic,
            subscription,
            rx,
        })
    }

    /// Tear down correlation state; the in-flight record is removed on every
    /// completion path
    async fn finish_call(&self, call: PendingCall) {
        self.inner.rpc.pending.lock().remove(&call.id);
        if let Some((topic, now_empty)) = self.inner.dispatcher.unsubscribe(call.subscription) {
            if now_empty {
                let _ = self.inner.transport.unsubscribe(&topic).await;
            }
        } else {
            // Shutdown cleared the registry first; nothing left to undo
            debug!(topic = call.reply_topic.name(), "reply collector already removed");
        }
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Shut the bus down: release pending RPC waits with `Shutdown`,
    /// unsubscribe everything, and stop the transport. Idempotent.
    pub async fn shutdown(&self) -> BusResult<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("bus already shut down");
            return Ok(());
        }
        info!(transport = self.inner.transport.name(), "shutting down bus");
        let _ = self.inner.stopping_tx.send(true);

        // Dropping the reply sinks releases collectors that missed the watch
        self.inner.rpc.pending.lock().clear();
        self.inner.rpc.exposed.lock().clear();

        for topic in self.inner.dispatcher.clear() {
            if let Err(err) = self.inner.transport.unsubscribe(&topic).await {
                warn!(topic = topic.name(), %err, "failed to unsubscribe during shutdown");
            }
        }
        self.inner.transport.stop().await
    }
}

impl BusInner {
    /// Responder side of an invocation: decode, invoke, answer on the
    /// envelope's reply channel.
    ///
    /// Runs on the transport's delivery task; the response publish is spawned
    /// so a slow reply cannot stall dispatch.
    fn handle_invocation(self: &Arc<Self>, addr: &str, request: RpcRequest) {
        let callable = self
            .rpc
            .exposed
            .lock()
            .get(addr)
            .map(|entry| entry.callable.clone());
        let Some(callable) = callable else {
            // Raced with unexpose; single-mode callers time out, multi-mode
            // callers simply miss this responder
            return;
        };

        let RpcRequest {
            id,
            reply_channel,
            function,
            args,
        } = request;
        debug!(addr, id = %id, function = %function, "handling rpc invocation");
        let (result, error) = match callable.invoke(args) {
            Ok(value) => (Some(value), None),
            Err(detail) => {
                warn!(addr, id = %id, error = %detail, "rpc callable failed");
                (None, Some(detail))
            }
        };
        let response = RpcResponse {
            id,
            responder: self.responder_id.clone(),
            result,
            error,
        };
        let payload = match codec::encode(&response) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(addr, %err, "failed to encode rpc response");
                return;
            }
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.publish(&reply_channel, &payload).await {
                warn!(channel = %reply_channel, %err, "failed to publish rpc response");
            }
        });
    }
}
