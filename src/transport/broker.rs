//! Shared-broker transport over the Redis protocol.
//!
//! Works against Redis, Valkey, and DragonflyDB. Publish/subscribe maps onto
//! the broker's native pub/sub primitives, including glob-style pattern
//! subscriptions via `PSUBSCRIBE`, which makes this the only built-in
//! transport with full pattern support and cross-host visibility. Named
//! queues map onto broker lists (`RPUSH`/`LPOP`/`LLEN`).
//!
//! ## Connection layout
//!
//! Two connections are held: a multiplexed command connection for
//! `PUBLISH` and list operations, and a dedicated pub/sub connection whose
//! message stream is drained by a background task. Subscription changes are
//! funneled to that task through a control channel and applied between
//! stream polls, since the pub/sub connection is single-owner.
//!
//! Blocking queue gets poll `LPOP` with a capped exponential backoff rather
//! than parking in `BLPOP`, which would stall the shared command connection
//! for every other caller.
//!
//! Channels and queue keys carry the configured prefix so several
//! independent buses can share one broker.

use std::time::{Duration, Instant};

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{BusConfig, Capabilities, Delivery, DeliveryFn, Topic, Transport, Wait};
use crate::error::BusError;

/// Poll backoff cap for blocking list gets
const POP_BACKOFF_CAP: Duration = Duration::from_millis(25);

enum PubSubCtl {
    Subscribe(Topic, oneshot::Sender<Result<(), BusError>>),
    Unsubscribe(Topic, oneshot::Sender<Result<(), BusError>>),
    Stop,
}

/// One step of the pub/sub loop, extracted so the stream borrow ends before
/// control operations touch the connection
enum Step {
    Message {
        channel: String,
        pattern: Option<String>,
        payload: Vec<u8>,
    },
    Control(PubSubCtl),
    Closed,
}

/// Shared-broker transport backend
pub struct BrokerTransport {
    client: Client,
    conn: tokio::sync::Mutex<MultiplexedConnection>,
    prefix: String,
    ctl: parking_lot::Mutex<Option<mpsc::UnboundedSender<PubSubCtl>>>,
    pump_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BrokerTransport {
    /// Connect to the broker named by `config.broker_url`.
    ///
    /// The command connection is established eagerly so configuration errors
    /// surface at init time rather than on first publish.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let client = Client::open(config.broker_url.as_str())
            .map_err(|e| BusError::transport(format!("invalid broker URL: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::transport(format!("broker connection failed: {e}")))?;
        debug!(url = %config.broker_url, "connected to broker");

        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(conn),
            prefix: config.channel_prefix.clone(),
            ctl: parking_lot::Mutex::new(None),
            pump_task: parking_lot::Mutex::new(None),
        })
    }

    fn channel_key(&self, channel: &str) -> String {
        format!("{}:{}", self.prefix, channel)
    }

    fn queue_key(&self, name: &str) -> String {
        format!("{}:queue:{}", self.prefix, name)
    }

    fn strip_prefix(prefix: &str, key: &str) -> String {
        key.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(key)
            .to_string()
    }

    async fn control(&self, ctl: impl FnOnce(oneshot::Sender<Result<(), BusError>>) -> PubSubCtl) -> Result<(), BusError> {
        let sender = self
            .ctl
            .lock()
            .clone()
            .ok_or_else(|| BusError::transport("broker transport is not started"))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        sender
            .send(ctl(ack_tx))
            .map_err(|_| BusError::transport("broker pub/sub loop is gone"))?;
        ack_rx
            .await
            .map_err(|_| BusError::transport("broker pub/sub loop dropped the request"))?
    }
}

#[async_trait::async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &'static str {
        "broker"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            patterns: true,
            cross_process: true,
            cross_host: true,
            queue_len: true,
        }
    }

    async fn start(&self, on_delivery: DeliveryFn) -> Result<(), BusError> {
        if self.ctl.lock().is_some() {
            return Err(BusError::transport("broker transport already started"));
        }
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::transport(format!("broker pub/sub connection failed: {e}")))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<PubSubCtl>();
        let prefix = self.prefix.clone();
        let task = tokio::spawn(async move {
            loop {
                let step = {
                    let mut stream = pubsub.on_message();
                    tokio::select! {
                        msg = stream.next() => match msg {
                            Some(msg) => Step::Message {
                                channel: msg.get_channel_name().to_string(),
                                pattern: msg.get_pattern::<String>().ok(),
                                payload: msg.get_payload_bytes().to_vec(),
                            },
                            None => Step::Closed,
                        },
                        ctl = rx.recv() => match ctl {
                            Some(ctl) => Step::Control(ctl),
                            None => Step::Closed,
                        },
                    }
                };

                match step {
                    Step::Message {
                        channel,
                        pattern,
                        payload,
                    } => {
                        on_delivery(Delivery {
                            channel: Self::strip_prefix(&prefix, &channel),
                            payload,
                            pattern: pattern.map(|p| Self::strip_prefix(&prefix, &p)),
                        });
                    }
                    Step::Control(PubSubCtl::Subscribe(topic, ack)) => {
                        let key = format!("{}:{}", prefix, topic.name());
                        let result = match &topic {
                            Topic::Exact(_) => pubsub.subscribe(&key).await,
                            Topic::Pattern(_) => pubsub.psubscribe(&key).await,
                        };
                        let _ = ack.send(result.map_err(BusError::transport));
                    }
                    Step::Control(PubSubCtl::Unsubscribe(topic, ack)) => {
                        let key = format!("{}:{}", prefix, topic.name());
                        let result = match &topic {
                            Topic::Exact(_) => pubsub.unsubscribe(&key).await,
                            Topic::Pattern(_) => pubsub.punsubscribe(&key).await,
                        };
                        let _ = ack.send(result.map_err(BusError::transport));
                    }
                    Step::Control(PubSubCtl::Stop) | Step::Closed => break,
                }
            }
            debug!("broker pub/sub loop exited");
        });

        *self.ctl.lock() = Some(tx);
        *self.pump_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        if let Some(sender) = self.ctl.lock().take() {
            let _ = sender.send(PubSubCtl::Stop);
        }
        let task = self.pump_task.lock().take();
        if let Some(task) = task {
            if task.await.is_err() {
                error!("broker pub/sub loop ended abnormally");
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let key = self.channel_key(channel);
        let mut conn = self.conn.lock().await;
        conn.publish::<_, _, ()>(key, payload)
            .await
            .map_err(|e| BusError::transport(format!("PUBLISH failed: {e}")))
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), BusError> {
        let topic = topic.clone();
        self.control(move |ack| PubSubCtl::Subscribe(topic, ack)).await
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), BusError> {
        let topic = topic.clone();
        self.control(move |ack| PubSubCtl::Unsubscribe(topic, ack)).await
    }

    async fn queue_put(&self, queue: &str, item: &[u8], wait: Wait) -> Result<(), BusError> {
        // Broker lists are unbounded; every put variant completes immediately
        let _ = wait;
        let key = self.queue_key(queue);
        let mut conn = self.conn.lock().await;
        conn.rpush::<_, _, ()>(key, item)
            .await
            .map_err(|e| BusError::transport(format!("RPUSH failed: {e}")))
    }

    async fn queue_get(&self, queue: &str, wait: Wait) -> Result<Vec<u8>, BusError> {
        let key = self.queue_key(queue);
        let deadline = match wait {
            Wait::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut backoff = Duration::from_millis(1);
        loop {
            let popped: Option<Vec<u8>> = {
                let mut conn = self.conn.lock().await;
                conn.lpop(&key, None)
                    .await
                    .map_err(|e| BusError::transport(format!("LPOP failed: {e}")))?
            };
            if let Some(item) = popped {
                return Ok(item);
            }
            match wait {
                Wait::NoWait => return Err(BusError::QueueEmpty(queue.to_string())),
                Wait::Timeout(_) => {
                    let deadline = deadline.expect("deadline set for timed wait");
                    if Instant::now() >= deadline {
                        return Err(BusError::QueueEmpty(queue.to_string()));
                    }
                    tokio::time::sleep(backoff.min(deadline - Instant::now())).await;
                }
                Wait::Forever => tokio::time::sleep(backoff).await,
            }
            backoff = (backoff * 2).min(POP_BACKOFF_CAP);
        }
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError> {
        let key = self.queue_key(queue);
        let mut conn = self.conn.lock().await;
        conn.llen(&key)
            .await
            .map_err(|e| BusError::transport(format!("LLEN failed: {e}")))
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        if let Some(sender) = self.ctl.lock().take() {
            let _ = sender.send(PubSubCtl::Stop);
        }
    }
}
