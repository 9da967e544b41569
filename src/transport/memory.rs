//! In-memory transport.
//!
//! A single-process backend with no cross-process visibility and no pattern
//! matching, primarily for tests and in-process decoupling. Published
//! messages for subscribed channels are funneled through one pump task, so
//! per-channel publication order is preserved end-to-end. Handlers never
//! run on the publisher's stack, which keeps re-entrant publishes from
//! inside a handler deadlock-free.
//!
//! Named queues are plain FIFO buffers with optional bounds; waiters park on
//! a notifier instead of polling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BusConfig, Capabilities, Delivery, DeliveryFn, Topic, Transport, Wait};
use crate::error::BusError;

/// Single-process transport backend
pub struct MemoryTransport {
    subscribed: Mutex<HashSet<String>>,
    queues: Mutex<HashMap<String, Arc<MemQueue>>>,
    queue_bound: Option<usize>,
    pump: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    /// Create an in-memory transport from the queue-related configuration
    pub fn new(config: &BusConfig) -> Self {
        Self {
            subscribed: Mutex::new(HashSet::new()),
            queues: Mutex::new(HashMap::new()),
            queue_bound: config.memory_queue_bound,
            pump: Mutex::new(None),
            pump_task: Mutex::new(None),
        }
    }

    /// Queues are created lazily on first reference and live until `stop`
    fn queue(&self, name: &str) -> Arc<MemQueue> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemQueue::new(self.queue_bound)))
            .clone()
    }

    fn unsupported(&self, operation: &'static str) -> BusError {
        BusError::Unsupported {
            operation,
            transport: self.name(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            patterns: false,
            cross_process: false,
            cross_host: false,
            queue_len: true,
        }
    }

    async fn start(&self, on_delivery: DeliveryFn) -> Result<(), BusError> {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Err(BusError::transport("in-memory transport already started"));
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                on_delivery(delivery);
            }
            debug!("in-memory delivery pump exited");
        });
        *pump = Some(tx);
        *self.pump_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        // Dropping the sender lets the pump drain in-flight deliveries first
        self.pump.lock().take();
        let task = self.pump_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.subscribed.lock().clear();
        self.queues.lock().clear();
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        if !self.subscribed.lock().contains(channel) {
            debug!(channel, "no subscriber for channel; dropping message");
            return Ok(());
        }
        let sender = self
            .pump
            .lock()
            .clone()
            .ok_or_else(|| BusError::transport("in-memory transport is not started"))?;
        sender
            .send(Delivery {
                channel: channel.to_string(),
                payload: payload.to_vec(),
                pattern: None,
            })
            .map_err(|_| BusError::transport("in-memory delivery pump is gone"))
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), BusError> {
        match topic {
            Topic::Exact(channel) => {
                self.subscribed.lock().insert(channel.clone());
                Ok(())
            }
            Topic::Pattern(_) => Err(self.unsupported("pattern subscription")),
        }
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), BusError> {
        match topic {
            Topic::Exact(channel) => {
                self.subscribed.lock().remove(channel.as_str());
                Ok(())
            }
            Topic::Pattern(_) => Err(self.unsupported("pattern subscription")),
        }
    }

    async fn queue_put(&self, queue: &str, item: &[u8], wait: Wait) -> Result<(), BusError> {
        self.queue(queue).push(queue, item.to_vec(), wait).await
    }

    async fn queue_get(&self, queue: &str, wait: Wait) -> Result<Vec<u8>, BusError> {
        self.queue(queue).pop(queue, wait).await
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError> {
        Ok(self.queue(queue).len())
    }
}

/// FIFO buffer backing one named queue
struct MemQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    bound: Option<usize>,
    /// Signalled when an item is pushed; parks blocked getters
    added: Notify,
    /// Signalled when an item is popped; parks blocked putters on a bounded
    /// queue
    removed: Notify,
}

impl MemQueue {
    fn new(bound: Option<usize>) -> Self {
        if let Some(bound) = bound {
            debug!(bound, "creating bounded in-memory queue");
        }
        Self {
            items: Mutex::new(VecDeque::new()),
            bound,
            added: Notify::new(),
            removed: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn try_push(&self, item: Vec<u8>) -> Result<(), Vec<u8>> {
        let mut items = self.items.lock();
        if self.bound.is_some_and(|b| items.len() >= b) {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.added.notify_waiters();
        Ok(())
    }

    fn try_pop(&self) -> Option<Vec<u8>> {
        let popped = self.items.lock().pop_front();
        if popped.is_some() {
            self.removed.notify_waiters();
        }
        popped
    }

    async fn push(&self, name: &str, item: Vec<u8>, wait: Wait) -> Result<(), BusError> {
        let deadline = match wait {
            Wait::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut item = item;
        loop {
            // Register interest before re-checking so a concurrent pop
            // between the check and the await cannot be missed
            let notified = self.removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => item = rejected,
            }
            match wait {
                Wait::NoWait => {
                    warn!(queue = name, "bounded queue is full");
                    return Err(BusError::QueueFull(name.to_string()));
                }
                Wait::Forever => notified.await,
                Wait::Timeout(_) => {
                    let deadline = deadline.expect("deadline set for timed wait");
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BusError::QueueFull(name.to_string()));
                    }
                    let _ = tokio::time::timeout(deadline - now, notified).await;
                }
            }
        }
    }

    async fn pop(&self, name: &str, wait: Wait) -> Result<Vec<u8>, BusError> {
        let deadline = match wait {
            Wait::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        loop {
            let notified = self.added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Ok(item);
            }
            match wait {
                Wait::NoWait => return Err(BusError::QueueEmpty(name.to_string())),
                Wait::Forever => notified.await,
                Wait::Timeout(_) => {
                    let deadline = deadline.expect("deadline set for timed wait");
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BusError::QueueEmpty(name.to_string()));
                    }
                    let _ = tokio::time::timeout(deadline - now, notified).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn transport() -> MemoryTransport {
        MemoryTransport::new(&BusConfig::default())
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let t = transport();
        t.start(Arc::new(|_d: Delivery| panic!("nothing should be delivered")))
            .await
            .unwrap();
        t.publish("ch", b"{}").await.unwrap();
        t.stop().await.unwrap();
    }

    #[tokio::test]
    async fn publish_reaches_delivery_callback() {
        let t = transport();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        t.start(Arc::new(move |d: Delivery| {
            assert_eq!(d.channel, "ch");
            assert_eq!(d.payload, b"{}");
            s.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        t.subscribe(&Topic::Exact("ch".into())).await.unwrap();
        t.publish("ch", b"{}").await.unwrap();
        t.stop().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pattern_subscription_is_unsupported() {
        let t = transport();
        let err = t.subscribe(&Topic::Pattern("a.*".into())).await.unwrap_err();
        assert!(matches!(err, BusError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn bounded_queue_put_nowait_fails_when_full() {
        let config = BusConfig {
            memory_queue_bound: Some(1),
            ..BusConfig::default()
        };
        let t = MemoryTransport::new(&config);
        t.queue_put("q", b"1", Wait::NoWait).await.unwrap();
        let err = t.queue_put("q", b"2", Wait::NoWait).await.unwrap_err();
        assert!(matches!(err, BusError::QueueFull(_)));
    }

    #[tokio::test]
    async fn timed_get_waits_out_the_deadline() {
        let t = transport();
        let started = Instant::now();
        let err = t
            .queue_get("q", Wait::Timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::QueueEmpty(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blocked_get_wakes_on_put() {
        let t = Arc::new(transport());
        let getter = {
            let t = t.clone();
            tokio::spawn(async move { t.queue_get("q", Wait::Forever).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.queue_put("q", b"item", Wait::Forever).await.unwrap();
        let item = getter.await.unwrap().unwrap();
        assert_eq!(item, b"item");
    }
}
