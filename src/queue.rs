//! Named FIFO queue facade.
//!
//! A [`Queue`] is a thin, cloneable handle over the active transport's named
//! queue primitive. The backing object is created lazily on first use and
//! outlives the handle; it is reclaimed by the transport, not the handle.
//!
//! Items are encoded by the codec with no a-priori type, so `get` is
//! untyped and yields the encoded-value tree. Queues carry scalar or string
//! payloads in practice; consumers of structured payloads apply a decoder
//! explicitly via [`Queue::get_as`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::bus::Bus;
use crate::codec;
use crate::error::BusResult;
use crate::transport::Wait;

/// Handle to one named FIFO queue on a bus
#[derive(Clone)]
pub struct Queue {
    bus: Bus,
    name: String,
}

impl Queue {
    pub(crate) fn new(bus: Bus, name: &str) -> Self {
        Self {
            bus,
            name: name.to_string(),
        }
    }

    /// The queue's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item, blocking only if the transport is bounded and full
    pub async fn put<T: Serialize + ?Sized>(&self, item: &T) -> BusResult<()> {
        self.put_wait(item, Wait::Forever).await
    }

    /// Append an item, waiting at most `timeout` for room;
    /// fails with `QueueFull` when the deadline elapses
    pub async fn put_timeout<T: Serialize + ?Sized>(
        &self,
        item: &T,
        timeout: Duration,
    ) -> BusResult<()> {
        self.put_wait(item, Wait::Timeout(timeout)).await
    }

    /// Append an item without waiting; fails with `QueueFull` if there is no
    /// room
    pub async fn put_nowait<T: Serialize + ?Sized>(&self, item: &T) -> BusResult<()> {
        self.put_wait(item, Wait::NoWait).await
    }

    /// Remove and return the oldest item, blocking until one arrives
    pub async fn get(&self) -> BusResult<Value> {
        self.get_wait(Wait::Forever).await
    }

    /// Remove and return the oldest item, waiting at most `timeout`;
    /// fails with `QueueEmpty` when the deadline elapses
    pub async fn get_timeout(&self, timeout: Duration) -> BusResult<Value> {
        self.get_wait(Wait::Timeout(timeout)).await
    }

    /// Remove and return the oldest item without waiting; fails with
    /// `QueueEmpty` if the queue holds nothing
    pub async fn get_nowait(&self) -> BusResult<Value> {
        self.get_wait(Wait::NoWait).await
    }

    /// Blocking get narrowed to a declared type
    pub async fn get_as<T: DeserializeOwned>(&self) -> BusResult<T> {
        self.bus.ensure_running()?;
        let payload = self
            .bus
            .transport()
            .queue_get(&self.name, Wait::Forever)
            .await?;
        codec::decode(&payload)
    }

    /// Current queue length; fails with `Unsupported` on transports whose
    /// primitive cannot answer
    pub async fn len(&self) -> BusResult<usize> {
        self.bus.ensure_running()?;
        self.bus.transport().queue_len(&self.name).await
    }

    async fn put_wait<T: Serialize + ?Sized>(&self, item: &T, wait: Wait) -> BusResult<()> {
        self.bus.ensure_running()?;
        let payload = codec::encode(item)?;
        self.bus
            .transport()
            .queue_put(&self.name, &payload, wait)
            .await
    }

    async fn get_wait(&self, wait: Wait) -> BusResult<Value> {
        self.bus.ensure_running()?;
        let payload = self.bus.transport().queue_get(&self.name, wait).await?;
        codec::decode_value(&payload)
    }
}
