//! POSIX message-queue transport (Linux).
//!
//! A single-host mesh over kernel message queues. There is no broker
//! process: every bus node owns one inbox queue, and subscriptions are
//! announced through a filesystem rendezvous directory, where
//! `<dir>/channels/<channel-key>/<node>` is a marker file naming the node's
//! inbox. Publishing fans out one `mq_send` per registered inbox; stale
//! registrations (whose inbox has been unlinked) are garbage-collected on
//! the way.
//!
//! Named queues map one-to-one onto kernel queues, which gives cross-process
//! FIFO with kernel-enforced bounds for free. The primitive has no pattern
//! matching and no portable length query, so pattern subscriptions and
//! `len()` fail with `Unsupported`.
//!
//! Descriptors are opened non-blocking; blocked operations retry with a
//! capped exponential backoff off the async runtime (`spawn_blocking`), and
//! only queue creators unlink kernel objects during cleanup.
//!
//! Kernel queues are subject to system-wide limits
//! (`/proc/sys/fs/mqueue/queues_max`, `msg_max`, `msgsize_max`); the
//! defaults are sized to fit typical unprivileged limits.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{BusConfig, Capabilities, Delivery, DeliveryFn, Topic, Transport, Wait};
use crate::error::BusError;

/// Retry limit for a full/empty kernel queue before giving up on a
/// fan-out send
const FANOUT_MAX_RETRIES: u32 = 100;

/// Backoff cap for kernel queue retries
const RETRY_BACKOFF_CAP: Duration = Duration::from_millis(10);

/// Frame carried through node inboxes; named queues carry raw payloads
#[derive(Debug, Serialize, Deserialize)]
struct InboxFrame {
    channel: String,
    payload: Vec<u8>,
}

/// Single-host transport backend over POSIX message queues
pub struct PosixMqTransport {
    prefix: String,
    /// Short node identity; names the inbox and the rendezvous markers
    node: String,
    dir: PathBuf,
    mode: Mode,
    depth: usize,
    max_msg_size: usize,
    inbox_name: String,
    inbox: parking_lot::Mutex<Option<MqdT>>,
    /// Kernel queues backing named queues, opened on first use
    named: parking_lot::Mutex<HashMap<String, MqdT>>,
    /// Kernel object names this node created and must unlink
    created: parking_lot::Mutex<HashSet<String>>,
    stopping: Arc<AtomicBool>,
    receiver_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pump_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Collapse a free-form name into something a kernel queue or directory
/// entry can carry, keeping a hash so distinct names stay distinct
fn sanitize(name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(64)
        .collect();
    format!("{safe}_{:08x}", hasher.finish() as u32)
}

impl PosixMqTransport {
    /// Create a transport node rooted at `config.ipc_dir`
    pub fn new(config: &BusConfig) -> Result<Self, BusError> {
        let node = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let dir = config.ipc_dir.clone();
        std::fs::create_dir_all(dir.join("channels"))?;

        let prefix = config.channel_prefix.clone();
        let inbox_name = format!("/{prefix}_{node}");
        debug!(%node, dir = %dir.display(), "created posix-mq transport node");
        Ok(Self {
            prefix,
            node,
            dir,
            mode: Mode::from_bits_truncate(config.ipc_mode),
            depth: config.queue_depth,
            max_msg_size: config.max_msg_size,
            inbox_name,
            inbox: parking_lot::Mutex::new(None),
            named: parking_lot::Mutex::new(HashMap::new()),
            created: parking_lot::Mutex::new(HashSet::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            receiver_task: parking_lot::Mutex::new(None),
            pump_task: parking_lot::Mutex::new(None),
        })
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        self.dir.join("channels").join(sanitize(channel))
    }

    fn queue_object_name(&self, queue: &str) -> String {
        format!("/{}_q_{}", self.prefix, sanitize(queue))
    }

    fn attr(&self) -> MqAttr {
        MqAttr::new(0, self.depth as i64, self.max_msg_size as i64, 0)
    }

    /// Open a kernel queue non-blocking, creating it if absent.
    ///
    /// Opening without `O_CREAT` first keeps creator tracking accurate: only
    /// the node that actually created an object unlinks it later.
    fn open_queue(&self, object: &str) -> Result<MqdT, BusError> {
        let flags = MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK;
        match mq_open(object, flags, Mode::empty(), None) {
            Ok(fd) => return Ok(fd),
            Err(Errno::ENOENT) => {}
            Err(e) => {
                return Err(BusError::transport(format!(
                    "failed to open queue '{object}': {e}"
                )))
            }
        }
        let fd = mq_open(
            object,
            flags | MQ_OFlag::O_CREAT,
            self.mode,
            Some(&self.attr()),
        )
        .map_err(|e| BusError::transport(format!("failed to create queue '{object}': {e}")))?;
        self.created.lock().insert(object.to_string());
        debug!(object, "created kernel queue");
        Ok(fd)
    }

    /// Raw descriptor for a named queue, opening the kernel object on first
    /// reference. The `MqdT` stays in the map, so the raw fd remains valid
    /// until `stop`.
    fn named_fd(&self, queue: &str) -> Result<RawFd, BusError> {
        let object = self.queue_object_name(queue);
        let mut named = self.named.lock();
        if let Some(fd) = named.get(&object) {
            return Ok(fd.as_raw_fd());
        }
        let fd = self.open_queue(&object)?;
        let raw = fd.as_raw_fd();
        named.insert(object, fd);
        Ok(raw)
    }

    /// Synchronous cleanup shared by `stop` and `Drop`
    fn cleanup(&self) {
        if let Some(fd) = self.inbox.lock().take() {
            let _ = mq_close(fd);
        }
        for (_, fd) in self.named.lock().drain() {
            let _ = mq_close(fd);
        }
        for object in self.created.lock().drain() {
            let _ = mq_unlink(object.as_str());
        }
        // Withdraw this node's subscription markers
        if let Ok(channels) = std::fs::read_dir(self.dir.join("channels")) {
            for entry in channels.flatten() {
                let _ = std::fs::remove_file(entry.path().join(&self.node));
            }
        }
    }
}

impl Drop for PosixMqTransport {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cleanup();
    }
}

/// One non-blocking send on an already-open descriptor, reconstructed from
/// the raw fd for the duration of the call
fn send_raw(raw_fd: RawFd, data: &[u8]) -> Result<(), Errno> {
    let fd = unsafe { MqdT::from_raw_fd(raw_fd) };
    let result = mq_send(&fd, data, 0);
    std::mem::forget(fd); // Don't close the fd when this MqdT drops
    result
}

/// One non-blocking receive on an already-open descriptor
fn receive_raw(raw_fd: RawFd, max_msg_size: usize) -> Result<Vec<u8>, Errno> {
    let fd = unsafe { MqdT::from_raw_fd(raw_fd) };
    let mut buffer = vec![0u8; max_msg_size];
    let mut priority = 0u32;
    let result = mq_receive(&fd, &mut buffer, &mut priority);
    std::mem::forget(fd); // Don't close the fd when this MqdT drops
    result.map(|read| {
        buffer.truncate(read);
        buffer
    })
}

/// Deliver one frame to a peer inbox, opening it by name.
///
/// `ENOENT` means the peer unlinked its inbox without withdrawing its
/// registration; the caller removes the stale marker.
fn send_to_inbox(inbox: &str, frame: &[u8]) -> Result<(), Errno> {
    let fd = mq_open(inbox, MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK, Mode::empty(), None)?;
    let mut backoff = Duration::from_millis(1);
    for attempt in 0..FANOUT_MAX_RETRIES {
        match mq_send(&fd, frame, 0) {
            Ok(()) => {
                let _ = mq_close(fd);
                return Ok(());
            }
            Err(Errno::EAGAIN) if attempt + 1 < FANOUT_MAX_RETRIES => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
            }
            Err(e) => {
                let _ = mq_close(fd);
                return Err(e);
            }
        }
    }
    let _ = mq_close(fd);
    Err(Errno::EAGAIN)
}

/// Fan a frame out to every inbox registered under a channel directory
fn fan_out(channel_dir: &Path, frame: &[u8]) {
    let entries = match std::fs::read_dir(channel_dir) {
        Ok(entries) => entries,
        // No directory means no subscribers
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let marker = entry.path();
        let inbox = match std::fs::read_to_string(&marker) {
            Ok(name) => name,
            Err(_) => continue,
        };
        match send_to_inbox(inbox.trim(), frame) {
            Ok(()) => {}
            Err(Errno::ENOENT) => {
                debug!(inbox = inbox.trim(), "removing stale subscription marker");
                let _ = std::fs::remove_file(&marker);
            }
            Err(Errno::EAGAIN) => {
                warn!(inbox = inbox.trim(), "peer inbox stayed full; dropping message");
            }
            Err(e) => {
                warn!(inbox = inbox.trim(), error = %e, "failed to deliver to peer inbox");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for PosixMqTransport {
    fn name(&self) -> &'static str {
        "posix-mq"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            patterns: false,
            cross_process: true,
            cross_host: false,
            queue_len: false,
        }
    }

    async fn start(&self, on_delivery: DeliveryFn) -> Result<(), BusError> {
        if self.inbox.lock().is_some() {
            return Err(BusError::transport("posix-mq transport already started"));
        }
        let inbox = self.open_queue(&self.inbox_name)?;
        let raw_fd = inbox.as_raw_fd();
        *self.inbox.lock() = Some(inbox);

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1024);
        let stopping = self.stopping.clone();
        let max_msg_size = self.max_msg_size;

        // Blocking receiver drains the kernel queue; the async pump decodes
        // frames and feeds the dispatcher from runtime context
        let receiver = tokio::task::spawn_blocking(move || {
            while !stopping.load(Ordering::SeqCst) {
                match receive_raw(raw_fd, max_msg_size) {
                    Ok(buffer) => {
                        if tx.blocking_send(buffer).is_err() {
                            break;
                        }
                    }
                    Err(Errno::EAGAIN) => std::thread::sleep(Duration::from_millis(1)),
                    Err(Errno::EBADF) => break, // inbox closed during stop
                    Err(e) => {
                        error!(error = %e, "inbox receive failed; stopping delivery loop");
                        break;
                    }
                }
            }
        });
        let pump = tokio::spawn(async move {
            while let Some(buffer) = rx.recv().await {
                match bincode::deserialize::<InboxFrame>(&buffer) {
                    Ok(frame) => on_delivery(Delivery {
                        channel: frame.channel,
                        payload: frame.payload,
                        pattern: None,
                    }),
                    Err(e) => warn!(error = %e, "discarding malformed inbox frame"),
                }
            }
            debug!("posix-mq delivery pump exited");
        });

        *self.receiver_task.lock() = Some(receiver);
        *self.pump_task.lock() = Some(pump);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.stopping.store(true, Ordering::SeqCst);
        let receiver = self.receiver_task.lock().take();
        let pump = self.pump_task.lock().take();
        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        // Move owned kernel state into a blocking task for teardown
        let inbox = self.inbox.lock().take();
        let named: Vec<MqdT> = self.named.lock().drain().map(|(_, fd)| fd).collect();
        let created: Vec<String> = self.created.lock().drain().collect();
        let channels_dir = self.dir.join("channels");
        let node = self.node.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(fd) = inbox {
                let _ = mq_close(fd);
            }
            for fd in named {
                let _ = mq_close(fd);
            }
            for object in created {
                let _ = mq_unlink(object.as_str());
            }
            if let Ok(entries) = std::fs::read_dir(&channels_dir) {
                for entry in entries.flatten() {
                    let _ = std::fs::remove_file(entry.path().join(&node));
                }
            }
        })
        .await
        .map_err(|e| BusError::transport(format!("cleanup task failed: {e}")))?;
        debug!("posix-mq transport stopped");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let frame = bincode::serialize(&InboxFrame {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        })
        .map_err(|e| BusError::transport(format!("failed to frame message: {e}")))?;
        if frame.len() > self.max_msg_size {
            return Err(BusError::transport(format!(
                "message of {} bytes exceeds transport limit of {}",
                frame.len(),
                self.max_msg_size
            )));
        }
        let dir = self.channel_dir(channel);
        tokio::task::spawn_blocking(move || fan_out(&dir, &frame))
            .await
            .map_err(|e| BusError::transport(format!("fan-out task failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), BusError> {
        let channel = match topic {
            Topic::Exact(channel) => channel,
            Topic::Pattern(_) => {
                return Err(BusError::Unsupported {
                    operation: "pattern subscription",
                    transport: self.name(),
                })
            }
        };
        let dir = self.channel_dir(channel);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&self.node), &self.inbox_name).await?;
        debug!(channel, node = %self.node, "registered channel subscription");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), BusError> {
        let channel = match topic {
            Topic::Exact(channel) => channel,
            Topic::Pattern(_) => {
                return Err(BusError::Unsupported {
                    operation: "pattern subscription",
                    transport: self.name(),
                })
            }
        };
        let marker = self.channel_dir(channel).join(&self.node);
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn queue_put(&self, queue: &str, item: &[u8], wait: Wait) -> Result<(), BusError> {
        if item.len() > self.max_msg_size {
            return Err(BusError::transport(format!(
                "item of {} bytes exceeds transport limit of {}",
                item.len(),
                self.max_msg_size
            )));
        }
        let raw_fd = self.named_fd(queue)?;
        let deadline = match wait {
            Wait::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut backoff = Duration::from_millis(1);
        loop {
            let data = item.to_vec();
            let result = tokio::task::spawn_blocking(move || send_raw(raw_fd, &data))
                .await
                .map_err(|e| BusError::transport(format!("queue task failed: {e}")))?;
            match result {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) => match wait {
                    Wait::NoWait => return Err(BusError::QueueFull(queue.to_string())),
                    Wait::Timeout(_) => {
                        let deadline = deadline.expect("deadline set for timed wait");
                        if Instant::now() >= deadline {
                            return Err(BusError::QueueFull(queue.to_string()));
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    }
                    Wait::Forever => {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    }
                },
                Err(e) => {
                    return Err(BusError::transport(format!(
                        "failed to put on queue '{queue}': {e}"
                    )))
                }
            }
        }
    }

    async fn queue_get(&self, queue: &str, wait: Wait) -> Result<Vec<u8>, BusError> {
        let raw_fd = self.named_fd(queue)?;
        let max_msg_size = self.max_msg_size;
        let deadline = match wait {
            Wait::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut backoff = Duration::from_millis(1);
        loop {
            let result = tokio::task::spawn_blocking(move || receive_raw(raw_fd, max_msg_size))
                .await
                .map_err(|e| BusError::transport(format!("queue task failed: {e}")))?;
            match result {
                Ok(item) => return Ok(item),
                Err(Errno::EAGAIN) => match wait {
                    Wait::NoWait => return Err(BusError::QueueEmpty(queue.to_string())),
                    Wait::Timeout(_) => {
                        let deadline = deadline.expect("deadline set for timed wait");
                        if Instant::now() >= deadline {
                            return Err(BusError::QueueEmpty(queue.to_string()));
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    }
                    Wait::Forever => {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    }
                },
                Err(e) => {
                    return Err(BusError::transport(format!(
                        "failed to get from queue '{queue}': {e}"
                    )))
                }
            }
        }
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError> {
        let _ = queue;
        Err(BusError::Unsupported {
            operation: "queue length",
            transport: self.name(),
        })
    }
}
