//! Subscription registry and event dispatcher.
//!
//! The dispatcher owns two maps: exact channel subscriptions and pattern
//! subscriptions. Incoming deliveries are routed to the matching set, the
//! payload is decoded at most once per declared type, and each handler is
//! invoked with its own clone of the decoded value. Exact and pattern
//! matching produce independent invocations: a handler subscribed both ways
//! receives two deliveries.
//!
//! Locks guard only registry mutations and lookups. Delivery snapshots the
//! matching subscriptions and invokes handlers with no lock held, so a
//! handler may publish, subscribe, or unsubscribe re-entrantly, and a
//! subscription added mid-dispatch never sees the in-flight message.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::codec;
use crate::error::BusError;
use crate::transport::{Delivery, Topic};

/// Token identifying one registered subscription; removal is by token
pub type SubscriptionId = u64;

type ErasedDecoder = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any>, BusError> + Send + Sync>;
type ErasedHandler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    event_type: TypeId,
    event_name: &'static str,
    /// Dedup key for zero-sized handler types (fn items, captureless
    /// closures); stateful closures have no usable identity
    handler_type: Option<TypeId>,
    decode: ErasedDecoder,
    invoke: ErasedHandler,
}

pub(crate) struct Dispatcher {
    exact: Mutex<HashMap<String, Vec<Arc<Subscription>>>>,
    patterns: Mutex<HashMap<String, Vec<Arc<Subscription>>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            exact: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `topic`, decoding payloads as `T`.
    ///
    /// Returns the subscription token and whether this is the first
    /// subscription for the topic (the caller then arranges transport-level
    /// subscription). Re-registering a zero-sized handler on the same topic
    /// is a no-op returning the original token.
    pub(crate) fn subscribe<T, F>(&self, topic: &Topic, handler: F) -> (SubscriptionId, bool)
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let handler_type = (std::mem::size_of::<F>() == 0).then(TypeId::of::<F>);

        let map = match topic {
            Topic::Exact(_) => &self.exact,
            Topic::Pattern(_) => &self.patterns,
        };
        let mut map = map.lock();
        let entry = map.entry(topic.name().to_string()).or_default();

        if let Some(key) = handler_type {
            if let Some(existing) = entry.iter().find(|s| s.handler_type == Some(key)) {
                debug!(topic = topic.name(), id = existing.id, "subscription already registered");
                return (existing.id, false);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let invoke: ErasedHandler = Arc::new(move |any: &dyn Any| {
            if let Some(value) = any.downcast_ref::<T>() {
                handler(value.clone());
            }
        });
        let decode: ErasedDecoder =
            Arc::new(|payload| codec::decode::<T>(payload).map(|v| Box::new(v) as Box<dyn Any>));

        let first = entry.is_empty();
        entry.push(Arc::new(Subscription {
            id,
            event_type: TypeId::of::<T>(),
            event_name: std::any::type_name::<T>(),
            handler_type,
            decode,
            invoke,
        }));
        debug!(topic = topic.name(), id, "subscription registered");
        (id, first)
    }

    /// Remove a subscription by token.
    ///
    /// Returns the topic it was registered under and whether that topic is
    /// now empty (so the caller can drop the transport-level subscription).
    /// Unknown tokens return `None`.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> Option<(Topic, bool)> {
        for (map, make_topic) in [
            (&self.exact, Topic::Exact as fn(String) -> Topic),
            (&self.patterns, Topic::Pattern as fn(String) -> Topic),
        ] {
            let mut map = map.lock();
            let mut found: Option<String> = None;
            for (name, subs) in map.iter_mut() {
                if let Some(pos) = subs.iter().position(|s| s.id == id) {
                    subs.remove(pos);
                    found = Some(name.clone());
                    break;
                }
            }
            if let Some(name) = found {
                let now_empty = map.get(&name).is_some_and(|subs| subs.is_empty());
                if now_empty {
                    map.remove(&name);
                }
                return Some((make_topic(name), now_empty));
            }
        }
        None
    }

    /// Drop every subscription, returning the topics that were registered
    pub(crate) fn clear(&self) -> Vec<Topic> {
        let mut topics = Vec::new();
        topics.extend(self.exact.lock().drain().map(|(name, _)| Topic::Exact(name)));
        topics.extend(self.patterns.lock().drain().map(|(name, _)| Topic::Pattern(name)));
        topics
    }

    /// Route one incoming delivery to its subscribers.
    ///
    /// Pattern deliveries carry the pattern they matched under and are routed
    /// only to that pattern's subscribers; plain deliveries go to the exact
    /// set. Each declared type is decoded at most once and the result reused
    /// across handlers. A handler that panics is logged and does not abort
    /// dispatch to its siblings.
    pub(crate) fn dispatch(&self, delivery: &Delivery) {
        let subs: Vec<Arc<Subscription>> = match &delivery.pattern {
            Some(pattern) => self
                .patterns
                .lock()
                .get(pattern.as_str())
                .cloned()
                .unwrap_or_default(),
            None => self
                .exact
                .lock()
                .get(delivery.channel.as_str())
                .cloned()
                .unwrap_or_default(),
        };
        if subs.is_empty() {
            return;
        }

        // None marks a type whose decode already failed for this delivery
        let mut decoded: HashMap<TypeId, Option<Box<dyn Any>>> = HashMap::new();
        for sub in &subs {
            if !decoded.contains_key(&sub.event_type) {
                let value = match (sub.decode)(&delivery.payload) {
                    Ok(v) => Some(v),
                    Err(err) => {
                        warn!(
                            channel = %delivery.channel,
                            event = sub.event_name,
                            %err,
                            "payload does not decode as the declared type; skipping handler"
                        );
                        None
                    }
                };
                decoded.insert(sub.event_type, value);
            }
            let Some(Some(value)) = decoded.get(&sub.event_type) else {
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.invoke)(value.as_ref())));
            if outcome.is_err() {
                error!(
                    channel = %delivery.channel,
                    subscription = sub.id,
                    "event handler panicked; continuing dispatch"
                );
            }
        }
    }
}
