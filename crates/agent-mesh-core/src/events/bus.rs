//! Pub/sub fan-out for control-plane events.
//!
//! Channels are named `global`, `service:<name>`, or `workflow:<id>`. Each
//! channel keeps one bounded queue per subscriber; a subscriber that cannot
//! accept an event within the delivery deadline is evicted. A separate
//! kind-keyed handler table supports in-process dispatch: all handlers for
//! an event's kind run concurrently, and a failing or slow handler never
//! interrupts the others.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::types::{Event, EventKind};
use crate::error::MeshError;

/// Capacity of each subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;

/// Per-subscriber delivery deadline; slower subscribers are evicted.
pub const DELIVERY_DEADLINE: Duration = Duration::from_secs(1);

/// Per-handler deadline during dispatch.
pub const HANDLER_DEADLINE: Duration = Duration::from_secs(1);

/// The channel that receives every event.
pub const GLOBAL_CHANNEL: &str = "global";

/// Channel name for events about one service.
pub fn service_channel(service_name: &str) -> String {
    format!("service:{}", service_name)
}

/// Channel name for events about one workflow.
pub fn workflow_channel(workflow_id: &str) -> String {
    format!("workflow:{}", workflow_id)
}

/// Callback registered for a specific event kind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), MeshError>;
}

/// Receiving half of a subscription. Cloning yields a handle to the same
/// underlying queue, which makes `subscribe` idempotent per subscriber id.
#[derive(Clone)]
pub struct Subscription {
    subscriber_id: String,
    channel: String,
    receiver: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl Subscription {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next event. Returns `None` once the subscriber has been
    /// evicted (or the channel dropped) and the queue is drained.
    pub async fn recv(&self) -> Option<Event> {
        self.receiver.lock().await.recv().await
    }

    /// Non-blocking poll of the queue.
    pub async fn try_recv(&self) -> Option<Event> {
        self.receiver.lock().await.try_recv().ok()
    }
}

struct SubscriberSlot {
    sender: mpsc::Sender<Event>,
    /// Weak so that dropping every external [`Subscription`] closes the
    /// queue and lets publish evict the subscriber.
    receiver: Weak<Mutex<mpsc::Receiver<Event>>>,
}

/// One named pub/sub channel with its own subscriber lock.
struct Channel {
    name: String,
    subscribers: Mutex<HashMap<String, SubscriberSlot>>,
}

impl Channel {
    fn new(name: String) -> Self {
        Self {
            name,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    async fn subscribe(&self, subscriber_id: &str) -> Subscription {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(slot) = subscribers.get(subscriber_id) {
            if let Some(receiver) = slot.receiver.upgrade() {
                return Subscription {
                    subscriber_id: subscriber_id.to_string(),
                    channel: self.name.clone(),
                    receiver,
                };
            }
            // The previous subscription was dropped; fall through and
            // replace it with a fresh queue.
        }
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let receiver = Arc::new(Mutex::new(receiver));
        subscribers.insert(
            subscriber_id.to_string(),
            SubscriberSlot {
                sender,
                receiver: Arc::downgrade(&receiver),
            },
        );
        Subscription {
            subscriber_id: subscriber_id.to_string(),
            channel: self.name.clone(),
            receiver,
        }
    }

    async fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.lock().await.remove(subscriber_id);
    }

    /// Deliver `event` to every subscriber, evicting any that miss the
    /// delivery deadline or have dropped their queue.
    async fn publish(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (subscriber_id, slot) in subscribers.iter() {
            let send = slot.sender.send(event.clone());
            match tokio::time::timeout(DELIVERY_DEADLINE, send).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => dead.push(subscriber_id.clone()),
            }
        }
        for subscriber_id in dead {
            tracing::warn!(
                channel = %self.name,
                subscriber = %subscriber_id,
                "evicting slow or dead subscriber"
            );
            subscribers.remove(&subscriber_id);
        }
    }

    async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

/// Central event bus: named channels plus a kind-keyed handler table.
pub struct EventBus {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    async fn channel(&self, name: &str) -> Arc<Channel> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(name.to_string())))
            .clone()
    }

    /// Subscribe to a named channel. Idempotent: repeating a subscriber id
    /// returns a handle to the existing queue.
    pub async fn subscribe(&self, channel_name: &str, subscriber_id: &str) -> Subscription {
        self.channel(channel_name).await.subscribe(subscriber_id).await
    }

    pub async fn unsubscribe(&self, channel_name: &str, subscriber_id: &str) {
        if let Some(channel) = self.channels.lock().await.get(channel_name).cloned() {
            channel.unsubscribe(subscriber_id).await;
        }
    }

    /// Publish to one named channel.
    pub async fn publish(&self, channel_name: &str, event: &Event) {
        self.channel(channel_name).await.publish(event).await;
    }

    /// Register a handler for one event kind.
    pub async fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.entry(kind).or_default().push(handler);
    }

    /// Invoke every handler registered for the event's kind, concurrently.
    /// Handler errors and timeouts are logged and swallowed.
    pub async fn dispatch(&self, event: &Event) {
        let handlers = {
            let table = self.handlers.read().await;
            match table.get(&event.kind()) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };
        let kind = event.kind();
        let invocations = handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move {
                match tokio::time::timeout(HANDLER_DEADLINE, handler.handle(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(kind = %kind, error = %err, "event handler failed");
                    }
                    Err(_) => {
                        tracing::warn!(kind = %kind, "event handler exceeded deadline");
                    }
                }
            }
        });
        join_all(invocations).await;
    }

    /// Full fan-out for one appended event: handler dispatch, then the
    /// `global` channel, then the service and workflow channels when those
    /// fields are present.
    pub async fn fan_out(&self, event: &Event) {
        self.dispatch(event).await;
        self.publish(GLOBAL_CHANNEL, event).await;
        if let Some(service) = event.service_name() {
            self.publish(&service_channel(service), event).await;
        }
        if let Some(workflow) = event.workflow_id() {
            self.publish(&workflow_channel(workflow), event).await;
        }
    }

    pub async fn subscriber_count(&self, channel_name: &str) -> usize {
        match self.channels.lock().await.get(channel_name).cloned() {
            Some(channel) => channel.subscriber_count().await,
            None => 0,
        }
    }
}
