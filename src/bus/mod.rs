//! Pub/sub message bus for live session streaming.
//!
//! Thin facade over an in-process broker: a registry of named channels,
//! each backed by a `tokio::sync::broadcast` sender. Delivery is
//! best-effort at-most-once with no replay for late subscribers; the
//! durable record is the session's JSONL log, never the bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::error::{RelayError, Result};

/// One delivered bus message, tagged with the channel it arrived on.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub channel: String,
    pub payload: Value,
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    channels: DashMap<String, broadcast::Sender<Value>>,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                channels: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    /// Channel carrying every recorded message of a session.
    pub fn messages_channel(&self, session_id: &str) -> String {
        format!("{}:session:{}:messages", self.namespace(), session_id)
    }

    /// Channel carrying system events such as `sub_instance_started`.
    pub fn system_channel(&self, session_id: &str) -> String {
        format!("{}:session:{}:system", self.namespace(), session_id)
    }

    /// Channel carrying `started` / `finalized` lifecycle events.
    pub fn lifecycle_channel(&self, session_id: &str) -> String {
        format!("{}:session:{}:lifecycle", self.namespace(), session_id)
    }

    /// Publish a payload to a channel. Returns whether the payload was
    /// handed to the broker; a shut-down bus or an absence of subscribers
    /// is not an error and never propagates to the caller.
    pub fn publish(&self, channel: &str, payload: Value) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!(channel, "Dropping publish on shut-down bus");
            return false;
        }

        let sender = self.sender_for(channel);
        // A send error only means nobody is listening right now.
        let delivered = sender.send(payload).is_ok();
        debug!(channel, delivered, "Published bus message");
        true
    }

    /// Subscribe to one or more channels, merged into a single stream.
    /// Fails when the bus is already shut down.
    pub fn subscribe(&self, channels: &[String]) -> Result<BusSubscription> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelayError::Bus("message bus is shut down".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(channels.len());

        for channel in channels {
            let mut receiver = self.sender_for(channel).subscribe();
            let channel = channel.clone();
            let tx = tx.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => {
                            let event = BusEvent {
                                channel: channel.clone(),
                                payload,
                            };
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(channel = %channel, skipped, "Bus subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        Ok(BusSubscription { rx, tasks })
    }

    /// Shut down the broker: every channel closes and subscribers drain to
    /// end-of-stream. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.channels.clear();
        debug!("Message bus shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Value> {
        if let Some(sender) = self.inner.channels.get(channel) {
            return sender.clone();
        }

        let entry = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.config.channel_capacity).0);
        let sender = entry.clone();
        drop(entry);

        let count = self.inner.channels.len();
        if count == self.inner.config.max_channels {
            warn!(
                channels = count,
                "Bus channel count reached configured maximum"
            );
        }
        sender
    }
}

/// A live subscription over one or more channels. Events within a single
/// channel arrive in publication order; no ordering holds across channels.
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<BusEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusSubscription {
    /// Receive the next event. `None` means every subscribed channel has
    /// closed (bus shutdown).
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_bus() -> MessageBus {
        MessageBus::new(BusConfig::default())
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = test_bus();
        let channel = bus.messages_channel("s1");
        let mut sub = bus.subscribe(std::slice::from_ref(&channel)).unwrap();

        assert!(bus.publish(&channel, json!({"message_type": "UserMessage"})));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.channel, channel);
        assert_eq!(event.payload["message_type"], "UserMessage");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = test_bus();
        assert!(bus.publish(&bus.messages_channel("nobody"), json!({})));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_history() {
        let bus = test_bus();
        let channel = bus.messages_channel("s1");
        bus.publish(&channel, json!({"seq": 0}));

        let mut sub = bus.subscribe(std::slice::from_ref(&channel)).unwrap();
        bus.publish(&channel, json!({"seq": 1}));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload["seq"], 1);
    }

    #[tokio::test]
    async fn test_multi_channel_merge() {
        let bus = test_bus();
        let messages = bus.messages_channel("s1");
        let system = bus.system_channel("s1");
        let mut sub = bus
            .subscribe(&[messages.clone(), system.clone()])
            .unwrap();

        bus.publish(&system, json!({"subtype": "sub_instance_started"}));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.channel, system);
    }

    #[tokio::test]
    async fn test_channel_ordering() {
        let bus = test_bus();
        let channel = bus.messages_channel("s1");
        let mut sub = bus.subscribe(std::slice::from_ref(&channel)).unwrap();

        for i in 0..20 {
            bus.publish(&channel, json!({"seq": i}));
        }
        for i in 0..20 {
            assert_eq!(sub.recv().await.unwrap().payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_shutdown_terminates_subscribers() {
        let bus = test_bus();
        let channel = bus.messages_channel("s1");
        let mut sub = bus.subscribe(std::slice::from_ref(&channel)).unwrap();

        bus.shutdown();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_subscriptions() {
        let bus = test_bus();
        bus.shutdown();
        bus.shutdown();

        assert!(!bus.publish(&bus.messages_channel("s1"), json!({})));
        assert!(bus.subscribe(&[bus.messages_channel("s1")]).is_err());
    }
}
