//! Channel-based pub/sub transport decoupling producers from consumers.
//!
//! Each subscription owns an unbounded `mpsc` queue drained by one
//! long-lived listener task, so publishing never blocks on callback
//! completion and per-channel publish order is preserved per producer.
//! Delivery is at-least-once, fire-and-forget broadcast: `publish`
//! reports acceptance by the transport, not processing by any consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::ServiceMessage;

/// An asynchronous callback invoked once per message received on a
/// subscribed channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Errors (and panics) are logged by the listener loop and never
    /// terminate it.
    async fn handle(
        &self,
        message: ServiceMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Adapter implementing [`MessageHandler`] for async closures, used by
/// capability-service stubs and tests.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ServiceMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send,
{
    async fn handle(
        &self,
        message: ServiceMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (self.0)(message).await
    }
}

/// Opaque handle returned by [`MessageBroker::subscribe`], used to
/// unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// In-process pub/sub broker with named channels.
///
/// Constructed once at process start and shared by `Arc`; fresh
/// instances make unit tests hermetic.
pub struct MessageBroker {
    /// Per-channel list of subscriber queue senders.
    channels: DashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<ServiceMessage>)>>,
    /// Listener tasks, awaited on `stop` so in-flight dispatch drains.
    listeners: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl MessageBroker {
    /// Create a stopped broker. Call [`start`](Self::start) before
    /// publishing.
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            listeners: tokio::sync::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Accept publishes.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("message broker started");
    }

    /// Whether the broker currently accepts publishes.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting publishes and wait for all listener loops to drain
    /// their queues and exit.
    ///
    /// Dropping the queue senders lets each listener consume whatever is
    /// already enqueued before its `recv` returns `None`.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.channels.clear();
        let listeners = std::mem::take(&mut *self.listeners.lock().await);
        for handle in listeners {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "broker listener task failed to join");
            }
        }
        tracing::info!("message broker stopped");
    }

    /// Register an asynchronous callback for a channel.
    ///
    /// Spawns one listener task per subscription. The callback is invoked
    /// once per received message, in publish order; callback errors and
    /// panics are logged and never terminate the loop. The returned id
    /// can be passed to [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        channel: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionId {
        let channel = channel.into();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<ServiceMessage>();
        self.channels.entry(channel.clone()).or_default().push((id, tx));

        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let message_id = message.message_id;
                let result = std::panic::AssertUnwindSafe(handler.handle(message))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            channel = %channel,
                            message_id = %message_id,
                            error = %e,
                            "message callback failed"
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            channel = %channel,
                            message_id = %message_id,
                            "message callback panicked"
                        );
                    }
                }
            }
            tracing::debug!(channel = %channel, "listener loop drained");
        });
        self.listeners.lock().await.push(task);
        id
    }

    /// Remove one subscription. Its queue sender is dropped, so the
    /// listener loop drains whatever is already enqueued and exits.
    /// Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Publish a message to every current subscriber of a channel.
    ///
    /// Returns `true` if the transport accepted the message (the broker
    /// is running); this is not a guarantee any subscriber processed it.
    /// A channel with no subscribers accepts and drops the message.
    pub fn publish(&self, channel: &str, message: ServiceMessage) -> bool {
        if !self.is_running() {
            tracing::warn!(channel, "publish rejected: broker not running");
            return false;
        }

        let mut delivered = 0usize;
        if let Some(mut senders) = self.channels.get_mut(channel) {
            senders.retain(|(_, tx)| !tx.is_closed());
            for (_, tx) in senders.iter() {
                if tx.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        tracing::debug!(
            channel,
            message_id = %message.message_id,
            message_type = ?message.message_type,
            delivered,
            "message published"
        );
        true
    }
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Collects received message ids behind a lock, for assertions.
    struct Collector {
        received: Mutex<Vec<uuid::Uuid>>,
        notify: tokio::sync::Notify,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        async fn wait_for(&self, count: usize) {
            for _ in 0..200 {
                if self.received.lock().expect("lock poisoned").len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {count} messages, got {:?}", self.received.lock());
        }
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(
            &self,
            message: ServiceMessage,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.received.lock().expect("lock poisoned").push(message.message_id);
            self.notify.notify_one();
            Ok(())
        }
    }

    fn sample_message() -> ServiceMessage {
        ServiceMessage::new(MessageType::SystemEvent, "test", json!({}))
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let broker = MessageBroker::new();
        broker.start();
        let a = Collector::new();
        let b = Collector::new();
        let c = Collector::new();
        broker.subscribe("events", a.clone() as Arc<dyn MessageHandler>).await;
        broker.subscribe("events", b.clone() as Arc<dyn MessageHandler>).await;
        broker.subscribe("events", c.clone() as Arc<dyn MessageHandler>).await;

        let message = sample_message();
        assert!(broker.publish("events", message.clone()));

        a.wait_for(1).await;
        b.wait_for(1).await;
        c.wait_for(1).await;
        assert_eq!(a.received.lock().expect("lock poisoned")[0], message.message_id);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_for_that_subscription_only() {
        let broker = MessageBroker::new();
        broker.start();
        let kept = Collector::new();
        let dropped = Collector::new();
        broker.subscribe("events", kept.clone() as Arc<dyn MessageHandler>).await;
        let id = broker
            .subscribe("events", dropped.clone() as Arc<dyn MessageHandler>)
            .await;

        broker.publish("events", sample_message());
        kept.wait_for(1).await;
        dropped.wait_for(1).await;

        broker.unsubscribe(id);
        broker.publish("events", sample_message());

        kept.wait_for(2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dropped.received.lock().expect("lock poisoned").len(), 1);
    }

    #[tokio::test]
    async fn publish_while_stopped_is_rejected() {
        let broker = MessageBroker::new();
        assert!(!broker.publish("events", sample_message()));
        broker.start();
        assert!(broker.publish("events", sample_message()));
    }

    #[tokio::test]
    async fn publish_preserves_per_channel_order() {
        let broker = MessageBroker::new();
        broker.start();
        let collector = Collector::new();
        broker
            .subscribe("ordered", collector.clone() as Arc<dyn MessageHandler>)
            .await;

        let messages: Vec<ServiceMessage> = (0..10).map(|_| sample_message()).collect();
        for message in &messages {
            broker.publish("ordered", message.clone());
        }

        collector.wait_for(10).await;
        let received = collector.received.lock().expect("lock poisoned");
        let expected: Vec<_> = messages.iter().map(|m| m.message_id).collect();
        assert_eq!(*received, expected);
    }

    #[tokio::test]
    async fn failing_callback_does_not_terminate_the_loop() {
        let broker = MessageBroker::new();
        broker.start();

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handler = Arc::new(FnHandler(move |_msg: ServiceMessage| {
            let seen = seen_clone.clone();
            async move {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    return Err("first message rejected".into());
                }
                Ok(())
            }
        }));
        broker.subscribe("flaky", handler as Arc<dyn MessageHandler>).await;

        broker.publish("flaky", sample_message());
        broker.publish("flaky", sample_message());

        for _ in 0..200 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_drains_in_flight_messages() {
        let broker = MessageBroker::new();
        broker.start();
        let collector = Collector::new();
        broker
            .subscribe("drain", collector.clone() as Arc<dyn MessageHandler>)
            .await;

        for _ in 0..5 {
            broker.publish("drain", sample_message());
        }
        broker.stop().await;

        // All five were enqueued before stop; the listener drains them
        // before its task joins.
        assert_eq!(collector.received.lock().expect("lock poisoned").len(), 5);
        assert!(!broker.publish("drain", sample_message()));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let broker = MessageBroker::new();
        broker.start();
        let nlp = Collector::new();
        let vision = Collector::new();
        broker.subscribe("ai.nlp", nlp.clone() as Arc<dyn MessageHandler>).await;
        broker
            .subscribe("ai.vision", vision.clone() as Arc<dyn MessageHandler>)
            .await;

        broker.publish("ai.nlp", sample_message());

        nlp.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(vision.received.lock().expect("lock poisoned").is_empty());
    }
}
