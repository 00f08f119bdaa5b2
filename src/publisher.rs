//! In-process event fan-out: append to the store, then notify subscribers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::AppendError;
use crate::event::LearningEvent;
use crate::store::{AppendOutcome, EventStore};

/// A handler notified of every event published through an [`EventPublisher`].
///
/// Handlers run synchronously inside `publish` after the event has been
/// appended, so they must be fast; anything slow should hand the event
/// off to its own task. Handlers must be idempotent with respect to
/// redelivery of the same `event_id`.
pub trait EventSubscriber: Send + Sync {
    /// Stable name used in log lines when the handler fails.
    fn name(&self) -> &str;

    /// Handle one persisted event.
    ///
    /// # Errors
    ///
    /// Errors are logged and isolated; they never affect other
    /// subscribers or the durability of the already-appended event.
    fn handle(&self, event: &LearningEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Opaque id returned by [`EventPublisher::subscribe`], used to
/// unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// Appends events to the store and fans them out to registered
/// subscribers.
///
/// The append happens first: by the time a subscriber sees an event it
/// is already durable, so a failing subscriber cannot roll it back.
pub struct EventPublisher {
    store: Arc<EventStore>,
    subscribers: RwLock<BTreeMap<SubscriberId, Arc<dyn EventSubscriber>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EventPublisher {
    /// Create a publisher over the given store.
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Register a subscriber for the lifetime of the publisher (or until
    /// [`unsubscribe`](Self::unsubscribe) is called with the returned id).
    pub async fn subscribe(&self, handler: Arc<dyn EventSubscriber>) -> SubscriberId {
        let id = SubscriberId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        self.subscribers.write().await.insert(id, handler);
        id
    }

    /// Remove a previously registered subscriber. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().await.remove(&id);
    }

    /// Append the event, then notify every registered subscriber.
    ///
    /// Subscriber panics and errors are caught and logged individually;
    /// one failing subscriber does not prevent the others from receiving
    /// the event. Duplicate appends still fan out (at-least-once), which
    /// is why subscribers must dedupe on `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError`] only when the append itself fails (journal
    /// I/O); subscriber failures are never propagated.
    pub async fn publish(&self, event: LearningEvent) -> Result<AppendOutcome, AppendError> {
        let outcome = self.store.append(event.clone()).await?;

        let subscribers: Vec<Arc<dyn EventSubscriber>> =
            self.subscribers.read().await.values().cloned().collect();
        for subscriber in subscribers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber.handle(&event)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        event_id = %event.event_id,
                        error = %e,
                        "event subscriber failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        subscriber = subscriber.name(),
                        event_id = %event.event_id,
                        "event subscriber panicked"
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// The store this publisher appends to.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts the events it receives; optionally fails or panics first.
    struct Recorder {
        name: &'static str,
        seen: AtomicU64,
        mode: Mode,
    }

    enum Mode {
        Ok,
        Fail,
        Panic,
    }

    impl Recorder {
        fn new(name: &'static str, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: AtomicU64::new(0),
                mode,
            })
        }
    }

    impl EventSubscriber for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn handle(
            &self,
            _event: &LearningEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Ok => Ok(()),
                Mode::Fail => Err("handler refused the event".into()),
                Mode::Panic => panic!("handler panicked"),
            }
        }
    }

    fn sample_event() -> LearningEvent {
        LearningEvent::new(
            EventType::InteractionRecorded,
            "learner-1",
            "session-1",
            json!({"kind": "click"}),
        )
    }

    #[tokio::test]
    async fn publish_appends_then_notifies_all_subscribers() {
        let store = Arc::new(EventStore::new());
        let publisher = EventPublisher::new(store.clone());
        let a = Recorder::new("a", Mode::Ok);
        let b = Recorder::new("b", Mode::Ok);
        publisher.subscribe(a.clone()).await;
        publisher.subscribe(b.clone()).await;

        publisher
            .publish(sample_event())
            .await
            .expect("publish should succeed");

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.query("learner-1").await.len(), 1);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others_or_the_append() {
        let store = Arc::new(EventStore::new());
        let publisher = EventPublisher::new(store.clone());
        let failing = Recorder::new("failing", Mode::Fail);
        let panicking = Recorder::new("panicking", Mode::Panic);
        let healthy = Recorder::new("healthy", Mode::Ok);
        publisher.subscribe(failing).await;
        publisher.subscribe(panicking).await;
        publisher.subscribe(healthy.clone()).await;

        let outcome = publisher
            .publish(sample_event())
            .await
            .expect("publish should succeed despite subscriber failures");

        assert!(!outcome.duplicate);
        assert_eq!(healthy.seen.load(Ordering::SeqCst), 1);
        // The event is durable regardless of subscriber failures.
        assert_eq!(store.query("learner-1").await.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let store = Arc::new(EventStore::new());
        let publisher = EventPublisher::new(store);
        let recorder = Recorder::new("recorder", Mode::Ok);
        let id = publisher.subscribe(recorder.clone()).await;

        publisher
            .publish(sample_event())
            .await
            .expect("publish should succeed");
        publisher.unsubscribe(id).await;
        publisher
            .publish(sample_event())
            .await
            .expect("publish should succeed");

        assert_eq!(recorder.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_publish_stores_once_but_redelivers() {
        let store = Arc::new(EventStore::new());
        let publisher = EventPublisher::new(store.clone());
        let recorder = Recorder::new("recorder", Mode::Ok);
        publisher.subscribe(recorder.clone()).await;

        let event = sample_event();
        publisher
            .publish(event.clone())
            .await
            .expect("publish should succeed");
        let second = publisher
            .publish(event)
            .await
            .expect("publish should succeed");

        assert!(second.duplicate);
        assert_eq!(store.query("learner-1").await.len(), 1);
        // At-least-once: subscribers see the redelivery and must dedupe.
        assert_eq!(recorder.seen.load(Ordering::SeqCst), 2);
    }
}
