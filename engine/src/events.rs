//! Collection events and asynchronous listener dispatch.
//!
//! The [`EventBus`] owns a small tokio runtime. Every subscription gets its
//! own unbounded channel drained by one task, so a listener sees events in
//! the order they were published and a slow listener never blocks a write.

use crate::error::Result;
use crate::{CollectionName, Document, Timestamp};
use dashmap::DashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Insert,
    Update,
    Remove,
    IndexStart,
    IndexEnd,
}

/// Who caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Replicator,
}

/// A change notification for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEvent {
    pub collection: CollectionName,
    pub kind: EventKind,
    /// The document after the change; the removed document for removals.
    pub document: Option<Document>,
    /// Indexed field, for index events.
    pub field: Option<String>,
    pub timestamp: Timestamp,
    pub originator: Origin,
}

/// Receives collection events.
///
/// Errors and panics are logged and otherwise ignored.
pub trait CollectionEventListener: Send + Sync + 'static {
    fn on_event(&self, event: &CollectionEvent) -> Result<()>;
}

impl<F> CollectionEventListener for F
where
    F: Fn(&CollectionEvent) -> Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, event: &CollectionEvent) -> Result<()> {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Subscriber {
    collection: CollectionName,
    sender: mpsc::UnboundedSender<CollectionEvent>,
    task: JoinHandle<()>,
}

/// Dispatches collection events to listeners on a dedicated runtime.
pub struct EventBus {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    subscribers: DashMap<String, Subscriber>,
}

impl EventBus {
    pub fn new(workers: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("saltpeter-events")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            subscribers: DashMap::new(),
        })
    }

    /// Register a listener for one collection.
    pub fn subscribe(
        &self,
        collection: &str,
        listener: Arc<dyn CollectionEventListener>,
    ) -> SubscriptionId {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, mut receiver) = mpsc::unbounded_channel::<CollectionEvent>();

        let subscription = id.clone();
        let task = self.handle.spawn(async move {
            while let Some(event) = receiver.recv().await {
                match catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(
                            subscription = %subscription,
                            collection = %event.collection,
                            "Listener failed: {}",
                            err
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            subscription = %subscription,
                            collection = %event.collection,
                            "Listener panicked"
                        );
                    }
                }
            }
        });

        self.subscribers.insert(
            id.clone(),
            Subscriber {
                collection: collection.to_string(),
                sender,
                task,
            },
        );
        tracing::debug!(subscription = %id, collection = %collection, "Listener subscribed");
        SubscriptionId(id)
    }

    /// Remove a listener. Events already queued are still delivered.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.subscribers.remove(&id.0).is_some();
        if removed {
            tracing::debug!(subscription = %id, "Listener unsubscribed");
        }
        removed
    }

    /// Remove every listener of a collection.
    pub fn unsubscribe_collection(&self, collection: &str) {
        self.subscribers
            .retain(|_, subscriber| subscriber.collection != collection);
    }

    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| entry.value().collection == collection)
            .count()
    }

    /// Queue an event for every listener of its collection.
    pub fn publish(&self, event: CollectionEvent) {
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.collection == event.collection {
                // A closed channel means the subscriber is being removed.
                let _ = subscriber.sender.send(event.clone());
            }
        }
    }

    /// Run blocking work on the event runtime's blocking pool.
    pub fn spawn_blocking<F, T>(&self, work: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn_blocking(work)
    }

    /// Stop accepting events, let listeners drain their queues, then stop the
    /// runtime. Safe to call more than once.
    pub fn shutdown(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(runtime) = runtime else {
            return;
        };

        let keys: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        let tasks: Vec<JoinHandle<()>> = keys
            .iter()
            .filter_map(|key| self.subscribers.remove(key))
            .map(|(_, subscriber)| subscriber.task)
            .collect();

        if Handle::try_current().is_ok() {
            // Blocking here would stall the caller's runtime.
            runtime.shutdown_background();
            return;
        }

        runtime.block_on(async {
            for task in tasks {
                let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
            }
        });
        runtime.shutdown_timeout(Duration::from_secs(1));
        tracing::debug!("Event bus stopped");
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::mpsc as std_mpsc;

    fn event(collection: &str, kind: EventKind) -> CollectionEvent {
        CollectionEvent {
            collection: collection.to_string(),
            kind,
            document: None,
            field: None,
            timestamp: 0,
            originator: Origin::Local,
        }
    }

    #[test]
    fn delivers_in_order_per_listener() {
        let bus = EventBus::new(1).unwrap();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        bus.subscribe(
            "users",
            Arc::new(move |e: &CollectionEvent| {
                tx.lock().unwrap().send(e.kind).unwrap();
                Ok(())
            }),
        );

        bus.publish(event("users", EventKind::Insert));
        bus.publish(event("orders", EventKind::Insert));
        bus.publish(event("users", EventKind::Update));
        bus.publish(event("users", EventKind::Remove));

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), EventKind::Insert);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), EventKind::Update);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), EventKind::Remove);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn failing_listener_keeps_receiving() {
        let bus = EventBus::new(1).unwrap();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        bus.subscribe(
            "users",
            Arc::new(move |e: &CollectionEvent| {
                tx.lock().unwrap().send(e.kind).unwrap();
                match e.kind {
                    EventKind::Insert => Err(Error::Validation("boom".into())),
                    EventKind::Update => panic!("listener panic"),
                    _ => Ok(()),
                }
            }),
        );

        bus.publish(event("users", EventKind::Insert));
        bus.publish(event("users", EventKind::Update));
        bus.publish(event("users", EventKind::Remove));

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), EventKind::Insert);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), EventKind::Update);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), EventKind::Remove);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(1).unwrap();
        let id = bus.subscribe("users", Arc::new(|_: &CollectionEvent| Ok(())));
        assert_eq!(bus.subscriber_count("users"), 1);
        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
        assert_eq!(bus.subscriber_count("users"), 0);
    }

    #[test]
    fn shutdown_drains_queued_events() {
        let bus = EventBus::new(1).unwrap();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        bus.subscribe(
            "users",
            Arc::new(move |_: &CollectionEvent| {
                std::thread::sleep(Duration::from_millis(10));
                tx.lock().unwrap().send(()).unwrap();
                Ok(())
            }),
        );
        for _ in 0..5 {
            bus.publish(event("users", EventKind::Insert));
        }
        bus.shutdown();
        assert_eq!(rx.try_iter().count(), 5);
        bus.shutdown();
    }

    #[test]
    fn spawn_blocking_runs_work() {
        let bus = EventBus::new(1).unwrap();
        let (tx, rx) = std_mpsc::channel();
        bus.spawn_blocking(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
