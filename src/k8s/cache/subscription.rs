use crate::k8s::api::WatchEventType;
use crate::k8s::resource::Resource;
use chrono::{DateTime, Utc};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Identifies one watch subscription: a resource type within a namespace.
/// An empty namespace means all namespaces (or a cluster-scoped type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey {
    pub namespace: String,
    pub resource_type: String,
}

impl WatchKey {
    pub fn new(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl std::fmt::Display for WatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "*/{}", self.resource_type)
        } else {
            write!(f, "{}/{}", self.namespace, self.resource_type)
        }
    }
}

/// A decoded change notification. Consumed once by the invalidation loop
/// and once by each subscriber of its key; never stored.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub resource_type: String,
    /// Namespace of the watch that produced the event
    pub namespace: String,
    pub resource: Arc<Resource>,
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    #[must_use]
    pub fn new(key: &WatchKey, event_type: WatchEventType, resource: Resource) -> Self {
        Self {
            event_type,
            resource_type: key.resource_type.clone(),
            namespace: key.namespace.clone(),
            resource: Arc::new(resource),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> WatchKey {
        WatchKey::new(self.namespace.clone(), self.resource_type.clone())
    }
}

pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Sending half of one subscriber's bounded queue
#[derive(Clone)]
pub(crate) struct SubscriberQueue {
    id: Arc<str>,
    sender: mpsc::Sender<WatchEvent>,
    dropped: Arc<AtomicU64>,
}

impl SubscriberQueue {
    /// Queue without waiting. A full queue drops the event and counts it.
    pub(crate) fn push(&self, event: WatchEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "⚠️  Subscriber {} is behind, dropped {} event for {} ({} dropped)",
                    self.id,
                    event.event_type,
                    event.key(),
                    dropped
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// One registered callback.
///
/// Events are queued on a bounded channel and drained by a dedicated task,
/// so the watch loop never waits on the callback and each callback sees its
/// key's events in receipt order. A callback that falls a full queue behind
/// loses the overflow.
pub struct Subscription {
    pub id: String,
    pub key: WatchKey,
    queue: SubscriberQueue,
    task: JoinHandle<()>,
}

impl Subscription {
    #[must_use]
    pub fn spawn(
        key: WatchKey,
        callback: WatchCallback,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<WatchEvent>(capacity.max(1));
        let id = Uuid::new_v4().to_string();

        let task_id = id.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => None,
                    event = receiver.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };

                let cb = callback.clone();
                if std::panic::catch_unwind(AssertUnwindSafe(move || cb(event))).is_err() {
                    error!("❌ Watch subscriber {} panicked while handling an event", task_id);
                }
            }
            debug!("subscriber {} finished", task_id);
        });

        Self {
            queue: SubscriberQueue {
                id: Arc::from(id.as_str()),
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            id,
            key,
            task,
        }
    }

    /// Queue `event` for this subscriber. Returns false if the queue is full
    /// or the subscriber has already shut down.
    pub fn deliver(&self, event: WatchEvent) -> bool {
        self.queue.push(event)
    }

    /// Events this subscriber lost to a full queue
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn queue(&self) -> SubscriberQueue {
        self.queue.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::resource::{Bag, ResourceMeta};
    use std::sync::Mutex;
    use std::time::Duration;

    fn pod_event(key: &WatchKey, name: &str) -> WatchEvent {
        let pod = Resource::new("Pod", "v1", ResourceMeta::new(name, "default"), Bag::new(), Bag::new());
        WatchEvent::new(key, WatchEventType::Modified, pod)
    }

    #[test]
    fn test_watch_key_display_and_ordering() {
        let a = WatchKey::new("default", "pods");
        let b = WatchKey::new("", "nodes");
        assert_eq!(a.to_string(), "default/pods");
        assert_eq!(b.to_string(), "*/nodes");
        assert!(b < a);
        // a separator inside a field does not collide with another key
        assert_ne!(WatchKey::new("a:b", "c"), WatchKey::new("a", "b:c"));
    }

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let key = WatchKey::new("default", "pods");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: WatchCallback = Arc::new(move |ev: WatchEvent| {
            sink.lock().unwrap().push(ev.resource.name().to_string());
        });

        let sub = Subscription::spawn(key.clone(), callback, 16, CancellationToken::new());
        for name in ["a", "b", "c"] {
            assert!(sub.deliver(pod_event(&key, name)));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_panicking_callback_keeps_running() {
        let key = WatchKey::new("default", "pods");
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let callback: WatchCallback = Arc::new(move |ev: WatchEvent| {
            *counter.lock().unwrap() += 1;
            assert_ne!(ev.resource.name(), "boom", "callback failure");
        });

        let sub = Subscription::spawn(key.clone(), callback, 16, CancellationToken::new());
        sub.deliver(pod_event(&key, "boom"));
        sub.deliver(pod_event(&key, "fine"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_callback_drops_overflow() {
        let key = WatchKey::new("default", "pods");
        let gate = Arc::new(std::sync::Barrier::new(2));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (wait, sink) = (gate.clone(), seen.clone());
        let callback: WatchCallback = Arc::new(move |ev: WatchEvent| {
            if ev.resource.name() == "first" {
                wait.wait();
            }
            sink.lock().unwrap().push(ev.resource.name().to_string());
        });

        let sub = Subscription::spawn(key.clone(), callback, 2, CancellationToken::new());
        assert!(sub.deliver(pod_event(&key, "first")));
        // the callback is now blocked on "first", so the queue holds two more
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.deliver(pod_event(&key, "a")));
        assert!(sub.deliver(pod_event(&key, "b")));
        assert!(!sub.deliver(pod_event(&key, "c")));
        assert!(!sub.deliver(pod_event(&key, "d")));
        assert_eq!(sub.dropped(), 2);

        gate.wait();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "a", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_subscriber() {
        let key = WatchKey::new("default", "pods");
        let cancel = CancellationToken::new();
        let callback: WatchCallback = Arc::new(|_: WatchEvent| {});
        let sub = Subscription::spawn(key.clone(), callback, 16, cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sub.deliver(pod_event(&key, "late")));
    }
}
