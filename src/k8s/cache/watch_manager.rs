/**
 * K8s Watch Stream Manager
 *
 * Keeps one live watch per (namespace, resource type), restarts it after a
 * fixed backoff whenever the stream ends or fails, and fans every event out
 * to a shared bounded queue and to the callbacks registered for its key.
 */
use super::config::CacheConfig;
use super::subscription::{Subscription, WatchCallback, WatchEvent, WatchKey};
use crate::error::{Error, Result};
use crate::k8s::api::{ClusterClient, EventStream};
use crate::k8s::resource::Resource;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives watch failures. Never sees errors that reach callers.
pub type ErrorHandler = Arc<dyn Fn(&WatchKey, &Error) + Send + Sync>;

/// Lifecycle of one watch key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Starting,
    Active,
    Restarting,
    Stopped,
}

struct WatchEntry {
    status: WatchStatus,
    generation: u64,
    subscribers: Vec<Subscription>,
    task: Option<JoinHandle<()>>,
    restarts: u64,
    events: u64,
}

impl WatchEntry {
    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        for sub in &self.subscribers {
            sub.abort();
        }
        self.subscribers.clear();
        self.status = WatchStatus::Stopped;
    }
}

enum StreamOutcome {
    Cancelled,
    Ended,
    Failed(Error),
}

struct Shared {
    client: Arc<dyn ClusterClient>,
    registry: Mutex<HashMap<WatchKey, WatchEntry>>,
    event_tx: mpsc::Sender<WatchEvent>,
    subscriber_capacity: usize,
    error_handler: RwLock<ErrorHandler>,
    backoff: Duration,
    enabled: bool,
    cancel: CancellationToken,
    stopped: AtomicBool,
    next_generation: AtomicU64,
    events_received: AtomicU64,
    events_dropped: AtomicU64,
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|key: &WatchKey, err: &Error| {
        warn!("⚠️  Watch {} failed: {}", key, err);
    })
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, HashMap<WatchKey, WatchEntry>> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            error!("❌ Watch registry lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn report(&self, key: &WatchKey, err: &Error) {
        let handler = self
            .error_handler
            .read()
            .map_or_else(|_| default_error_handler(), |h| h.clone());
        handler(key, err);
    }

    /// Update the status of `key` if it still belongs to `generation`.
    fn set_status(&self, key: &WatchKey, generation: u64, status: WatchStatus) {
        if let Some(entry) = self.registry().get_mut(key) {
            if entry.generation == generation {
                entry.status = status;
                if status == WatchStatus::Restarting {
                    entry.restarts += 1;
                }
            }
        }
    }

    fn dispatch(&self, key: &WatchKey, event: WatchEvent) {
        self.events_received.fetch_add(1, Ordering::Relaxed);

        match self.event_tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.events_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("⚠️  Event queue full, dropped event for {} ({} dropped)", key, dropped);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("event queue closed, {} event not queued", key);
            }
        }

        let queues: Vec<_> = {
            let mut registry = self.registry();
            let Some(entry) = registry.get_mut(key) else {
                return;
            };
            entry.events += 1;
            entry.subscribers.iter().map(Subscription::queue).collect()
        };

        for queue in queues {
            queue.push(event.clone());
        }
    }

    /// Wait out the backoff. Returns false if cancelled meanwhile.
    async fn wait_backoff(&self, key: &WatchKey, generation: u64) -> bool {
        self.set_status(key, generation, WatchStatus::Restarting);
        debug!("🔁 Watch {} restarting in {}ms", key, self.backoff.as_millis());
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = sleep(self.backoff) => true,
        }
    }

    async fn consume(&self, key: &WatchKey, mut stream: EventStream) -> StreamOutcome {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };

            let outcome = match next {
                None => StreamOutcome::Cancelled,
                Some(None) => StreamOutcome::Ended,
                Some(Some(Err(e))) => StreamOutcome::Failed(e),
                Some(Some(Ok(raw))) => match Resource::from_value(raw.object) {
                    Ok(resource) => {
                        debug!("📝 {} {} {}", key, raw.event_type, resource.name());
                        self.dispatch(key, WatchEvent::new(key, raw.event_type, resource));
                        continue;
                    }
                    Err(e) => StreamOutcome::Failed(e),
                },
            };

            stream.close();
            return outcome;
        }
    }

    async fn run_watch(self: Arc<Self>, key: WatchKey, generation: u64, initial: Option<EventStream>) {
        let mut initial = initial;
        if initial.is_none() && !self.wait_backoff(&key, generation).await {
            return;
        }

        loop {
            let stream = if let Some(stream) = initial.take() {
                stream
            } else {
                self.set_status(&key, generation, WatchStatus::Starting);
                let opened = tokio::select! {
                    () = self.cancel.cancelled() => return,
                    opened = self.client.open_watch(&key.resource_type, &key.namespace) => opened,
                };
                match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.report(&key, &e);
                        if !self.wait_backoff(&key, generation).await {
                            return;
                        }
                        continue;
                    }
                }
            };

            self.set_status(&key, generation, WatchStatus::Active);
            info!("🔍 Watch {} active", key);

            match self.consume(&key, stream).await {
                StreamOutcome::Cancelled => {
                    debug!("watch {} cancelled", key);
                    return;
                }
                StreamOutcome::Ended => info!("🔍 Watch {} stream ended, restarting", key),
                StreamOutcome::Failed(e) => self.report(&key, &e),
            }

            if !self.wait_backoff(&key, generation).await {
                return;
            }
        }
    }
}

/// Counters describing the watcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchStats {
    pub registered_keys: usize,
    pub active_watchers: usize,
    pub restarting_watchers: usize,
    pub subscribers: usize,
    pub restarts: u64,
    pub events_received: u64,
    /// Events the shared queue had no room for
    pub events_dropped: u64,
    /// Events live subscribers lost to their own full queues
    pub subscriber_events_dropped: u64,
}

/// Manages K8s watch streams and their subscribers
pub struct Watcher {
    shared: Arc<Shared>,
    event_rx: Mutex<Option<mpsc::Receiver<WatchEvent>>>,
}

impl Watcher {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, config: &CacheConfig) -> Self {
        Self::with_cancellation(client, config, CancellationToken::new())
    }

    /// Create a watcher whose tasks also stop when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(
        client: Arc<dyn ClusterClient>,
        config: &CacheConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity.max(1));

        Self {
            shared: Arc::new(Shared {
                client,
                registry: Mutex::new(HashMap::new()),
                event_tx,
                subscriber_capacity: config.subscriber_queue_capacity,
                error_handler: RwLock::new(default_error_handler()),
                backoff: config.watch_backoff,
                enabled: config.watch_enabled,
                cancel,
                stopped: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
                events_received: AtomicU64::new(0),
                events_dropped: AtomicU64::new(0),
            }),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Replace the handler that receives watch failures.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        match self.shared.error_handler.write() {
            Ok(mut current) => *current = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }

    /// Take the receiving end of the shared event queue. Only the first
    /// caller gets it.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Register `callback` for every event on `(namespace, resource_type)`,
    /// opening the watch if this is the first registration for the key.
    ///
    /// The first subscribe handshake runs before this returns. Its failure
    /// goes to the error handler and the key retries after the backoff; it
    /// is never returned here.
    ///
    /// Returns the subscriber id for [`Watcher::unwatch`].
    ///
    /// # Errors
    ///
    /// Returns `Error::WatchDisabled` if watching is turned off, or
    /// `Error::WatcherStopped` after [`Watcher::stop`].
    pub async fn watch_resources(
        &self,
        namespace: &str,
        resource_type: &str,
        callback: WatchCallback,
    ) -> Result<String> {
        if !self.shared.enabled {
            return Err(Error::WatchDisabled);
        }

        let key = WatchKey::new(namespace, resource_type);
        let (id, generation) = {
            let mut registry = self.shared.registry();
            if self.is_stopped() {
                return Err(Error::WatcherStopped);
            }

            let sub = Subscription::spawn(
                key.clone(),
                callback,
                self.shared.subscriber_capacity,
                self.shared.cancel.child_token(),
            );
            let id = sub.id.clone();

            if let Some(entry) = registry.get_mut(&key) {
                entry.subscribers.push(sub);
                debug!("➕ Subscriber {} joined existing watch {}", id, key);
                return Ok(id);
            }

            let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
            registry.insert(
                key.clone(),
                WatchEntry {
                    status: WatchStatus::Starting,
                    generation,
                    subscribers: vec![sub],
                    task: None,
                    restarts: 0,
                    events: 0,
                },
            );
            (id, generation)
        };

        info!("🔍 Starting watch {}", key);
        let opened = tokio::select! {
            () = self.shared.cancel.cancelled() => return Ok(id),
            opened = self.shared.client.open_watch(&key.resource_type, &key.namespace) => opened,
        };
        let initial = match opened {
            Ok(stream) => Some(stream),
            Err(e) => {
                self.shared.report(&key, &e);
                None
            }
        };

        let task = tokio::spawn(self.shared.clone().run_watch(key.clone(), generation, initial));

        let mut registry = self.shared.registry();
        match registry.get_mut(&key) {
            Some(entry) if entry.generation == generation && !self.is_stopped() => {
                entry.task = Some(task);
            }
            _ => task.abort(),
        }
        drop(registry);

        Ok(id)
    }

    /// Remove one subscriber. The watch for its key is torn down when its
    /// last subscriber leaves. Returns whether the id was found.
    pub fn unwatch(&self, subscriber_id: &str) -> bool {
        let mut registry = self.shared.registry();

        let Some(key) = registry
            .iter()
            .find(|(_, entry)| entry.subscribers.iter().any(|s| s.id == subscriber_id))
            .map(|(key, _)| key.clone())
        else {
            return false;
        };

        let now_empty = registry.get_mut(&key).is_some_and(|entry| {
            entry.subscribers.retain(|s| s.id != subscriber_id);
            entry.subscribers.is_empty()
        });

        if now_empty {
            if let Some(mut entry) = registry.remove(&key) {
                entry.shutdown();
            }
            info!("🛑 Watch {} closed, no subscribers left", key);
        }
        true
    }

    /// Tear down every watch and clear all registrations. Terminal and
    /// idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();

        let mut registry = self.shared.registry();
        let count = registry.len();
        for entry in registry.values_mut() {
            entry.shutdown();
        }
        registry.clear();
        drop(registry);

        info!("🛑 Watcher stopped ({} watches torn down)", count);
    }

    /// Status of one key; `None` means it is not watched.
    #[must_use]
    pub fn status(&self, namespace: &str, resource_type: &str) -> Option<WatchStatus> {
        if self.is_stopped() {
            return Some(WatchStatus::Stopped);
        }
        self.shared
            .registry()
            .get(&WatchKey::new(namespace, resource_type))
            .map(|entry| entry.status)
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<(WatchKey, WatchStatus)> {
        let mut all: Vec<_> = self
            .shared
            .registry()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.status))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// # Errors
    ///
    /// Returns `Error::Unhealthy` if watching is disabled, the watcher is
    /// stopped, or watches are registered but none is active.
    pub fn health_check(&self) -> Result<()> {
        if !self.shared.enabled {
            return Err(Error::Unhealthy("watching is disabled".to_string()));
        }
        if self.is_stopped() {
            return Err(Error::Unhealthy("watcher is stopped".to_string()));
        }

        let stats = self.stats();
        if stats.registered_keys > 0 && stats.active_watchers == 0 {
            return Err(Error::Unhealthy(format!(
                "none of {} watches is active",
                stats.registered_keys
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> WatchStats {
        let registry = self.shared.registry();
        let mut stats = WatchStats {
            registered_keys: registry.len(),
            events_received: self.shared.events_received.load(Ordering::Relaxed),
            events_dropped: self.shared.events_dropped.load(Ordering::Relaxed),
            ..WatchStats::default()
        };
        for entry in registry.values() {
            match entry.status {
                WatchStatus::Active => stats.active_watchers += 1,
                WatchStatus::Restarting => stats.restarting_watchers += 1,
                WatchStatus::Starting | WatchStatus::Stopped => {}
            }
            stats.subscribers += entry.subscribers.len();
            stats.subscriber_events_dropped += entry
                .subscribers
                .iter()
                .map(Subscription::dropped)
                .sum::<u64>();
            stats.restarts += entry.restarts;
        }
        drop(registry);
        stats
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("enabled", &self.shared.enabled)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
