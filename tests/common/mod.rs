#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::serde_json::{Value, json};
use navicache::k8s::api::{ClusterClient, EventStream, RawWatchEvent, WatchEventType};
use navicache::k8s::namespaces::Namespace;
use navicache::k8s::resource::{Bag, Resource, ResourceMeta};
use navicache::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type Key = (String, String);

fn key(namespace: &str, resource_type: &str) -> Key {
    (namespace.to_string(), resource_type.to_string())
}

/// In-memory cluster that counts every call and hands out watch streams
/// the test can feed or close.
#[derive(Default)]
pub struct FakeClusterClient {
    namespaces: Mutex<Vec<Namespace>>,
    resources: Mutex<HashMap<Key, Vec<Resource>>>,
    failing_type: Mutex<Option<String>>,
    watch_senders: Mutex<HashMap<Key, mpsc::Sender<Result<RawWatchEvent>>>>,
    watch_failures_left: AtomicUsize,
    pub namespace_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub watch_opens: AtomicUsize,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces(names: &[&str]) -> Self {
        let client = Self::new();
        *client.namespaces.lock().unwrap() = names.iter().map(|n| Namespace::new(*n)).collect();
        client
    }

    pub fn set_resources(&self, namespace: &str, resource_type: &str, items: Vec<Resource>) {
        self.resources
            .lock()
            .unwrap()
            .insert(key(namespace, resource_type), items);
    }

    /// Make listing `resource_type` fail; `"*"` fails every list call.
    pub fn fail_lists_of(&self, resource_type: &str) {
        *self.failing_type.lock().unwrap() = Some(resource_type.to_string());
    }

    pub fn heal(&self) {
        *self.failing_type.lock().unwrap() = None;
    }

    /// Fail the next `count` watch opens.
    pub fn fail_next_watch_opens(&self, count: usize) {
        self.watch_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_opens(&self) -> usize {
        self.watch_opens.load(Ordering::SeqCst)
    }

    /// Push an event into the open watch for the key. Returns false if no
    /// watch is open or its stream has been dropped.
    pub async fn send_event(
        &self,
        namespace: &str,
        resource_type: &str,
        event_type: WatchEventType,
        object: Value,
    ) -> bool {
        let sender = self
            .watch_senders
            .lock()
            .unwrap()
            .get(&key(namespace, resource_type))
            .cloned();
        match sender {
            Some(sender) => sender.send(Ok(RawWatchEvent::new(event_type, object))).await.is_ok(),
            None => false,
        }
    }

    /// End the open watch stream for the key, as a server timeout would.
    pub fn close_watch(&self, namespace: &str, resource_type: &str) {
        self.watch_senders
            .lock()
            .unwrap()
            .remove(&key(namespace, resource_type));
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        self.namespace_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_type.lock().unwrap().as_deref() == Some("*") {
            return Err(Error::Custom("cluster unreachable".to_string()));
        }
        Ok(self.namespaces.lock().unwrap().clone())
    }

    async fn list_resources(&self, resource_type: &str, namespace: &str) -> Result<Vec<Resource>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_type.lock().unwrap().clone();
        if failing.is_some_and(|t| t == "*" || t == resource_type) {
            return Err(Error::Custom(format!("cannot list {resource_type}")));
        }
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(&key(namespace, resource_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn open_watch(&self, resource_type: &str, namespace: &str) -> Result<EventStream> {
        self.watch_opens.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .watch_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Custom("watch handshake refused".to_string()));
        }

        let (tx, rx) = mpsc::channel(64);
        self.watch_senders
            .lock()
            .unwrap()
            .insert(key(namespace, resource_type), tx);
        Ok(EventStream::new(ReceiverStream::new(rx)))
    }
}

pub fn pod(name: &str, namespace: &str, labels: &[(&str, &str)]) -> Resource {
    let meta = labels
        .iter()
        .fold(ResourceMeta::new(name, namespace), |meta, (k, v)| meta.with_label(*k, *v));
    let mut status = Bag::new();
    status.insert("phase".to_string(), json!("Running"));
    Resource::new("Pod", "v1", meta, Bag::new(), status)
}

pub fn pod_json(name: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": namespace},
        "status": {"phase": "Running"}
    })
}

pub fn node(name: &str) -> Resource {
    Resource::new("Node", "v1", ResourceMeta::new(name, ""), Bag::new(), Bag::new())
}

pub fn node_json(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {"name": name}
    })
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
