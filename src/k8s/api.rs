//! The seam between the cache and the cluster.
//!
//! Everything the cache subsystem needs from Kubernetes goes through
//! [`ClusterClient`]. The production implementation lives in
//! [`crate::k8s::kube_client`]; tests substitute a fake.

use crate::error::Result;
use crate::k8s::discovery::{ApiResourceInfo, builtin_api_resources};
use crate::k8s::namespaces::Namespace;
use crate::k8s::resource::Resource;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use k8s_openapi::serde_json::Value;
use pin_project::{pin_project, pinned_drop};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// An undecoded change notification as it comes off the wire
#[derive(Debug, Clone)]
pub struct RawWatchEvent {
    pub event_type: WatchEventType,
    pub object: Value,
}

impl RawWatchEvent {
    #[must_use]
    pub const fn new(event_type: WatchEventType, object: Value) -> Self {
        Self { event_type, object }
    }
}

/// A live subscription. Yields events until the server closes it, an error
/// occurs, or it is closed locally.
#[pin_project(PinnedDrop)]
pub struct EventStream {
    #[pin]
    inner: BoxStream<'static, Result<RawWatchEvent>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl EventStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<RawWatchEvent>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            on_close: None,
        }
    }

    /// Run `hook` once when the stream is closed or dropped.
    #[must_use]
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn close(self) {
        debug!("closing event stream");
        drop(self);
    }
}

#[pinned_drop]
impl PinnedDrop for EventStream {
    fn drop(self: Pin<&mut Self>) {
        if let Some(hook) = self.project().on_close.take() {
            hook();
        }
    }
}

impl Stream for EventStream {
    type Item = Result<RawWatchEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("has_close_hook", &self.on_close.is_some())
            .finish_non_exhaustive()
    }
}

/// Cluster API operations the cache depends on.
///
/// An empty `namespace` means "all namespaces" for namespaced types and is
/// required for cluster-scoped types.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;

    async fn list_resources(&self, resource_type: &str, namespace: &str) -> Result<Vec<Resource>>;

    async fn open_watch(&self, resource_type: &str, namespace: &str) -> Result<EventStream>;

    /// Resource types the server offers. Defaults to the core built-ins.
    async fn api_resources(&self) -> Result<Vec<ApiResourceInfo>> {
        Ok(builtin_api_resources())
    }
}
