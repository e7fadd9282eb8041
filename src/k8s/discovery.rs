//! Which resource types and verbs the API server supports.
//!
//! Discovery is used to validate and normalise the resource type names a
//! user types (`po`, `Pod`, `pods` all mean `pods`). It plays no part in
//! cache consistency.

use crate::error::{Error, Result};
use crate::k8s::api::ClusterClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const VERB_LIST: &str = "list";
pub const VERB_WATCH: &str = "watch";
pub const VERB_GET: &str = "get";

/// How long a failed discovery load is remembered before the server is asked again
pub const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResourceInfo {
    /// Plural name, the canonical resource type
    pub name: String,
    pub kind: String,
    pub group: String,
    pub version: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
    pub short_names: Vec<String>,
}

impl ApiResourceInfo {
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    #[must_use]
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.name == name
            || self.kind.to_ascii_lowercase() == name
            || self.short_names.iter().any(|s| *s == name)
    }
}

fn builtin(
    name: &str,
    kind: &str,
    group: &str,
    namespaced: bool,
    short_names: &[&str],
) -> ApiResourceInfo {
    const VERBS: [&str; 8] = [
        "create", "delete", "get", "list", "patch", "update", "watch", "deletecollection",
    ];
    ApiResourceInfo {
        name: name.to_string(),
        kind: kind.to_string(),
        group: group.to_string(),
        version: "v1".to_string(),
        namespaced,
        verbs: VERBS.iter().map(|v| (*v).to_string()).collect(),
        short_names: short_names.iter().map(|s| (*s).to_string()).collect(),
    }
}

/// Core types every conformant cluster serves
#[must_use]
pub fn builtin_api_resources() -> Vec<ApiResourceInfo> {
    vec![
        builtin("pods", "Pod", "", true, &["po"]),
        builtin("services", "Service", "", true, &["svc"]),
        builtin("configmaps", "ConfigMap", "", true, &["cm"]),
        builtin("secrets", "Secret", "", true, &[]),
        builtin("events", "Event", "", true, &["ev"]),
        builtin("serviceaccounts", "ServiceAccount", "", true, &["sa"]),
        builtin("persistentvolumeclaims", "PersistentVolumeClaim", "", true, &["pvc"]),
        builtin("namespaces", "Namespace", "", false, &["ns"]),
        builtin("nodes", "Node", "", false, &["no"]),
        builtin("persistentvolumes", "PersistentVolume", "", false, &["pv"]),
        builtin("deployments", "Deployment", "apps", true, &["deploy"]),
        builtin("replicasets", "ReplicaSet", "apps", true, &["rs"]),
        builtin("statefulsets", "StatefulSet", "apps", true, &["sts"]),
        builtin("daemonsets", "DaemonSet", "apps", true, &["ds"]),
        builtin("jobs", "Job", "batch", true, &[]),
        builtin("cronjobs", "CronJob", "batch", true, &["cj"]),
        builtin("ingresses", "Ingress", "networking.k8s.io", true, &["ing"]),
    ]
}

fn passthrough(name: &str) -> ApiResourceInfo {
    let name = name.to_ascii_lowercase();
    ApiResourceInfo {
        kind: name.clone(),
        name,
        group: String::new(),
        version: "v1".to_string(),
        namespaced: true,
        verbs: Vec::new(),
        short_names: Vec::new(),
    }
}

/// The built-in entry `name` refers to, by plural, kind or short name
#[must_use]
pub fn builtin_lookup(name: &str) -> Option<ApiResourceInfo> {
    builtin_api_resources().into_iter().find(|r| r.matches(name))
}

/// kubectl short names of the built-in type `(group, plural)`. Server
/// discovery as seen through `kube::discovery` does not carry them.
#[must_use]
pub fn builtin_short_names(group: &str, plural: &str) -> Vec<String> {
    builtin_api_resources()
        .into_iter()
        .find(|r| r.group == group && r.name == plural)
        .map(|r| r.short_names)
        .unwrap_or_default()
}

/// Lazily loaded, refreshable view of the server's resource types
pub struct Discovery {
    client: Arc<dyn ClusterClient>,
    resources: RwLock<Option<Arc<Vec<ApiResourceInfo>>>>,
    /// When the last load failed, and why
    last_failure: RwLock<Option<(Instant, String)>>,
    retry_interval: Duration,
}

impl Discovery {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            resources: RwLock::new(None),
            last_failure: RwLock::new(None),
            retry_interval: DISCOVERY_RETRY_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Reload the resource table from the server.
    ///
    /// # Errors
    ///
    /// Returns the client error if discovery fails; the previous table is
    /// kept in that case.
    pub async fn refresh(&self) -> Result<usize> {
        let fresh = match self.client.api_resources().await {
            Ok(fresh) => Arc::new(fresh),
            Err(e) => {
                *self.last_failure.write().await = Some((Instant::now(), e.to_string()));
                return Err(e);
            }
        };
        let count = fresh.len();
        *self.resources.write().await = Some(fresh);
        *self.last_failure.write().await = None;
        info!("🔎 Discovery loaded {} resource types", count);
        Ok(count)
    }

    async fn table(&self) -> Result<Arc<Vec<ApiResourceInfo>>> {
        if let Some(table) = self.resources.read().await.as_ref() {
            return Ok(table.clone());
        }
        let recent_failure = self
            .last_failure
            .read()
            .await
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.retry_interval)
            .map(|(_, reason)| reason.clone());
        if let Some(reason) = recent_failure {
            return Err(Error::Custom(format!("discovery unavailable: {reason}")));
        }
        self.refresh().await?;
        self.resources
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Custom("discovery table missing after refresh".to_string()))
    }

    /// Look up a resource type by plural, kind, or short name.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownResourceType` if the server does not serve it,
    /// or the client error if discovery cannot be loaded.
    pub async fn resolve(&self, name: &str) -> Result<ApiResourceInfo> {
        let table = self.table().await?;
        table
            .iter()
            .find(|r| r.matches(name))
            .cloned()
            .ok_or_else(|| Error::UnknownResourceType(name.to_string()))
    }

    /// Resolve `name` and check it supports `verb`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownResourceType` or `Error::UnsupportedVerb`.
    pub async fn validate(&self, name: &str, verb: &str) -> Result<ApiResourceInfo> {
        let info = self.resolve(name).await?;
        if info.supports(verb) {
            Ok(info)
        } else {
            Err(Error::UnsupportedVerb {
                resource_type: info.name,
                verb: verb.to_string(),
            })
        }
    }

    /// Resolve `name` for `verb`, tolerating an unreachable discovery
    /// endpoint.
    ///
    /// If discovery itself is unavailable, the built-in table of core types
    /// is consulted; a name it does not know is passed through lower-cased
    /// and treated as namespaced, so a flaky discovery endpoint never blocks
    /// reads.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownResourceType` or `Error::UnsupportedVerb`.
    pub async fn resolve_for(&self, name: &str, verb: &str) -> Result<ApiResourceInfo> {
        match self.validate(name, verb).await {
            Ok(info) => Ok(info),
            Err(e @ (Error::UnknownResourceType(_) | Error::UnsupportedVerb { .. })) => Err(e),
            Err(e) => {
                warn!("⚠️  Discovery unavailable, resolving '{}' offline: {}", name, e);
                Ok(builtin_lookup(name).unwrap_or_else(|| passthrough(name)))
            }
        }
    }

    /// Canonical plural name for `name`, validated for `verb`.
    ///
    /// # Errors
    ///
    /// Same as [`Discovery::resolve_for`].
    pub async fn canonical_name(&self, name: &str, verb: &str) -> Result<String> {
        Ok(self.resolve_for(name, verb).await?.name)
    }

    /// # Errors
    ///
    /// Returns the client error if discovery cannot be loaded.
    pub async fn supports_verb(&self, name: &str, verb: &str) -> Result<bool> {
        Ok(self.resolve(name).await?.supports(verb))
    }

    /// All canonical type names, sorted.
    ///
    /// # Errors
    ///
    /// Returns the client error if discovery cannot be loaded.
    pub async fn resource_types(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.table().await?.iter().map(|r| r.name.clone()).collect();
        names.sort();
        debug!("discovery knows {} types", names.len());
        Ok(names)
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::api::EventStream;
    use crate::k8s::namespaces::Namespace;
    use crate::k8s::resource::Resource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticClient {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterClient for StaticClient {
        async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
            Ok(vec![])
        }

        async fn list_resources(&self, _: &str, _: &str) -> Result<Vec<Resource>> {
            Ok(vec![])
        }

        async fn open_watch(&self, _: &str, _: &str) -> Result<EventStream> {
            Err(Error::Custom("no watch".to_string()))
        }

        async fn api_resources(&self) -> Result<Vec<ApiResourceInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Custom("discovery down".to_string()));
            }
            let mut table = builtin_api_resources();
            let mut readonly = builtin("componentstatuses", "ComponentStatus", "", false, &["cs"]);
            readonly.verbs = vec!["get".to_string(), "list".to_string()];
            table.push(readonly);
            Ok(table)
        }
    }

    fn client(fail: bool) -> Arc<StaticClient> {
        Arc::new(StaticClient {
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    fn discovery(fail: bool) -> Discovery {
        Discovery::new(client(fail))
    }

    #[tokio::test]
    async fn test_resolve_aliases() {
        let d = discovery(false);
        assert_eq!(d.resolve("po").await.unwrap().name, "pods");
        assert_eq!(d.resolve("Deployment").await.unwrap().api_version(), "apps/v1");
        assert_eq!(d.resolve("pods").await.unwrap().api_version(), "v1");
        assert!(!d.resolve("ns").await.unwrap().namespaced);
        assert!(matches!(
            d.resolve("widgets").await,
            Err(Error::UnknownResourceType(_))
        ));
    }

    #[test]
    fn test_builtin_aliases() {
        assert_eq!(builtin_lookup("deploy").map(|r| r.group), Some("apps".to_string()));
        assert_eq!(builtin_lookup("Ingress").map(|r| r.name), Some("ingresses".to_string()));
        assert!(builtin_lookup("widgets").is_none());

        assert_eq!(builtin_short_names("", "pods"), vec!["po"]);
        assert_eq!(builtin_short_names("apps", "deployments"), vec!["deploy"]);
        assert!(builtin_short_names("events.k8s.io", "events").is_empty());
    }

    #[tokio::test]
    async fn test_verb_validation() {
        let d = discovery(false);
        assert!(d.supports_verb("cs", VERB_LIST).await.unwrap());
        assert!(!d.supports_verb("cs", VERB_WATCH).await.unwrap());
        assert!(matches!(
            d.validate("componentstatuses", VERB_WATCH).await,
            Err(Error::UnsupportedVerb { .. })
        ));
        assert_eq!(d.canonical_name("svc", VERB_WATCH).await.unwrap(), "services");
    }

    #[tokio::test]
    async fn test_unavailable_discovery_passes_through() {
        let d = discovery(true);
        assert_eq!(d.canonical_name("Pods", VERB_LIST).await.unwrap(), "pods");
        assert!(d.resource_types().await.is_err());

        // core types still resolve with their scope and short names
        let nodes = d.resolve_for("no", VERB_WATCH).await.unwrap();
        assert_eq!(nodes.name, "nodes");
        assert!(!nodes.namespaced);

        let custom = d.resolve_for("Widgets", VERB_LIST).await.unwrap();
        assert_eq!(custom.name, "widgets");
        assert!(custom.namespaced);
    }

    #[tokio::test]
    async fn test_resolve_for_reports_scope() {
        let d = discovery(false);
        assert!(d.resolve_for("pods", VERB_LIST).await.unwrap().namespaced);
        assert!(!d.resolve_for("Node", VERB_LIST).await.unwrap().namespaced);
        assert!(matches!(
            d.resolve_for("widgets", VERB_LIST).await,
            Err(Error::UnknownResourceType(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_load_is_not_retried_immediately() {
        let client = client(true);
        let d = Discovery::new(client.clone());

        for _ in 0..5 {
            d.canonical_name("pods", VERB_LIST).await.unwrap();
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let d = Discovery::new(client.clone()).with_retry_interval(Duration::ZERO);
        d.canonical_name("pods", VERB_LIST).await.unwrap();
        d.canonical_name("pods", VERB_LIST).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }
}
