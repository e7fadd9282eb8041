//! [`ClusterClient`] backed by a real `kube::Client`.

use super::USER_AGENT;
use crate::error::{Error, Result};
use crate::k8s::api::{ClusterClient, EventStream, RawWatchEvent, WatchEventType};
use crate::k8s::client;
use crate::k8s::discovery::{ApiResourceInfo, builtin_lookup, builtin_short_names};
use crate::k8s::namespaces::Namespace;
use crate::k8s::resource::Resource;
use async_trait::async_trait;
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::Namespace as K8sNamespace;
use k8s_openapi::serde_json;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::TypeMeta;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery as KubeDiscovery, Scope};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

type DiscoveredTypes = Arc<Vec<(ApiResource, ApiCapabilities)>>;

pub struct KubeClusterClient {
    client: Client,
    discovered: RwLock<Option<DiscoveredTypes>>,
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovered: RwLock::new(None),
        }
    }

    /// Build a client from the inferred kube config.
    ///
    /// # Errors
    ///
    /// Returns an error if no kube config can be found or it is unusable
    pub async fn try_default() -> Result<Self> {
        let client = client::new(Some(USER_AGENT)).await?;
        Ok(Self::new(client))
    }

    async fn discovered(&self) -> Result<DiscoveredTypes> {
        if let Some(types) = self.discovered.read().await.as_ref() {
            return Ok(types.clone());
        }

        debug!("🔧 Running API discovery");
        let discovery = KubeDiscovery::new(self.client.clone()).run().await.map_err(|e| {
            error!("❌ API discovery failed: {}", e);
            e
        })?;

        let types: DiscoveredTypes = Arc::new(
            discovery
                .groups()
                .flat_map(kube::discovery::ApiGroup::recommended_resources)
                .collect(),
        );
        info!("🔎 Discovered {} API resource types", types.len());
        *self.discovered.write().await = Some(types.clone());
        Ok(types)
    }

    async fn api_for(
        &self,
        resource_type: &str,
        namespace: &str,
    ) -> Result<(Api<DynamicObject>, ApiResource)> {
        let types = self.discovered().await?;
        let (ar, caps) = find_type(&types, resource_type)
            .ok_or_else(|| Error::UnknownResourceType(resource_type.to_string()))?;

        let api = match caps.scope {
            Scope::Namespaced if !namespace.is_empty() => {
                Api::namespaced_with(self.client.clone(), namespace, ar)
            }
            _ => Api::all_with(self.client.clone(), ar),
        };
        Ok((api, ar.clone()))
    }
}

/// Find a discovered type by plural, kind or kubectl short name. Short names
/// of built-in types pin the group, so `ev` means core `events`.
fn find_type<'a>(
    types: &'a [(ApiResource, ApiCapabilities)],
    name: &str,
) -> Option<&'a (ApiResource, ApiCapabilities)> {
    let wanted = name.to_ascii_lowercase();
    builtin_lookup(name)
        .and_then(|b| {
            types
                .iter()
                .find(|(ar, _)| ar.group == b.group && ar.plural == b.name)
        })
        .or_else(|| {
            types
                .iter()
                .find(|(ar, _)| ar.plural == wanted || ar.kind.to_ascii_lowercase() == wanted)
        })
}

fn to_info(ar: &ApiResource, caps: &ApiCapabilities) -> ApiResourceInfo {
    ApiResourceInfo {
        name: ar.plural.clone(),
        kind: ar.kind.clone(),
        group: ar.group.clone(),
        version: ar.version.clone(),
        namespaced: matches!(caps.scope, Scope::Namespaced),
        verbs: caps.operations.clone(),
        short_names: builtin_short_names(&ar.group, &ar.plural),
    }
}

/// List items and watch objects often arrive without `apiVersion`/`kind`.
fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    obj
}

fn to_raw(event_type: WatchEventType, obj: DynamicObject, ar: &ApiResource) -> Result<RawWatchEvent> {
    let object = serde_json::to_value(with_types(obj, ar))?;
    Ok(RawWatchEvent::new(event_type, object))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<K8sNamespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        debug!("list_namespaces: fetched {} namespaces", list.items.len());

        let mut namespaces: Vec<Namespace> = list.items.into_iter().map(Namespace::from).collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(namespaces)
    }

    async fn list_resources(&self, resource_type: &str, namespace: &str) -> Result<Vec<Resource>> {
        let (api, ar) = self.api_for(resource_type, namespace).await?;
        let list = api.list(&ListParams::default()).await?;
        debug!(
            "list_resources: fetched {} {} in '{}'",
            list.items.len(),
            resource_type,
            namespace
        );

        let resources = list
            .items
            .into_iter()
            .filter_map(|obj| match Resource::from_dynamic(with_types(obj, &ar)) {
                Ok(resource) => Some(resource),
                Err(e) => {
                    warn!("Skipping undecodable {}: {}", resource_type, e);
                    None
                }
            })
            .collect();
        Ok(resources)
    }

    async fn open_watch(&self, resource_type: &str, namespace: &str) -> Result<EventStream> {
        let (api, ar) = self.api_for(resource_type, namespace).await?;
        info!("🔍 Opening watch for {} in '{}'", resource_type, namespace);

        let stream = watcher::watcher(api, watcher::Config::default()).filter_map(move |item| {
            let mapped = match item {
                Ok(Event::InitApply(obj)) => Some(to_raw(WatchEventType::Added, obj, &ar)),
                Ok(Event::Apply(obj)) => Some(to_raw(WatchEventType::Modified, obj, &ar)),
                Ok(Event::Delete(obj)) => Some(to_raw(WatchEventType::Deleted, obj, &ar)),
                Ok(Event::Init | Event::InitDone) => None,
                Err(e) => Some(Err(Error::from(e))),
            };
            future::ready(mapped)
        });

        Ok(EventStream::new(stream))
    }

    async fn api_resources(&self) -> Result<Vec<ApiResourceInfo>> {
        let types = self.discovered().await?;
        Ok(types.iter().map(|(ar, caps)| to_info(ar, caps)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{Event as CoreEvent, Node, Pod};
    use k8s_openapi::api::events::v1::Event as EventsEvent;

    fn discovered<K>(scope: Scope) -> (ApiResource, ApiCapabilities)
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let caps = ApiCapabilities {
            scope,
            subresources: Vec::new(),
            operations: vec!["list".to_string(), "watch".to_string()],
        };
        (ApiResource::erase::<K>(&()), caps)
    }

    fn table() -> Vec<(ApiResource, ApiCapabilities)> {
        vec![
            discovered::<EventsEvent>(Scope::Namespaced),
            discovered::<CoreEvent>(Scope::Namespaced),
            discovered::<Pod>(Scope::Namespaced),
            discovered::<Node>(Scope::Cluster),
            discovered::<Deployment>(Scope::Namespaced),
        ]
    }

    #[test]
    fn test_discovered_types_carry_short_names() {
        let infos: Vec<ApiResourceInfo> = table().iter().map(|(ar, caps)| to_info(ar, caps)).collect();

        let pods = infos.iter().find(|i| i.name == "pods").unwrap();
        assert_eq!(pods.short_names, vec!["po"]);
        let deployments = infos.iter().find(|i| i.name == "deployments").unwrap();
        assert_eq!(deployments.short_names, vec!["deploy"]);
        assert_eq!(deployments.api_version(), "apps/v1");
        let nodes = infos.iter().find(|i| i.name == "nodes").unwrap();
        assert!(!nodes.namespaced);
        assert!(infos.iter().any(|i| i.group == "events.k8s.io" && i.short_names.is_empty()));
    }

    #[test]
    fn test_find_type_resolves_short_names() {
        let types = table();
        let plural = |name: &str| find_type(&types, name).map(|(ar, _)| (ar.group.clone(), ar.plural.clone()));

        assert_eq!(plural("po"), Some((String::new(), "pods".to_string())));
        assert_eq!(plural("deploy"), Some(("apps".to_string(), "deployments".to_string())));
        assert_eq!(plural("Node"), Some((String::new(), "nodes".to_string())));
        // the short name pins the core group even though events.k8s.io is listed first
        assert_eq!(plural("ev"), Some((String::new(), "events".to_string())));
        assert!(plural("widgets").is_none());
    }
}
