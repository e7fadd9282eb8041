//! Generic envelope for any cluster object.
//!
//! A [`Resource`] keeps the fields every Kubernetes object shares (kind,
//! api version, metadata) and attaches a typed [`ResourcePayload`] for the
//! kinds the UI knows how to summarise. Kinds without a registered decoder
//! fall back to [`ResourcePayload::Unknown`] and expose only the opaque
//! `spec`/`status` bags.

use crate::error::{Error, Result};
use crate::k8s::utils::format_duration;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus, PodSpec, PodStatus, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::serde_json::{self, Map, Value};
use kube::api::DynamicObject;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tracing::debug;

pub type Bag = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMeta {
    pub name: String,
    /// Empty for cluster-scoped objects
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub generation: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerRef>,
}

impl ResourceMeta {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    fn from_object_meta(meta: ObjectMeta) -> Result<Self> {
        let name = meta
            .name
            .ok_or_else(|| Error::Decode("object has no metadata.name".to_string()))?;

        let owner_references = meta
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .map(|o| OwnerRef {
                kind: o.kind,
                name: o.name,
                uid: o.uid,
                controller: o.controller.unwrap_or(false),
            })
            .collect();

        Ok(Self {
            name,
            namespace: meta.namespace.unwrap_or_default(),
            uid: meta.uid.unwrap_or_default(),
            resource_version: meta.resource_version.unwrap_or_default(),
            generation: meta.generation.unwrap_or_default(),
            created_at: meta.creation_timestamp.map(|t| t.0),
            deleted_at: meta.deletion_timestamp.map(|t| t.0),
            labels: meta.labels.unwrap_or_default(),
            annotations: meta.annotations.unwrap_or_default(),
            owner_references,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub phase: Option<String>,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub containers: usize,
    pub ready_containers: usize,
    pub restarts: i32,
}

/// Replica counts shared by the controller kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub desired: i32,
    pub ready: i32,
    pub available: i32,
}

impl WorkloadSummary {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready >= self.desired
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSummary {
    pub service_type: String,
    pub cluster_ip: Option<String>,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub ready: bool,
    pub unschedulable: bool,
    pub kubelet_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePayload {
    Pod(PodSummary),
    Deployment(WorkloadSummary),
    ReplicaSet(WorkloadSummary),
    StatefulSet(WorkloadSummary),
    DaemonSet(WorkloadSummary),
    Service(ServiceSummary),
    Node(NodeSummary),
    Namespace { phase: Option<String> },
    ConfigMap { keys: Vec<String> },
    Secret { secret_type: String, keys: Vec<String> },
    /// No decoder registered for this kind; only the opaque bags are available
    Unknown,
}

/// Decodes the object body (everything but `metadata`) of one kind
pub type PayloadDecoder = fn(&Value) -> Result<ResourcePayload>;

/// Decoders for well-known kinds, keyed by `Kind`
pub struct PayloadRegistry {
    decoders: HashMap<String, PayloadDecoder>,
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PayloadRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("Pod", decode_pod);
        registry.register("Deployment", decode_deployment);
        registry.register("ReplicaSet", decode_replicaset);
        registry.register("StatefulSet", decode_statefulset);
        registry.register("DaemonSet", decode_daemonset);
        registry.register("Service", decode_service);
        registry.register("Node", decode_node);
        registry.register("Namespace", decode_namespace);
        registry.register("ConfigMap", decode_configmap);
        registry.register("Secret", decode_secret);
        registry
    }

    pub fn register(&mut self, kind: &str, decoder: PayloadDecoder) {
        self.decoders.insert(kind.to_string(), decoder);
    }

    #[must_use]
    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Decode `body` with the decoder registered for `kind`.
    ///
    /// A decoder failure degrades to [`ResourcePayload::Unknown`] rather than
    /// rejecting the object; the opaque bags still carry the data.
    #[must_use]
    pub fn decode(&self, kind: &str, body: &Value) -> ResourcePayload {
        match self.decoders.get(kind) {
            Some(decoder) => decoder(body).unwrap_or_else(|e| {
                debug!("payload decode for {} fell back to Unknown: {}", kind, e);
                ResourcePayload::Unknown
            }),
            None => ResourcePayload::Unknown,
        }
    }
}

fn registry() -> &'static PayloadRegistry {
    static REGISTRY: OnceLock<PayloadRegistry> = OnceLock::new();
    REGISTRY.get_or_init(PayloadRegistry::builtin)
}

fn field<T: serde::de::DeserializeOwned + Default>(body: &Value, name: &str) -> Result<T> {
    match body.get(name) {
        Some(v) if !v.is_null() => Ok(serde_json::from_value(v.clone())?),
        _ => Ok(T::default()),
    }
}

fn map_keys(body: &Value, name: &str) -> Vec<String> {
    body.get(name)
        .and_then(Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

fn decode_pod(body: &Value) -> Result<ResourcePayload> {
    let spec: Option<PodSpec> = field(body, "spec")?;
    let status: PodStatus = field(body, "status")?;
    let statuses = status.container_statuses.unwrap_or_default();

    Ok(ResourcePayload::Pod(PodSummary {
        phase: status.phase,
        node_name: spec.as_ref().and_then(|s| s.node_name.clone()),
        pod_ip: status.pod_ip,
        containers: spec.map_or(statuses.len(), |s| s.containers.len()),
        ready_containers: statuses.iter().filter(|c| c.ready).count(),
        restarts: statuses.iter().map(|c| c.restart_count).sum(),
    }))
}

fn decode_deployment(body: &Value) -> Result<ResourcePayload> {
    let spec: Option<DeploymentSpec> = field(body, "spec")?;
    let status: DeploymentStatus = field(body, "status")?;
    Ok(ResourcePayload::Deployment(WorkloadSummary {
        desired: spec.and_then(|s| s.replicas).unwrap_or(1),
        ready: status.ready_replicas.unwrap_or(0),
        available: status.available_replicas.unwrap_or(0),
    }))
}

fn int_at(body: &Value, pointer: &str) -> Option<i32> {
    body.pointer(pointer)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
}

// The apps/v1 status types mark several counters as required, so partial
// objects are read field by field instead.
fn replica_summary(body: &Value) -> WorkloadSummary {
    WorkloadSummary {
        desired: int_at(body, "/spec/replicas").unwrap_or(1),
        ready: int_at(body, "/status/readyReplicas").unwrap_or(0),
        available: int_at(body, "/status/availableReplicas").unwrap_or(0),
    }
}

#[allow(clippy::unnecessary_wraps)]
fn decode_replicaset(body: &Value) -> Result<ResourcePayload> {
    Ok(ResourcePayload::ReplicaSet(replica_summary(body)))
}

#[allow(clippy::unnecessary_wraps)]
fn decode_statefulset(body: &Value) -> Result<ResourcePayload> {
    Ok(ResourcePayload::StatefulSet(replica_summary(body)))
}

#[allow(clippy::unnecessary_wraps)]
fn decode_daemonset(body: &Value) -> Result<ResourcePayload> {
    Ok(ResourcePayload::DaemonSet(WorkloadSummary {
        desired: int_at(body, "/status/desiredNumberScheduled").unwrap_or(0),
        ready: int_at(body, "/status/numberReady").unwrap_or(0),
        available: int_at(body, "/status/numberAvailable").unwrap_or(0),
    }))
}

fn decode_service(body: &Value) -> Result<ResourcePayload> {
    let spec: ServiceSpec = field(body, "spec")?;
    let ports = spec
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| format!("{}/{}", p.port, p.protocol.unwrap_or_else(|| "TCP".to_string())))
        .collect();

    Ok(ResourcePayload::Service(ServiceSummary {
        service_type: spec.type_.unwrap_or_else(|| "ClusterIP".to_string()),
        cluster_ip: spec.cluster_ip,
        ports,
    }))
}

fn decode_node(body: &Value) -> Result<ResourcePayload> {
    let spec: NodeSpec = field(body, "spec")?;
    let status: NodeStatus = field(body, "status")?;
    let ready = status
        .conditions
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");

    Ok(ResourcePayload::Node(NodeSummary {
        ready,
        unschedulable: spec.unschedulable.unwrap_or(false),
        kubelet_version: status.node_info.map(|i| i.kubelet_version),
    }))
}

fn decode_namespace(body: &Value) -> Result<ResourcePayload> {
    let phase = body
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(ResourcePayload::Namespace { phase })
}

fn decode_configmap(body: &Value) -> Result<ResourcePayload> {
    let mut keys = map_keys(body, "data");
    keys.extend(map_keys(body, "binaryData"));
    keys.sort();
    Ok(ResourcePayload::ConfigMap { keys })
}

fn decode_secret(body: &Value) -> Result<ResourcePayload> {
    let secret_type = body
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("Opaque")
        .to_string();
    let mut keys = map_keys(body, "data");
    keys.extend(map_keys(body, "stringData"));
    keys.sort();
    keys.dedup();
    Ok(ResourcePayload::Secret { secret_type, keys })
}

/// Immutable snapshot of one cluster object
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: String,
    pub api_version: String,
    pub metadata: ResourceMeta,
    pub spec: Bag,
    pub status: Bag,
    pub payload: ResourcePayload,
    phase: String,
}

impl Resource {
    /// Build a resource from its parts, decoding the payload through the
    /// builtin registry.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        api_version: impl Into<String>,
        metadata: ResourceMeta,
        spec: Bag,
        status: Bag,
    ) -> Self {
        let kind = kind.into();
        let mut body = Map::new();
        body.insert("spec".to_string(), Value::Object(spec.clone()));
        body.insert("status".to_string(), Value::Object(status.clone()));
        let payload = registry().decode(&kind, &Value::Object(body));
        let phase = derive_phase(&payload, &status, &metadata);

        Self {
            kind,
            api_version: api_version.into(),
            metadata,
            spec,
            status,
            payload,
            phase,
        }
    }

    /// Convert a kube `DynamicObject`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the object carries no type information or
    /// no name.
    pub fn from_dynamic(obj: DynamicObject) -> Result<Self> {
        Self::from_dynamic_with(obj, registry())
    }

    /// Convert a kube `DynamicObject` using a caller-supplied registry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the object carries no type information or
    /// no name.
    pub fn from_dynamic_with(obj: DynamicObject, registry: &PayloadRegistry) -> Result<Self> {
        let types = obj
            .types
            .ok_or_else(|| Error::Decode("object has no apiVersion/kind".to_string()))?;
        let metadata = ResourceMeta::from_object_meta(obj.metadata)?;

        let bag = |name: &str| {
            obj.data
                .get(name)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };
        let spec = bag("spec");
        let status = bag("status");
        let payload = registry.decode(&types.kind, &obj.data);
        let phase = derive_phase(&payload, &status, &metadata);

        Ok(Self {
            kind: types.kind,
            api_version: types.api_version,
            metadata,
            spec,
            status,
            payload,
            phase,
        })
    }

    /// Decode a raw JSON object as delivered by a watch stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a well-formed object.
    pub fn from_value(value: Value) -> Result<Self> {
        let obj: DynamicObject = serde_json::from_value(value)?;
        Self::from_dynamic(obj)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    #[must_use]
    pub fn is_namespaced(&self) -> bool {
        !self.metadata.namespace.is_empty()
    }

    /// Derived status phase, e.g. `Running`, `Ready`, `Terminating`
    #[must_use]
    pub fn phase(&self) -> &str {
        &self.phase
    }

    #[must_use]
    pub fn age(&self) -> String {
        self.metadata.created_at.map_or_else(
            || "Unk".to_string(),
            |ts| format_duration(Utc::now().signed_duration_since(ts)),
        )
    }
}

fn derive_phase(payload: &ResourcePayload, status: &Bag, meta: &ResourceMeta) -> String {
    if meta.deleted_at.is_some() {
        return "Terminating".to_string();
    }

    let ready_or_pending = |w: &WorkloadSummary| {
        let phase = if w.is_ready() { "Ready" } else { "Pending" };
        phase.to_string()
    };

    match payload {
        ResourcePayload::Pod(pod) => pod.phase.clone().unwrap_or_else(|| "Unknown".to_string()),
        ResourcePayload::Deployment(w)
        | ResourcePayload::ReplicaSet(w)
        | ResourcePayload::StatefulSet(w)
        | ResourcePayload::DaemonSet(w) => ready_or_pending(w),
        ResourcePayload::Node(node) => {
            let phase = if node.ready { "Ready" } else { "NotReady" };
            phase.to_string()
        }
        ResourcePayload::Namespace { phase } => {
            phase.clone().unwrap_or_else(|| "Unknown".to_string())
        }
        ResourcePayload::Service(_)
        | ResourcePayload::ConfigMap { .. }
        | ResourcePayload::Secret { .. } => "Active".to_string(),
        ResourcePayload::Unknown => status
            .get("phase")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
    }
}
