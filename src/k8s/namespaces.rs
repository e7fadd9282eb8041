use crate::k8s::utils::format_duration;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Namespace as K8sNamespace;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceStatus {
    Active,
    Terminating,
    Unknown,
}

impl NamespaceStatus {
    #[must_use]
    pub fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Active") => Self::Active,
            Some("Terminating") => Self::Terminating,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Terminating => "Terminating",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for NamespaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub status: NamespaceStatus,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Object counts per resource type, filled in by whoever has them
    pub resource_counts: BTreeMap<String, usize>,
}

impl Namespace {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: NamespaceStatus::Active,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: None,
            deleted_at: None,
            resource_counts: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_resource_count(mut self, resource_type: impl Into<String>, count: usize) -> Self {
        self.resource_counts.insert(resource_type.into(), count);
        self
    }

    #[must_use]
    pub fn age(&self) -> String {
        self.created_at.map_or_else(
            || "Unk".to_string(),
            |ts| format_duration(Utc::now().signed_duration_since(ts)),
        )
    }
}

impl From<K8sNamespace> for Namespace {
    fn from(ns: K8sNamespace) -> Self {
        let status = NamespaceStatus::from_phase(
            ns.status.as_ref().and_then(|s| s.phase.as_deref()),
        );
        let meta = ns.metadata;

        Self {
            name: meta.name.unwrap_or_else(|| "unknown".to_string()),
            status,
            labels: meta.labels.unwrap_or_default(),
            annotations: meta.annotations.unwrap_or_default(),
            created_at: meta.creation_timestamp.map(|t| t.0),
            deleted_at: meta.deletion_timestamp.map(|t| t.0),
            resource_counts: BTreeMap::new(),
        }
    }
}
