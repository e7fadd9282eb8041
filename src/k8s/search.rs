//! Free-text search and filtering over cached resources.

use crate::k8s::resource::Resource;
use crate::k8s::utils::format_label_selector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Narrowing applied on top of the text query. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Namespaces to search; empty means every namespace
    pub namespaces: Vec<String>,
    /// Resource types to search; empty means the eager refresh set
    pub resource_types: Vec<String>,
    /// Every pair must be present with an equal value
    pub labels: BTreeMap<String, String>,
    /// Derived phase, compared exactly
    pub status: Option<String>,
}

impl SearchFilters {
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.push(namespace.into());
        self
    }

    #[must_use]
    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_types.push(resource_type.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Whether `resource` passes every non-empty filter. The namespace filter
    /// only applies to namespaced objects.
    #[must_use]
    pub fn accepts(&self, resource: &Resource) -> bool {
        let namespace = resource.namespace();
        if !namespace.is_empty()
            && !self.namespaces.is_empty()
            && !self.namespaces.iter().any(|ns| ns == namespace)
        {
            return false;
        }

        let labels = &resource.metadata.labels;
        if !self
            .labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
        {
            return false;
        }

        self.status.as_deref().is_none_or(|status| resource.phase() == status)
    }
}

impl std::fmt::Display for SearchFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "namespaces=[{}] types=[{}] labels=[{}] status={}",
            self.namespaces.join(","),
            self.resource_types.join(","),
            format_label_selector(&self.labels),
            self.status.as_deref().unwrap_or("*")
        )
    }
}

/// Case-insensitive match of `query` against the name, namespace and every
/// label or annotation key and value. An empty query matches everything.
#[must_use]
pub fn matches_query(resource: &Resource, query: &str) -> bool {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return true;
    }

    let hit = |s: &str| s.to_lowercase().contains(&query);
    let meta = &resource.metadata;

    hit(&meta.name)
        || hit(&meta.namespace)
        || meta.labels.iter().any(|(k, v)| hit(k) || hit(v))
        || meta.annotations.iter().any(|(k, v)| hit(k) || hit(v))
}
