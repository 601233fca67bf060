//! K8s-style resource definitions handled by the reconciler.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Kinds that live outside any namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "ClusterIssuer",
    "CustomResourceDefinition",
    "StorageClass",
    "PersistentVolume",
    "IngressClass",
];

/// Returns true if objects of `kind` are cluster-scoped.
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Unique identity of a resource: (kind, namespace, name).
///
/// Cluster-scoped resources use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a key for a cluster-scoped resource.
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }

    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Metadata for a resource, following K8s conventions.
///
/// Only `name`, `namespace`, `labels` and `annotations` are declarative.
/// Everything else the server stamps on an object (timestamps, versions,
/// uids) is kept in `server_fields` and never compared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(flatten)]
    pub server_fields: Map<String, Value>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// How the body of a desired resource is compared with its live counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Comparison {
    /// Field-by-field equality of the whole body.
    #[default]
    Strict,
    /// Every field the desired resource declares must match; fields only
    /// present on the live object (server defaults) are ignored.
    DeclaredFields,
}

/// A declarative object keyed by (kind, namespace, name).
///
/// `body` holds every top-level field except `apiVersion`, `kind`,
/// `metadata` and `status`, so `spec` for a Deployment and `data` for a
/// ConfigMap are both part of the compared payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ResourceDefinition {
    /// Creates a definition with a `spec` body.
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        metadata: ObjectMeta,
        spec: Value,
    ) -> Self {
        let mut body = Map::new();
        body.insert("spec".to_string(), spec);
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata,
            body,
        }
    }

    /// Builds a definition from an arbitrary JSON value, dropping `status`.
    pub fn from_value(value: Value) -> std::result::Result<Self, String> {
        let mut definition: ResourceDefinition =
            serde_json::from_value(value).map_err(|e| e.to_string())?;
        definition.body.remove("status");

        if definition.api_version.trim().is_empty() {
            return Err("apiVersion must not be empty".to_string());
        }
        if definition.kind.trim().is_empty() {
            return Err("kind must not be empty".to_string());
        }
        if definition.metadata.name.trim().is_empty() {
            return Err("metadata.name must not be empty".to_string());
        }

        Ok(definition)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, self.namespace(), &self.metadata.name)
    }

    /// Returns the `spec` field, if the body has one.
    pub fn spec(&self) -> Option<&Value> {
        self.body.get("spec")
    }

    /// Fills in `namespace` for namespaced kinds that do not declare one.
    pub fn default_namespace(&mut self, namespace: &str) {
        if is_cluster_scoped(&self.kind) {
            self.metadata.namespace = None;
            return;
        }
        let missing = self
            .metadata
            .namespace
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true);
        if missing && !namespace.is_empty() {
            self.metadata.namespace = Some(namespace.to_string());
        }
    }

    /// Compares this (desired) definition with a live one.
    ///
    /// Server-managed metadata never participates. Labels and annotations
    /// declared here must be present with the same value on the live object;
    /// extra live labels (e.g. tracking labels) are ignored.
    pub fn matches_live(&self, live: &ResourceDefinition, comparison: Comparison) -> bool {
        if self.key() != live.key() {
            return false;
        }

        let labels_match = self
            .metadata
            .labels
            .iter()
            .all(|(k, v)| live.metadata.labels.get(k) == Some(v));
        let annotations_match = self
            .metadata
            .annotations
            .iter()
            .all(|(k, v)| live.metadata.annotations.get(k) == Some(v));
        if !labels_match || !annotations_match {
            return false;
        }

        match comparison {
            Comparison::Strict => self.body == live.body,
            Comparison::DeclaredFields => self
                .body
                .iter()
                .all(|(k, v)| live.body.get(k).is_some_and(|lv| declared_match(v, lv))),
        }
    }

    /// Serializes to a JSON value suitable for `kubectl apply`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Recursive subset match: every field of `desired` must match `live`.
fn declared_match(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d
            .iter()
            .all(|(k, v)| l.get(k).is_some_and(|lv| declared_match(v, lv))),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| declared_match(dv, lv))
        }
        (Value::Null, _) => true,
        _ => desired == live,
    }
}
