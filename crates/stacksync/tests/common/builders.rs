//! Builders for creating test manifests and applications programmatically.

#![allow(dead_code)]

use serde_json::{json, Map, Value};

use stacksync::gitops::ResourceDefinition;

/// Builder for Kubernetes-style manifests.
pub struct ManifestBuilder {
    api_version: String,
    kind: String,
    name: String,
    namespace: Option<String>,
    body: Map<String, Value>,
}

impl ManifestBuilder {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: None,
            body: Map::new(),
        }
    }

    /// A Deployment with the given replica count.
    pub fn deployment(name: &str, replicas: u32) -> Self {
        Self::new("apps/v1", "Deployment", name).field(
            "spec",
            json!({
                "replicas": replicas,
                "template": { "spec": { "containers": [{ "name": name, "image": "nginx:1.27" }] } }
            }),
        )
    }

    /// A ConfigMap with one `MODE` entry.
    pub fn config_map(name: &str, mode: &str) -> Self {
        Self::new("v1", "ConfigMap", name).field("data", json!({ "MODE": mode }))
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Sets a top-level field such as `spec` or `data`.
    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut metadata = json!({ "name": self.name });
        if let Some(namespace) = &self.namespace {
            metadata["namespace"] = json!(namespace);
        }

        let mut value = Map::new();
        value.insert("apiVersion".to_string(), json!(self.api_version));
        value.insert("kind".to_string(), json!(self.kind));
        value.insert("metadata".to_string(), metadata);
        value.extend(self.body.clone());
        Value::Object(value)
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.to_value()).unwrap()
    }

    /// The definition as loaded for a destination namespace.
    pub fn build(&self, default_namespace: &str) -> ResourceDefinition {
        let mut definition = ResourceDefinition::from_value(self.to_value()).unwrap();
        definition.default_namespace(default_namespace);
        definition
    }
}

/// Joins manifests into one multi-document YAML file.
pub fn multi_document(manifests: &[ManifestBuilder]) -> String {
    manifests
        .iter()
        .map(ManifestBuilder::to_yaml)
        .collect::<Vec<_>>()
        .join("---\n")
}

/// Builder for application files.
pub struct ApplicationBuilder {
    name: String,
    source: Value,
    namespace: String,
    automated: Option<(bool, bool)>,
    poll_interval: String,
}

impl ApplicationBuilder {
    /// An application reading manifests from `local_path`.
    pub fn directory(name: &str, local_path: &str) -> Self {
        Self {
            name: name.to_string(),
            source: json!({ "type": "directory", "localPath": local_path }),
            namespace: "demo".to_string(),
            automated: None,
            poll_interval: "3m".to_string(),
        }
    }

    /// An application following `branch` of `repo_url`.
    pub fn git(name: &str, repo_url: &str, branch: &str) -> Self {
        Self {
            name: name.to_string(),
            source: json!({ "repoURL": repo_url, "targetRevision": branch, "path": "." }),
            namespace: "demo".to_string(),
            automated: None,
            poll_interval: "3m".to_string(),
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn automated(mut self, prune: bool, self_heal: bool) -> Self {
        self.automated = Some((prune, self_heal));
        self
    }

    pub fn poll_interval(mut self, interval: &str) -> Self {
        self.poll_interval = interval.to_string();
        self
    }

    pub fn to_yaml(&self) -> String {
        let mut spec = json!({
            "source": self.source,
            "destination": { "namespace": self.namespace },
            "syncPolicy": {
                "retry": { "limit": 1, "backoff": { "duration": "10ms", "factor": 1, "maxDuration": "10ms" } }
            },
            "pollInterval": self.poll_interval,
        });
        if let Some((prune, self_heal)) = self.automated {
            spec["syncPolicy"]["automated"] = json!({ "prune": prune, "selfHeal": self_heal });
        }

        let value = json!({
            "apiVersion": "stacksync.io/v1",
            "kind": "Application",
            "metadata": { "name": self.name },
            "spec": spec,
        });
        serde_yaml::to_string(&value).unwrap()
    }
}
