//! Versioned sources of desired state.

pub mod directory;
pub mod git;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::Result;
use super::resource::ResourceDefinition;

pub use directory::DirectorySource;
pub use git::GitSource;

/// Opaque revision identifier (commit sha or content digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target cluster and default namespace of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub server: String,
    pub namespace: String,
}

impl Destination {
    pub fn new(server: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            namespace: namespace.into(),
        }
    }
}

/// Immutable snapshot of the desired resources at one revision.
#[derive(Debug, Clone)]
pub struct DesiredState {
    pub revision: Revision,
    /// Path inside the source the manifests were read from.
    pub path: String,
    pub destination: Destination,
    /// Resources in source order.
    pub resources: Vec<ResourceDefinition>,
}

impl DesiredState {
    /// Namespaces the live set must be listed in to diff this snapshot.
    ///
    /// Always includes the destination namespace, so resources pruned out of
    /// the source are still seen.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .resources
            .iter()
            .map(|r| r.namespace().to_string())
            .chain(std::iter::once(self.destination.namespace.clone()))
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }
}

/// A versioned repository of resource definitions.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// Resolves the newest revision available.
    async fn latest_revision(&self) -> Result<Revision>;

    /// Reads the ordered resource definitions at `revision`.
    async fn fetch(&self, revision: &Revision) -> Result<DesiredState>;

    /// Human-readable location, for logs and status.
    fn describe(&self) -> String;
}
