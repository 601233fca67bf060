//! Target environments the reconciler mutates.
//!
//! The reconciler never holds an authoritative copy of live state: every
//! pass reads through `get`/`list` and writes through `apply`/`delete`.

pub mod kubectl;
pub mod memory;

use async_trait::async_trait;

use super::error::Result;
use super::resource::{Comparison, ResourceDefinition, ResourceKey};

pub use kubectl::KubectlTarget;
pub use memory::{InMemoryTarget, InjectedFailure, TargetCall, TargetOperation};

/// Live resource set accessed only through get/list/apply/delete.
#[async_trait]
pub trait TargetEnvironment: Send + Sync {
    /// Returns the live resource with `key`, if present.
    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceDefinition>>;

    /// Lists live resources managed in `namespace`.
    ///
    /// An empty namespace lists cluster-scoped resources.
    async fn list(&self, namespace: &str) -> Result<Vec<ResourceDefinition>>;

    /// Creates or replaces a resource.
    async fn apply(&self, definition: &ResourceDefinition) -> Result<()>;

    /// Deletes a resource. Returns `SyncError::DeleteNotFound` if it is absent.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;

    /// How desired bodies should be compared with what this target returns.
    fn comparison(&self) -> Comparison {
        Comparison::Strict
    }
}
