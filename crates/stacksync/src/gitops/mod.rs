//! Desired-state reconciliation.
//!
//! An application pairs a desired-state source (a git repository or a local
//! directory of YAML manifests) with a target environment. Each sync pass:
//! - resolves the source to a revision and loads its resource definitions
//! - diffs them against the live resources owned by the application
//! - applies creates and updates, then prunes, as the sync policy permits
//! - reports per-resource outcomes and an overall sync state

pub mod diff;
pub mod error;
pub mod git;
pub mod loader;
pub mod policy;
pub mod progress;
pub mod reconciler;
pub mod resource;
pub mod source;
pub mod sync_scheduler;
pub mod target;
pub mod watcher;

pub use diff::{Classification, DiffEntry, SyncPlan};
pub use error::{Result, SyncError};
pub use git::GitRepository;
pub use loader::{ManifestFile, ManifestLoader};
pub use policy::{RetryPolicy, SyncCancellation, SyncPolicy, SyncTrigger};
pub use progress::{SyncEvent, SyncEventPhase, SyncProgress};
pub use reconciler::{
    Outcome, Reconciler, ResourceError, ResourceOperation, ResourceOutcome, SyncCounts,
    SyncResult, SyncState,
};
pub use resource::{Comparison, ObjectMeta, ResourceDefinition, ResourceKey};
pub use source::{
    DesiredState, DesiredStateSource, Destination, DirectorySource, GitSource, Revision,
};
pub use sync_scheduler::{ApplicationStatus, StatusHandle, SyncPhase, SyncScheduler};
pub use target::{
    InMemoryTarget, InjectedFailure, KubectlTarget, TargetCall, TargetEnvironment, TargetOperation,
};
pub use watcher::ManifestWatcher;
