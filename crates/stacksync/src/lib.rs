pub mod broadcast;
pub mod config;
pub mod error;
pub mod gitops;
pub mod secrets;

pub use broadcast::SyncEventBroadcaster;
pub use config::{load_applications, ApplicationResource, LoadedApplication, TargetMode};
pub use error::{ConfigError, Result, StacksyncError};
pub use gitops::{
    DesiredStateSource, Reconciler, SyncError, SyncPolicy, SyncResult, SyncScheduler, SyncState,
    SyncTrigger, TargetEnvironment,
};
pub use secrets::{resolve_secret, SecretError, SecretRef};
