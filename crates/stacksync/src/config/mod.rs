pub mod builder;
pub mod loader;
pub mod schema;
pub mod validation;

pub use builder::{
    build_scheduler, build_source, build_target, default_cache_dir, directory_root, TargetMode,
};
pub use loader::{load_applications, load_applications_from_str, LoadedApplication};
pub use schema::{
    ApplicationMeta, ApplicationResource, ApplicationSpec, DestinationSpec, GitAuthSettings,
    GitAuthType, SourceSpec, SourceType, SyncPolicySpec, API_VERSION, KIND_APPLICATION,
};
pub use validation::ApplicationValidator;
