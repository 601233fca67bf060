//! Builds sources, targets and schedulers from loaded applications.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::loader::LoadedApplication;
use super::schema::SourceType;
use crate::broadcast::SyncEventBroadcaster;
use crate::error::ConfigError;
use crate::gitops::git::GitRepository;
use crate::gitops::reconciler::Reconciler;
use crate::gitops::source::{DesiredStateSource, DirectorySource, GitSource};
use crate::gitops::sync_scheduler::SyncScheduler;
use crate::gitops::target::{InMemoryTarget, KubectlTarget, TargetEnvironment};

/// How targets are built for every application.
#[derive(Debug, Clone, Default)]
pub enum TargetMode {
    /// Apply through `kubectl`, optionally forcing a kubeconfig context.
    Kubectl { context: Option<String> },
    /// Keep live state in memory. Useful for dry runs.
    #[default]
    InMemory,
}

/// Default root for git mirrors: `<cache dir>/stacksync/repos`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stacksync")
        .join("repos")
}

/// Manifest root of a directory source, `None` for git sources.
pub fn directory_root(loaded: &LoadedApplication) -> Option<PathBuf> {
    let source = &loaded.application.spec.source;
    if source.source_type != SourceType::Directory {
        return None;
    }
    let root = source.resolved_local_path(loaded.base_dir())?;
    match source.path.trim_matches('/') {
        "" | "." => Some(root),
        sub => Some(root.join(sub)),
    }
}

/// Builds the desired-state source of an application.
///
/// Git mirrors live at `localPath` if given, otherwise below `cache_root`.
pub fn build_source(
    loaded: &LoadedApplication,
    cache_root: &Path,
) -> Result<Arc<dyn DesiredStateSource>, ConfigError> {
    let app = &loaded.application;
    let spec = &app.spec;
    match spec.source.source_type {
        SourceType::Directory => {
            let root = directory_root(loaded).ok_or_else(|| ConfigError::InvalidApplication {
                name: app.name().to_string(),
                reason: "source.localPath is required for directory sources".to_string(),
            })?;
            Ok(Arc::new(DirectorySource::new(root, spec.destination())))
        }
        SourceType::Git => {
            let url = spec
                .source
                .repo_url
                .clone()
                .ok_or_else(|| ConfigError::InvalidApplication {
                    name: app.name().to_string(),
                    reason: "source.repoURL is required for git sources".to_string(),
                })?;
            let mirror = spec
                .source
                .resolved_local_path(loaded.base_dir())
                .unwrap_or_else(|| cache_root.join(app.name()));
            let repo = GitRepository::new(mirror, url, spec.source.auth.clone());
            Ok(Arc::new(GitSource::new(
                repo,
                &spec.source.target_revision,
                &spec.source.path,
                spec.destination(),
            )))
        }
    }
}

/// Builds the target environment of an application.
pub fn build_target(loaded: &LoadedApplication, mode: &TargetMode) -> Arc<dyn TargetEnvironment> {
    let app = &loaded.application;
    match mode {
        TargetMode::InMemory => Arc::new(InMemoryTarget::new()),
        TargetMode::Kubectl { context } => {
            let destination = &app.spec.destination;
            let mut target = KubectlTarget::new(app.name());
            if let Some(context) = context.as_ref().or(destination.context.as_ref()) {
                target = target.with_context(context);
            }
            if let Some(kubeconfig) = &destination.kubeconfig {
                let path = crate::secrets::expand_home(kubeconfig);
                target = target.with_kubeconfig(path);
            }
            if !destination.kinds.is_empty() {
                target = target.with_kinds(destination.kinds.clone());
            }
            Arc::new(target)
        }
    }
}

/// Builds a scheduler for an application with its source, target and policies.
pub fn build_scheduler(
    loaded: &LoadedApplication,
    cache_root: &Path,
    mode: &TargetMode,
    broadcaster: SyncEventBroadcaster,
) -> Result<SyncScheduler, ConfigError> {
    let app = &loaded.application;
    let spec = &app.spec;

    let source = build_source(loaded, cache_root)?;
    let target = build_target(loaded, mode);
    let reconciler = Reconciler::new(app.name())
        .with_retry(spec.retry_policy())
        .with_concurrency(spec.concurrency());

    log::debug!(
        "Built application {} ({}) with policy {:?}",
        app.name(),
        source.describe(),
        spec.sync_policy()
    );

    Ok(SyncScheduler::new(
        app.name(),
        source,
        target,
        reconciler,
        spec.sync_policy(),
        spec.poll_interval,
        broadcaster,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_applications_from_str;

    fn loaded(yaml: &str) -> LoadedApplication {
        let mut apps = load_applications_from_str(yaml, Path::new("/etc/stacksync/app.yaml"))
            .unwrap();
        LoadedApplication {
            application: apps.remove(0),
            path: PathBuf::from("/etc/stacksync/app.yaml"),
        }
    }

    #[test]
    fn test_directory_source_resolves_relative_path() {
        let app = loaded(
            "apiVersion: stacksync.io/v1\nkind: Application\nmetadata:\n  name: local\nspec:\n  source:\n    type: directory\n    localPath: manifests\n    path: base\n",
        );
        let source = build_source(&app, Path::new("/cache")).unwrap();
        assert_eq!(source.describe(), "dir:///etc/stacksync/manifests/base");
        assert_eq!(
            directory_root(&app),
            Some(PathBuf::from("/etc/stacksync/manifests/base"))
        );
    }

    #[test]
    fn test_git_source_uses_cache_root() {
        let app = loaded(
            "apiVersion: stacksync.io/v1\nkind: Application\nmetadata:\n  name: demo\nspec:\n  source:\n    repoURL: https://example.com/deploy.git\n    path: k8s\n",
        );
        let source = build_source(&app, Path::new("/cache")).unwrap();
        assert_eq!(source.describe(), "https://example.com/deploy.git@main:k8s");
        assert_eq!(directory_root(&app), None);
    }

    #[test]
    fn test_build_scheduler_status() {
        let app = loaded(
            "apiVersion: stacksync.io/v1\nkind: Application\nmetadata:\n  name: demo\nspec:\n  source:\n    repoURL: https://example.com/deploy.git\n  syncPolicy:\n    automated:\n      prune: true\n",
        );
        let scheduler = build_scheduler(
            &app,
            Path::new("/cache"),
            &TargetMode::InMemory,
            SyncEventBroadcaster::new(16),
        )
        .unwrap();

        let status = scheduler.status();
        assert_eq!(status.name, "demo");
        assert!(status.policy.automated);
        assert!(status.policy.prune);
        assert!(!status.policy.self_heal);
    }

    #[test]
    fn test_default_cache_dir() {
        assert!(default_cache_dir().ends_with("stacksync/repos"));
    }
}
