//! Git repository as a desired-state source.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{DesiredState, DesiredStateSource, Destination, Revision};
use crate::gitops::error::{Result, SyncError};
use crate::gitops::git::GitRepository;
use crate::gitops::loader::{collect_definitions, is_manifest_path, ManifestFile};

/// Follows a branch, tag or commit of a remote repository.
///
/// Revisions are commit shas. Fetching a revision reads the files of that
/// commit only, regardless of where the tracked branch has moved since.
pub struct GitSource {
    repo: GitRepository,
    target_revision: String,
    path: String,
    destination: Destination,
    // Serializes fetches; FETCH_HEAD is shared state
    lock: Mutex<()>,
}

impl GitSource {
    pub fn new(
        repo: GitRepository,
        target_revision: impl Into<String>,
        path: impl Into<String>,
        destination: Destination,
    ) -> Self {
        Self {
            repo,
            target_revision: target_revision.into(),
            path: path.into(),
            destination,
            lock: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &GitRepository {
        &self.repo
    }

    async fn read_files(&self, commit: &str) -> Result<Vec<ManifestFile>> {
        if !self.repo.tree_exists(commit, &self.path).await? {
            return Err(SyncError::ManifestDirNotFound(PathBuf::from(&self.path)));
        }

        let prefix = Path::new(self.path.trim_start_matches("./"));
        let mut files = Vec::new();
        for file in self.repo.list_files(commit, &self.path).await? {
            let relative = Path::new(&file)
                .strip_prefix(prefix)
                .unwrap_or_else(|_| Path::new(&file))
                .to_path_buf();
            if !is_manifest_path(&relative) {
                continue;
            }
            let content = self.repo.show_file(commit, &file).await?;
            files.push(ManifestFile {
                path: relative,
                content,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[async_trait]
impl DesiredStateSource for GitSource {
    async fn latest_revision(&self) -> Result<Revision> {
        let _guard = self.lock.lock().await;
        self.repo
            .ensure_initialized()
            .await
            .map_err(SyncError::into_fetch)?;
        let commit = self
            .repo
            .fetch(&self.target_revision)
            .await
            .map_err(SyncError::into_fetch)?;
        log::debug!(
            "{} {} resolved to {}",
            self.repo.remote_url(),
            self.target_revision,
            commit
        );
        Ok(Revision::new(commit))
    }

    async fn fetch(&self, revision: &Revision) -> Result<DesiredState> {
        let _guard = self.lock.lock().await;

        let commit = if self.repo.has_commit(revision.as_str()).await? {
            revision.as_str().to_string()
        } else {
            self.repo
                .ensure_initialized()
                .await
                .map_err(SyncError::into_fetch)?;
            self.repo
                .fetch(revision.as_str())
                .await
                .map_err(SyncError::into_fetch)?
        };

        let files = self
            .read_files(&commit)
            .await
            .map_err(SyncError::into_fetch)?;
        let resources = collect_definitions(&files, &self.destination.namespace)
            .map_err(SyncError::into_fetch)?;

        Ok(DesiredState {
            revision: Revision::new(commit),
            path: self.path.clone(),
            destination: self.destination.clone(),
            resources,
        })
    }

    fn describe(&self) -> String {
        format!(
            "{}@{}:{}",
            self.repo.remote_url(),
            self.target_revision,
            self.path
        )
    }
}
