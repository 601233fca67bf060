//! Local manifest directory as a desired-state source.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::{DesiredState, DesiredStateSource, Destination, Revision};
use crate::gitops::error::{Result, SyncError};
use crate::gitops::loader::{collect_definitions, ManifestFile, ManifestLoader};

/// Serves manifests from a local directory.
///
/// The revision is a SHA-256 digest over relative paths and contents, so an
/// unchanged tree always yields the same revision.
pub struct DirectorySource {
    root: PathBuf,
    destination: Destination,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, destination: Destination) -> Self {
        Self {
            root: root.into(),
            destination,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_files(&self) -> Result<Vec<ManifestFile>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || ManifestLoader::new(root).read_files())
            .await
            .map_err(|e| SyncError::Fetch(format!("manifest read task failed: {}", e)))?
            .map_err(SyncError::into_fetch)
    }
}

/// Content digest of a set of manifest files.
pub fn digest_files(files: &[ManifestFile]) -> Revision {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(file.content.as_bytes());
        hasher.update([0u8]);
    }
    Revision::new(hex::encode(hasher.finalize()))
}

#[async_trait]
impl DesiredStateSource for DirectorySource {
    async fn latest_revision(&self) -> Result<Revision> {
        let files = self.read_files().await?;
        Ok(digest_files(&files))
    }

    async fn fetch(&self, revision: &Revision) -> Result<DesiredState> {
        let files = self.read_files().await?;

        // Digest and parse the same bytes so the snapshot is consistent
        let current = digest_files(&files);
        if &current != revision {
            return Err(SyncError::Fetch(format!(
                "revision {} is no longer available in {} (current is {})",
                revision.short(),
                self.root.display(),
                current.short()
            )));
        }

        let resources = collect_definitions(&files, &self.destination.namespace)
            .map_err(SyncError::into_fetch)?;

        Ok(DesiredState {
            revision: current,
            path: self.root.display().to_string(),
            destination: self.destination.clone(),
            resources,
        })
    }

    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }
}
