//! Test harness for isolated sync passes.
//!
//! The `SyncHarness` struct owns a temporary manifest directory, an in-memory
//! target and a scheduler wired to both, so a test can edit manifests on disk,
//! run a pass and inspect the live state.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::broadcast;

use stacksync::gitops::source::directory::digest_files;
use stacksync::gitops::{
    ApplicationStatus, Destination, DirectorySource, InMemoryTarget, ManifestLoader, Reconciler,
    ResourceDefinition, RetryPolicy, Revision, SyncPolicy, SyncResult, SyncTrigger,
};
use stacksync::{SyncError, SyncEventBroadcaster, SyncScheduler};

use super::builders::ManifestBuilder;

pub const NAMESPACE: &str = "demo";

pub struct SyncHarness {
    /// Keeps the manifest directory alive.
    temp_dir: TempDir,
    pub manifest_dir: PathBuf,
    pub target: Arc<InMemoryTarget>,
    pub scheduler: SyncScheduler,
    pub events: SyncEventBroadcaster,
}

impl SyncHarness {
    pub fn new(policy: SyncPolicy) -> Self {
        Self::with_target(policy, InMemoryTarget::new(), Duration::from_secs(3600))
    }

    pub fn with_target(policy: SyncPolicy, target: InMemoryTarget, interval: Duration) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let manifest_dir = temp_dir.path().join("manifests");
        std::fs::create_dir_all(&manifest_dir).expect("Failed to create manifest dir");

        let target = Arc::new(target);
        let events = SyncEventBroadcaster::new(1024);
        let source = Arc::new(DirectorySource::new(
            &manifest_dir,
            Destination::new("https://kubernetes.default.svc", NAMESPACE),
        ));
        let scheduler = SyncScheduler::new(
            "demo",
            source,
            target.clone(),
            Reconciler::new("demo")
                .with_retry(RetryPolicy::immediate(2))
                .with_concurrency(4),
            policy,
            interval,
            events.clone(),
        );

        Self {
            temp_dir,
            manifest_dir,
            target,
            scheduler,
            events,
        }
    }

    /// Writes a manifest file relative to the manifest directory.
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.manifest_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(path, content).expect("Failed to write manifest");
    }

    pub fn write_manifest(&self, relative: &str, manifest: &ManifestBuilder) {
        self.write(relative, &manifest.to_yaml());
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.manifest_dir.join(relative)).expect("Failed to remove manifest");
    }

    /// Starts the background loop. Returns the trigger sender and the loop thread.
    pub fn start(&self) -> (broadcast::Sender<SyncTrigger>, JoinHandle<()>) {
        let (tx, rx) = broadcast::channel(16);
        let handle = self.scheduler.start(rx);
        (tx, handle)
    }

    /// Stops the background loop and waits for it.
    pub fn stop(&self, handle: JoinHandle<()>) {
        self.scheduler.stop();
        handle.join().expect("scheduler thread panicked");
    }

    /// Revision the manifest directory currently resolves to.
    pub fn current_revision(&self) -> Revision {
        let files = ManifestLoader::new(&self.manifest_dir)
            .read_files()
            .expect("Failed to read manifests");
        digest_files(&files)
    }

    /// Runs one pass with `trigger` and returns its result.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncResult, SyncError> {
        self.scheduler.sync_once(trigger).await
    }

    pub async fn sync_ok(&self, trigger: SyncTrigger) -> SyncResult {
        self.sync(trigger).await.expect("sync pass failed")
    }

    pub fn status(&self) -> ApplicationStatus {
        self.scheduler.status()
    }

    /// Keys of all live resources, sorted.
    pub async fn live_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .target
            .snapshot()
            .await
            .iter()
            .map(|r| r.key().to_string())
            .collect();
        keys.sort();
        keys
    }

    pub async fn live(&self, manifest: &ManifestBuilder) -> Option<ResourceDefinition> {
        let key = manifest.build(NAMESPACE).key();
        self.target
            .snapshot()
            .await
            .into_iter()
            .find(|r| r.key() == key)
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
