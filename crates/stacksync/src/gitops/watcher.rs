//! File system watcher for local manifest directories.
//!
//! Turns YAML changes below a directory source into refresh triggers, so a
//! local directory behaves like a repository with a push webhook.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::broadcast;

use super::error::{Result, SyncError};
use super::loader::is_manifest_path;
use super::policy::SyncTrigger;

/// Debounce window for bursts of file events (editors, git checkouts).
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a manifest directory and sends a refresh trigger on changes.
pub struct ManifestWatcher {
    root: PathBuf,
    triggers: broadcast::Sender<SyncTrigger>,
    shutdown: Arc<AtomicBool>,
}

impl ManifestWatcher {
    pub fn new(root: impl Into<PathBuf>, triggers: broadcast::Sender<SyncTrigger>) -> Self {
        Self {
            root: root.into(),
            triggers,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Watches until `stop` is called. Blocks the calling thread.
    pub fn watch(&self) -> Result<()> {
        let root = self
            .root
            .canonicalize()
            .map_err(|e| SyncError::WatchError(format!("{}: {}", self.root.display(), e)))?;

        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer: Debouncer<RecommendedWatcher> =
            new_debouncer(DEBOUNCE, tx).map_err(|e| SyncError::WatchError(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::WatchError(e.to_string()))?;

        log::info!("Started watching manifest directory: {}", root.display());

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            // Use timeout to allow checking shutdown flag
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    if let Some(path) = events.iter().find_map(|e| relevant_change(&root, e)) {
                        log::info!("Manifest change detected: {}", path.display());
                        // No scheduler listening is fine
                        let _ = self.triggers.send(SyncTrigger::Webhook { revision: None });
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Watch error: {}", e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("Stopped watching manifest directory: {}", root.display());
        Ok(())
    }

    /// Starts watching in a background thread.
    pub fn start(self: &Arc<Self>) -> std::thread::JoinHandle<Result<()>> {
        let watcher = Arc::clone(self);
        std::thread::spawn(move || watcher.watch())
    }

    /// Signals the watcher to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Returns the relative path if the event can change the desired state.
///
/// Removed directories count, since they may have held manifests.
fn relevant_change(root: &Path, event: &DebouncedEvent) -> Option<PathBuf> {
    let relative = event.path.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }

    let removed_dir = !event.path.exists() && relative.extension().is_none();
    if is_manifest_path(relative) || removed_dir {
        Some(relative.to_path_buf())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_debouncer_mini::DebouncedEventKind;
    use std::fs;
    use tempfile::TempDir;

    fn event(path: PathBuf) -> DebouncedEvent {
        DebouncedEvent {
            path,
            kind: DebouncedEventKind::Any,
        }
    }

    #[test]
    fn test_yaml_change_is_relevant() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("apps/api.yaml");
        fs::create_dir_all(dir.path().join("apps")).unwrap();
        fs::write(&file, "kind: ConfigMap").unwrap();

        assert_eq!(
            relevant_change(dir.path(), &event(file)),
            Some(PathBuf::from("apps/api.yaml"))
        );
    }

    #[test]
    fn test_other_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let readme = dir.path().join("README.md");
        fs::write(&readme, "docs").unwrap();
        let hidden = dir.path().join(".git/config.yaml");

        assert_eq!(relevant_change(dir.path(), &event(readme)), None);
        assert_eq!(relevant_change(dir.path(), &event(hidden)), None);
        assert_eq!(
            relevant_change(dir.path(), &event(dir.path().to_path_buf())),
            None
        );
    }

    #[test]
    fn test_removed_directory_is_relevant() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("old-apps");
        assert_eq!(
            relevant_change(dir.path(), &event(gone)),
            Some(PathBuf::from("old-apps"))
        );
    }

    #[test]
    fn test_watcher_stop() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = broadcast::channel(4);
        let watcher = ManifestWatcher::new(dir.path(), tx);

        assert!(!watcher.is_stopped());
        watcher.stop();
        assert!(watcher.is_stopped());
    }

    #[test]
    fn test_watch_missing_directory_fails() {
        let (tx, _rx) = broadcast::channel(4);
        let watcher = ManifestWatcher::new("/nonexistent/stacksync/manifests", tx);
        assert!(matches!(watcher.watch(), Err(SyncError::WatchError(_))));
    }

    #[test]
    fn test_file_write_sends_refresh_trigger() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(4);
        let watcher = Arc::new(ManifestWatcher::new(dir.path(), tx));
        let handle = watcher.start();

        // Give the watcher time to register before writing
        std::thread::sleep(Duration::from_millis(300));
        fs::write(dir.path().join("cm.yaml"), "kind: ConfigMap").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let trigger = loop {
            match rx.try_recv() {
                Ok(trigger) => break trigger,
                Err(_) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => panic!("no trigger received: {}", e),
            }
        };
        assert_eq!(trigger, SyncTrigger::Webhook { revision: None });

        watcher.stop();
        handle.join().unwrap().unwrap();
    }
}
