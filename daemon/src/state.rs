//! Running applications and the handles the HTTP API works with.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use log::{info, warn};
use tokio::sync::broadcast;

use stacksync::config::{build_scheduler, directory_root, LoadedApplication, TargetMode};
use stacksync::gitops::{ApplicationStatus, ManifestWatcher, StatusHandle, SyncTrigger};
use stacksync::{SyncEventBroadcaster, SyncScheduler};

/// Capacity of each application's trigger channel.
const TRIGGER_CAPACITY: usize = 16;

/// One application with its scheduler and, for directory sources, its watcher.
struct ManagedApplication {
    scheduler: SyncScheduler,
    triggers: broadcast::Sender<SyncTrigger>,
    watcher: Option<Arc<ManifestWatcher>>,
}

/// All applications managed by this daemon.
pub struct Daemon {
    applications: Vec<ManagedApplication>,
    scheduler_threads: Vec<JoinHandle<()>>,
    watcher_threads: Vec<JoinHandle<stacksync::gitops::Result<()>>>,
    broadcaster: SyncEventBroadcaster,
}

impl Daemon {
    /// Builds a scheduler for each application. Nothing runs until `start`.
    pub fn build(
        loaded: &[LoadedApplication],
        cache_root: &Path,
        mode: &TargetMode,
    ) -> anyhow::Result<Self> {
        let broadcaster = SyncEventBroadcaster::default();
        let mut applications = Vec::with_capacity(loaded.len());

        for app in loaded {
            let scheduler = build_scheduler(app, cache_root, mode, broadcaster.clone())
                .with_context(|| format!("failed to set up application {}", app.application.name()))?;
            let (triggers, _) = broadcast::channel(TRIGGER_CAPACITY);
            let watcher = directory_root(app)
                .map(|root| Arc::new(ManifestWatcher::new(root, triggers.clone())));

            applications.push(ManagedApplication {
                scheduler,
                triggers,
                watcher,
            });
        }

        Ok(Self {
            applications,
            scheduler_threads: Vec::new(),
            watcher_threads: Vec::new(),
            broadcaster,
        })
    }

    pub fn broadcaster(&self) -> &SyncEventBroadcaster {
        &self.broadcaster
    }

    /// Starts every scheduler and watcher.
    pub fn start(&mut self) {
        for app in &self.applications {
            info!("Starting application {}", app.scheduler.name());
            self.scheduler_threads
                .push(app.scheduler.start(app.triggers.subscribe()));
            if let Some(watcher) = &app.watcher {
                self.watcher_threads.push(watcher.start());
            }
        }
    }

    /// Handles for the HTTP API.
    pub fn api_state(&self) -> ApiState {
        let applications = self
            .applications
            .iter()
            .map(|app| {
                (
                    app.scheduler.name().to_string(),
                    ApplicationHandle {
                        status: app.scheduler.status_handle(),
                        triggers: app.triggers.clone(),
                    },
                )
            })
            .collect();
        ApiState {
            applications: Arc::new(applications),
        }
    }

    /// Stops everything and waits for running passes to finish.
    pub fn shutdown(self) {
        for app in &self.applications {
            app.scheduler.stop();
            if let Some(watcher) = &app.watcher {
                watcher.stop();
            }
        }

        for handle in self.scheduler_threads {
            if handle.join().is_err() {
                warn!("Scheduler thread panicked");
            }
        }
        for handle in self.watcher_threads {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Watcher stopped with error: {}", e),
                Err(_) => warn!("Watcher thread panicked"),
            }
        }
        info!("All applications stopped");
    }
}

/// Status and trigger channel of one application.
#[derive(Clone)]
pub struct ApplicationHandle {
    status: StatusHandle,
    triggers: broadcast::Sender<SyncTrigger>,
}

impl ApplicationHandle {
    pub fn new(status: StatusHandle, triggers: broadcast::Sender<SyncTrigger>) -> Self {
        Self { status, triggers }
    }

    pub fn status(&self) -> ApplicationStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sends a trigger. Returns false if the scheduler is no longer listening.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.triggers.send(trigger).is_ok()
    }
}

/// Shared state of the HTTP API.
#[derive(Clone)]
pub struct ApiState {
    applications: Arc<BTreeMap<String, ApplicationHandle>>,
}

impl ApiState {
    pub fn new(applications: BTreeMap<String, ApplicationHandle>) -> Self {
        Self {
            applications: Arc::new(applications),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ApplicationHandle> {
        self.applications.get(name)
    }

    /// Status of every application, ordered by name.
    pub fn statuses(&self) -> Vec<ApplicationStatus> {
        self.applications.values().map(|app| app.status()).collect()
    }

    /// Sends `trigger` to every application and returns the names reached.
    pub fn trigger_all(&self, trigger: &SyncTrigger) -> Vec<String> {
        self.applications
            .iter()
            .filter(|(_, app)| app.trigger(trigger.clone()))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
