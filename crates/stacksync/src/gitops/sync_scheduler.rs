//! Per-application sync scheduler.
//!
//! Each application gets a background thread with its own runtime. Passes are
//! started by the poll timer or by triggers on a broadcast channel. At most
//! one pass runs at a time: triggers that arrive meanwhile are coalesced,
//! except a webhook announcing a different revision, which supersedes the
//! running pass and schedules one follow-up pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;

use crate::broadcast::SyncEventBroadcaster;
use crate::gitops::error::{Result, SyncError};
use crate::gitops::policy::{SyncCancellation, SyncPolicy, SyncTrigger};
use crate::gitops::reconciler::{Reconciler, SyncResult, SyncState};
use crate::gitops::source::{DesiredState, DesiredStateSource, Revision};
use crate::gitops::target::TargetEnvironment;

/// Whether a pass is currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
}

/// Observable status of one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub name: String,
    /// Where the desired state comes from.
    pub source: String,
    pub policy: SyncPolicy,
    pub phase: SyncPhase,
    pub sync_state: SyncState,
    /// Revision of the last completed pass.
    pub revision: Option<Revision>,
    /// Revision of the running pass, once resolved.
    pub syncing_revision: Option<Revision>,
    pub last_result: Option<SyncResult>,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ApplicationStatus {
    pub fn new(name: &str, source: String, policy: SyncPolicy) -> Self {
        Self {
            name: name.to_string(),
            source,
            policy,
            phase: SyncPhase::Idle,
            sync_state: SyncState::Unknown,
            revision: None,
            syncing_revision: None,
            last_result: None,
            last_error: None,
            last_synced_at: None,
        }
    }
}

/// Shared handle to an application's status.
pub type StatusHandle = Arc<RwLock<ApplicationStatus>>;

/// Everything a pass needs, shared between the loop and its tasks.
struct Application {
    name: String,
    source: Arc<dyn DesiredStateSource>,
    target: Arc<dyn TargetEnvironment>,
    reconciler: Reconciler,
    policy: SyncPolicy,
    status: StatusHandle,
    broadcaster: SyncEventBroadcaster,
}

impl Application {
    fn update_status(&self, f: impl FnOnce(&mut ApplicationStatus)) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    fn syncing_revision(&self) -> Option<Revision> {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .syncing_revision
            .clone()
    }

    /// Resolves, fetches and reconciles one revision.
    async fn run_pass(
        self: Arc<Self>,
        trigger: SyncTrigger,
        cancel: SyncCancellation,
    ) -> Result<SyncResult> {
        self.update_status(|s| {
            s.phase = SyncPhase::Syncing;
            s.syncing_revision = trigger.revision().map(Revision::new);
        });

        let result = self.resolve_and_reconcile(trigger, &cancel).await;

        self.update_status(|s| {
            s.phase = SyncPhase::Idle;
            s.syncing_revision = None;
            match &result {
                Ok(r) if r.is_concurrent_skip() => {}
                Ok(r) => {
                    s.sync_state = r.state;
                    s.revision = Some(r.revision.clone());
                    s.last_error = summarize_errors(r);
                    s.last_synced_at = Some(r.finished_at);
                    s.last_result = Some(r.clone());
                }
                // The previous state stays; the next trigger retries
                Err(e) => s.last_error = Some(e.to_string()),
            }
        });

        result
    }

    async fn resolve_and_reconcile(
        &self,
        trigger: SyncTrigger,
        cancel: &SyncCancellation,
    ) -> Result<SyncResult> {
        let progress = self.broadcaster.start_sync(&self.name);

        let desired = match self.fetch_desired(&trigger).await {
            Ok(desired) => desired,
            Err(e) => {
                log::error!("Sync of {} aborted: {}", self.name, e);
                progress.failed(&e.to_string());
                return Err(e);
            }
        };

        self.reconciler
            .reconcile(
                &desired,
                self.target.as_ref(),
                &self.policy,
                trigger,
                cancel,
                &progress,
            )
            .await
    }

    /// Resolves the revision to sync and reads its snapshot.
    async fn fetch_desired(&self, trigger: &SyncTrigger) -> Result<DesiredState> {
        let revision = match trigger.revision() {
            Some(rev) => Revision::new(rev),
            None => self
                .source
                .latest_revision()
                .await
                .map_err(SyncError::into_fetch)?,
        };
        self.update_status(|s| s.syncing_revision = Some(revision.clone()));
        self.source
            .fetch(&revision)
            .await
            .map_err(SyncError::into_fetch)
    }
}

fn summarize_errors(result: &SyncResult) -> Option<String> {
    if result.errors.is_empty() {
        return None;
    }
    Some(
        result
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.key, e.message))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// A pass running on the scheduler's runtime.
struct InFlight {
    handle: tokio::task::JoinHandle<Result<SyncResult>>,
    cancel: SyncCancellation,
    trigger: SyncTrigger,
}

/// What the loop does with a trigger that arrives while a pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    /// Cancel the running pass and run the trigger once it has stopped.
    Supersede,
    /// Let the running pass finish, then run the trigger.
    Queue,
    /// The running pass already covers the trigger.
    Coalesce,
}

/// Decides how `incoming` relates to the pass started by `running`, which is
/// syncing `revision` if that is known yet.
fn classify_arrival(
    running: &SyncTrigger,
    revision: Option<&str>,
    incoming: &SyncTrigger,
    policy: &SyncPolicy,
) -> Arrival {
    if let Some(rev) = incoming.revision() {
        if revision != Some(rev) {
            return Arrival::Supersede;
        }
    }
    // A manual sync may change what an automatic pass only reports
    let widens = incoming.is_manual()
        && !running.is_manual()
        && !(policy.automated && policy.self_heal);
    if widens {
        Arrival::Queue
    } else {
        Arrival::Coalesce
    }
}

/// Folds `incoming` into the pending rerun. A manual request is never
/// narrowed back to an automatic one; it resolves the newest revision anyway.
fn merge_rerun(pending: Option<SyncTrigger>, incoming: SyncTrigger) -> SyncTrigger {
    match pending {
        Some(SyncTrigger::Manual) => SyncTrigger::Manual,
        _ => incoming,
    }
}

enum Wake {
    Trigger(SyncTrigger),
    Finished,
    TriggersClosed,
    Shutdown,
}

/// Periodic sync scheduler for one application.
pub struct SyncScheduler {
    app: Arc<Application>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl SyncScheduler {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DesiredStateSource>,
        target: Arc<dyn TargetEnvironment>,
        reconciler: Reconciler,
        policy: SyncPolicy,
        interval: Duration,
        broadcaster: SyncEventBroadcaster,
    ) -> Self {
        let name = name.into();
        let status = ApplicationStatus::new(&name, source.describe(), policy);
        Self {
            app: Arc::new(Application {
                name,
                source,
                target,
                reconciler,
                policy,
                status: Arc::new(RwLock::new(status)),
                broadcaster,
            }),
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.app.name
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> ApplicationStatus {
        self.app
            .status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Shared status handle that stays valid after the scheduler is dropped.
    pub fn status_handle(&self) -> StatusHandle {
        Arc::clone(&self.app.status)
    }

    /// Runs one pass on the caller's runtime, outside the loop.
    pub async fn sync_once(&self, trigger: SyncTrigger) -> Result<SyncResult> {
        Arc::clone(&self.app)
            .run_pass(trigger, SyncCancellation::new())
            .await
    }

    /// Starts the sync loop in a background thread.
    ///
    /// An initial poll pass runs immediately.
    pub fn start(&self, trigger_rx: broadcast::Receiver<SyncTrigger>) -> JoinHandle<()> {
        let app = Arc::clone(&self.app);
        let shutdown = Arc::clone(&self.shutdown);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start sync runtime for {}: {}", app.name, e);
                    return;
                }
            };

            rt.block_on(run_loop(app, interval, trigger_rx, shutdown, shutdown_notify));
        })
    }

    /// Signals the scheduler to stop. A running pass starts no further operations.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_one();
    }
}

async fn wait_finished(in_flight: &mut Option<InFlight>) {
    match in_flight {
        Some(pass) => {
            let _ = (&mut pass.handle).await;
        }
        None => std::future::pending().await,
    }
}

fn spawn_pass(app: &Arc<Application>, trigger: SyncTrigger) -> InFlight {
    log::info!("Starting {} sync of {}", trigger, app.name);
    // Visible before the task first runs, so the next trigger compares against it
    app.update_status(|s| {
        s.phase = SyncPhase::Syncing;
        s.syncing_revision = trigger.revision().map(Revision::new);
    });
    let cancel = SyncCancellation::new();
    let handle = tokio::spawn(Arc::clone(app).run_pass(trigger.clone(), cancel.clone()));
    InFlight {
        handle,
        cancel,
        trigger,
    }
}

async fn run_loop(
    app: Arc<Application>,
    interval: Duration,
    mut trigger_rx: broadcast::Receiver<SyncTrigger>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.tick().await; // skip immediate first tick

    let mut in_flight = Some(spawn_pass(&app, SyncTrigger::Poll));
    let mut rerun: Option<SyncTrigger> = None;
    let mut triggers_open = true;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let wake = tokio::select! {
            _ = shutdown_notify.notified() => Wake::Shutdown,
            _ = timer.tick() => Wake::Trigger(SyncTrigger::Poll),
            msg = trigger_rx.recv(), if triggers_open => match msg {
                Ok(trigger) => Wake::Trigger(trigger),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("{} missed {} sync triggers", app.name, missed);
                    Wake::Trigger(SyncTrigger::Webhook { revision: None })
                }
                Err(RecvError::Closed) => Wake::TriggersClosed,
            },
            _ = wait_finished(&mut in_flight) => Wake::Finished,
        };

        match wake {
            Wake::Shutdown => break,
            Wake::TriggersClosed => {
                log::debug!("Trigger channel of {} closed; polling only", app.name);
                triggers_open = false;
            }
            Wake::Finished => {
                in_flight = None;
                if let Some(trigger) = rerun.take() {
                    in_flight = Some(spawn_pass(&app, trigger));
                }
            }
            Wake::Trigger(trigger) => {
                let Some(pass) = &in_flight else {
                    in_flight = Some(spawn_pass(&app, trigger));
                    continue;
                };

                let revision = pass
                    .trigger
                    .revision()
                    .map(Revision::new)
                    .or_else(|| app.syncing_revision());
                let revision = revision.as_ref().map(Revision::as_str);

                match classify_arrival(&pass.trigger, revision, &trigger, &app.policy) {
                    Arrival::Supersede => {
                        log::info!(
                            "Revision {} supersedes the running sync of {}",
                            trigger.revision().unwrap_or_default(),
                            app.name
                        );
                        pass.cancel.cancel();
                        let pending = rerun.take().or_else(|| {
                            pass.trigger.is_manual().then_some(SyncTrigger::Manual)
                        });
                        rerun = Some(merge_rerun(pending, trigger));
                    }
                    Arrival::Queue => {
                        log::info!(
                            "{} sync of {} queued behind the running {} sync",
                            trigger,
                            app.name,
                            pass.trigger
                        );
                        rerun = Some(merge_rerun(rerun.take(), trigger));
                    }
                    Arrival::Coalesce => {
                        log::debug!(
                            "{} trigger for {} coalesced into the running sync",
                            trigger,
                            app.name
                        );
                    }
                }
            }
        }
    }

    // Let already-started operations finish before the runtime goes away
    if let Some(pass) = in_flight.take() {
        pass.cancel.cancel();
        let _ = pass.handle.await;
    }
    log::info!("Sync scheduler for {} stopped", app.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::policy::RetryPolicy;
    use crate::gitops::resource::ResourceKey;
    use crate::gitops::source::{Destination, DirectorySource};
    use crate::gitops::target::InMemoryTarget;
    use tempfile::TempDir;

    const CONFIG_MAP: &str =
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  MODE: demo\n";

    fn scheduler(dir: &TempDir, target: Arc<InMemoryTarget>, interval: Duration) -> SyncScheduler {
        let source = Arc::new(DirectorySource::new(
            dir.path(),
            Destination::new("https://kubernetes.default.svc", "demo"),
        ));
        SyncScheduler::new(
            "demo",
            source,
            target,
            Reconciler::new("demo").with_retry(RetryPolicy::immediate(1)),
            SyncPolicy::automated(),
            interval,
            SyncEventBroadcaster::default(),
        )
    }

    #[tokio::test]
    async fn test_sync_once_updates_status() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cm.yaml"), CONFIG_MAP).unwrap();
        let target = Arc::new(InMemoryTarget::new());
        let scheduler = scheduler(&dir, target.clone(), Duration::from_secs(60));

        let result = scheduler.sync_once(SyncTrigger::Manual).await.unwrap();
        assert_eq!(result.state, SyncState::InSync);

        let status = scheduler.status();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.sync_state, SyncState::InSync);
        assert_eq!(status.revision, Some(result.revision));
        assert!(status.last_synced_at.is_some());
        assert!(target
            .contains(&ResourceKey::new("ConfigMap", "demo", "settings"))
            .await);
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cm.yaml"), CONFIG_MAP).unwrap();
        let target = Arc::new(InMemoryTarget::new());
        let scheduler = scheduler(&dir, target.clone(), Duration::from_secs(60));
        scheduler.sync_once(SyncTrigger::Manual).await.unwrap();
        target.clear_calls().await;

        std::fs::write(dir.path().join("broken.yaml"), "kind: [").unwrap();
        let err = scheduler.sync_once(SyncTrigger::Poll).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));

        let status = scheduler.status();
        assert_eq!(status.sync_state, SyncState::InSync);
        assert!(status.last_error.is_some());
        assert!(target.calls().await.is_empty());
    }

    fn webhook(revision: &str) -> SyncTrigger {
        SyncTrigger::Webhook {
            revision: Some(revision.to_string()),
        }
    }

    #[tokio::test]
    async fn test_spawned_pass_publishes_revision_immediately() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cm.yaml"), CONFIG_MAP).unwrap();
        let scheduler = scheduler(&dir, Arc::new(InMemoryTarget::new()), Duration::from_secs(60));

        let pass = spawn_pass(&scheduler.app, webhook("abc123"));
        let status = scheduler.status();
        assert_eq!(status.phase, SyncPhase::Syncing);
        assert_eq!(status.syncing_revision, Some(Revision::new("abc123")));

        // A repeat of the same webhook is covered by the pass just spawned
        assert_eq!(
            classify_arrival(
                &pass.trigger,
                Some("abc123"),
                &webhook("abc123"),
                &SyncPolicy::automated()
            ),
            Arrival::Coalesce
        );

        pass.cancel.cancel();
        let _ = pass.handle.await;
        assert_eq!(scheduler.status().phase, SyncPhase::Idle);
    }

    #[test]
    fn test_classify_arrival() {
        let automated = SyncPolicy::automated();
        let no_heal = SyncPolicy::automated().with_self_heal(false);
        let manual_only = SyncPolicy::default();

        assert_eq!(
            classify_arrival(&SyncTrigger::Poll, Some("a"), &webhook("b"), &automated),
            Arrival::Supersede
        );
        assert_eq!(
            classify_arrival(&SyncTrigger::Poll, None, &webhook("b"), &automated),
            Arrival::Supersede
        );
        assert_eq!(
            classify_arrival(&SyncTrigger::Poll, Some("a"), &SyncTrigger::Poll, &automated),
            Arrival::Coalesce
        );

        // Manual requests widen what refresh-only passes may change
        for policy in [no_heal, manual_only] {
            assert_eq!(
                classify_arrival(&SyncTrigger::Poll, Some("a"), &SyncTrigger::Manual, &policy),
                Arrival::Queue
            );
        }
        assert_eq!(
            classify_arrival(&SyncTrigger::Poll, Some("a"), &SyncTrigger::Manual, &automated),
            Arrival::Coalesce
        );
        assert_eq!(
            classify_arrival(&SyncTrigger::Manual, Some("a"), &SyncTrigger::Manual, &manual_only),
            Arrival::Coalesce
        );
    }

    #[test]
    fn test_merge_rerun_keeps_manual() {
        assert_eq!(merge_rerun(None, webhook("b")), webhook("b"));
        assert_eq!(
            merge_rerun(Some(SyncTrigger::Manual), webhook("b")),
            SyncTrigger::Manual
        );
        assert_eq!(
            merge_rerun(Some(webhook("a")), SyncTrigger::Manual),
            SyncTrigger::Manual
        );
        assert_eq!(merge_rerun(Some(webhook("a")), webhook("b")), webhook("b"));
    }

    #[test]
    fn test_trigger_runs_pass_and_stop_joins() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cm.yaml"), CONFIG_MAP).unwrap();
        let target = Arc::new(InMemoryTarget::new());
        let scheduler = scheduler(&dir, target, Duration::from_secs(3600));
        let status = scheduler.status_handle();

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = scheduler.start(trigger_rx);

        // The initial pass converges the empty target
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while status.read().unwrap().sync_state != SyncState::InSync {
            assert!(std::time::Instant::now() < deadline, "initial sync never finished");
            std::thread::sleep(Duration::from_millis(20));
        }

        let _ = trigger_tx.send(SyncTrigger::Manual);
        std::thread::sleep(Duration::from_millis(100));

        scheduler.stop();
        handle.join().expect("scheduler thread panicked");
        assert_eq!(status.read().unwrap().phase, SyncPhase::Idle);
    }
}
