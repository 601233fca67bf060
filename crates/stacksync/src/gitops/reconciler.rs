//! Declarative state reconciler: diff -> create -> update -> delete.
//!
//! One pass lists the live set, classifies every key against the desired
//! snapshot and then mutates the target in three phases. Operations inside a
//! phase run concurrently up to the configured limit; each key belongs to
//! exactly one phase and its retries run inside a single future, so writes to
//! the same key never overlap.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use tokio::sync::Mutex;

use super::diff::{Classification, DiffEntry, SyncPlan};
use super::error::{Result, SyncError};
use super::policy::{RetryPolicy, SyncCancellation, SyncPolicy, SyncTrigger};
use super::progress::SyncProgress;
use super::resource::{ResourceDefinition, ResourceKey};
use super::source::{DesiredState, Revision};
use super::target::TargetEnvironment;

/// Synchronization status of an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// No pass has completed yet.
    #[default]
    Unknown,
    InSync,
    OutOfSync,
    Syncing,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Unknown => write!(f, "Unknown"),
            SyncState::InSync => write!(f, "InSync"),
            SyncState::OutOfSync => write!(f, "OutOfSync"),
            SyncState::Syncing => write!(f, "Syncing"),
            SyncState::Error => write!(f, "Error"),
        }
    }
}

/// Mutating operation issued for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceOperation {
    Create,
    Update,
    Delete,
}

/// What happened to one key during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// Created or updated.
    Applied,
    Deleted,
    /// Delete found nothing to delete.
    AlreadyAbsent,
    /// Policy did not allow the operation.
    Skipped,
    /// The pass was cancelled before the operation started.
    NotStarted,
    Failed,
    /// Already in sync.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOutcome {
    pub key: ResourceKey,
    pub classification: Classification,
    pub outcome: Outcome,
    /// Attempts made, including retries. Zero if nothing was issued.
    pub attempts: u32,
}

/// A per-resource failure after retries were exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceError {
    pub key: ResourceKey,
    pub operation: ResourceOperation,
    /// Error kind, e.g. `ApplyRejectedError`.
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounts {
    pub to_create: usize,
    pub to_update: usize,
    pub to_delete: usize,
    pub in_sync: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub not_started: usize,
    pub failed: usize,
}

/// Report of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub sync_id: String,
    pub application: String,
    pub revision: Revision,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: SyncState,
    pub counts: SyncCounts,
    pub resources: Vec<ResourceOutcome>,
    pub errors: Vec<ResourceError>,
    /// Some operations were not started because the pass was superseded.
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyncResult {
    /// True if the pass did nothing because another one was running.
    pub fn is_concurrent_skip(&self) -> bool {
        self.state == SyncState::Syncing
    }

    /// Number of apply/delete operations that changed the target.
    pub fn changes(&self) -> usize {
        self.counts.created + self.counts.updated + self.counts.deleted
    }
}

/// Which operations a pass may issue.
#[derive(Debug, Clone, Copy)]
struct Permissions {
    create: bool,
    update: bool,
    delete: bool,
}

impl Permissions {
    fn new(policy: &SyncPolicy, trigger: &SyncTrigger) -> Self {
        // Without automation only an explicit request may mutate the target
        let apply = policy.automated || trigger.is_manual();
        Self {
            create: apply,
            update: apply && (policy.self_heal || trigger.is_manual()),
            delete: apply && policy.prune,
        }
    }

    fn allows(&self, classification: Classification) -> bool {
        match classification {
            Classification::ToCreate => self.create,
            Classification::ToUpdate => self.update,
            Classification::ToDelete => self.delete,
            Classification::InSync => false,
        }
    }
}

/// Result of one key's operation, tagged with its plan position.
struct Executed {
    index: usize,
    outcome: ResourceOutcome,
    error: Option<ResourceError>,
}

/// Converges a target environment toward a desired snapshot.
///
/// Holds no live state between passes, only the namespaces it may still own
/// resources in. Concurrent calls are single-flight: a call made while
/// another pass runs returns immediately.
pub struct Reconciler {
    application: String,
    retry: RetryPolicy,
    concurrency: usize,
    /// Prevents overlapping passes against the same target.
    reconcile_lock: Mutex<()>,
    /// Namespaces holding managed resources after the last pass.
    managed_namespaces: std::sync::Mutex<BTreeSet<String>>,
}

impl Reconciler {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            retry: RetryPolicy::default(),
            concurrency: num_cpus::get().max(1),
            reconcile_lock: Mutex::new(()),
            managed_namespaces: std::sync::Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Maximum concurrent operations within one phase.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs one pass.
    ///
    /// Per-resource failures are reported in the result. An error is returned
    /// only if the live set could not be listed, before anything was changed.
    pub async fn reconcile(
        &self,
        desired: &DesiredState,
        target: &dyn TargetEnvironment,
        policy: &SyncPolicy,
        trigger: SyncTrigger,
        cancel: &SyncCancellation,
        progress: &SyncProgress,
    ) -> Result<SyncResult> {
        let started_at = Utc::now();

        // Try to acquire the lock; skip if already reconciling
        let _guard = match self.reconcile_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::info!(
                    "Sync of {} skipped: another sync is already in progress",
                    self.application
                );
                return Ok(SyncResult {
                    sync_id: progress.sync_id().to_string(),
                    application: self.application.clone(),
                    revision: desired.revision.clone(),
                    trigger,
                    started_at,
                    finished_at: Utc::now(),
                    state: SyncState::Syncing,
                    counts: SyncCounts::default(),
                    resources: Vec::new(),
                    errors: Vec::new(),
                    cancelled: false,
                    message: Some("Skipped: sync already in progress".to_string()),
                });
            }
        };

        progress.started(&format!(
            "Syncing {} at {} ({})",
            self.application,
            desired.revision.short(),
            trigger
        ));

        let live = match self.list_live(desired, target).await {
            Ok(live) => live,
            Err(e) => {
                log::error!("Failed to list live resources for {}: {}", self.application, e);
                progress.failed(&e.to_string());
                return Err(e);
            }
        };

        let plan = SyncPlan::compute(&desired.resources, &live, target.comparison());
        let permissions = Permissions::new(policy, &trigger);

        let mut counts = SyncCounts {
            to_create: plan.count(Classification::ToCreate),
            to_update: plan.count(Classification::ToUpdate),
            to_delete: plan.count(Classification::ToDelete),
            in_sync: plan.count(Classification::InSync),
            ..Default::default()
        };

        log::info!(
            "Sync plan for {} at {}: {} to create, {} to update, {} to delete, {} in sync",
            self.application,
            desired.revision.short(),
            counts.to_create,
            counts.to_update,
            counts.to_delete,
            counts.in_sync
        );
        progress.planned(
            desired.revision.as_str(),
            &format!(
                "{} to create, {} to update, {} to delete, {} in sync",
                counts.to_create, counts.to_update, counts.to_delete, counts.in_sync
            ),
        );

        let mut executed: Vec<Executed> = Vec::with_capacity(plan.entries().len());

        for (index, entry) in plan.entries().iter().enumerate() {
            if entry.classification == Classification::InSync {
                executed.push(Executed::idle(index, entry, Outcome::Unchanged));
            } else if !permissions.allows(entry.classification) {
                log::debug!(
                    "{} is {} but policy does not allow changing it",
                    entry.key,
                    entry.classification
                );
                executed.push(Executed::idle(index, entry, Outcome::Skipped));
            }
        }

        for phase in [
            Classification::ToCreate,
            Classification::ToUpdate,
            Classification::ToDelete,
        ] {
            if !permissions.allows(phase) {
                continue;
            }

            let entries: Vec<(usize, &DiffEntry)> = plan
                .entries()
                .iter()
                .enumerate()
                .filter(|(_, e)| e.classification == phase)
                .collect();
            if entries.is_empty() {
                continue;
            }

            let operations: Vec<_> = entries
                .into_iter()
                .map(|(index, entry)| self.execute(index, entry, target, cancel, progress))
                .collect();
            let results: Vec<Executed> = stream::iter(operations)
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            executed.extend(results);
        }

        executed.sort_by_key(|e| e.index);

        let mut resources = Vec::with_capacity(executed.len());
        let mut errors = Vec::new();
        for item in executed {
            match (item.outcome.classification, item.outcome.outcome) {
                (Classification::ToCreate, Outcome::Applied) => counts.created += 1,
                (Classification::ToUpdate, Outcome::Applied) => counts.updated += 1,
                (_, Outcome::Deleted) | (_, Outcome::AlreadyAbsent) => counts.deleted += 1,
                (_, Outcome::Skipped) => counts.skipped += 1,
                (_, Outcome::NotStarted) => counts.not_started += 1,
                (_, Outcome::Failed) => counts.failed += 1,
                _ => {}
            }
            resources.push(item.outcome);
            errors.extend(item.error);
        }

        self.remember_namespaces(desired, &resources);

        let cancelled = counts.not_started > 0;
        let state = if !errors.is_empty() {
            SyncState::Error
        } else if cancelled || counts.skipped > 0 {
            SyncState::OutOfSync
        } else {
            SyncState::InSync
        };

        let result = SyncResult {
            sync_id: progress.sync_id().to_string(),
            application: self.application.clone(),
            revision: desired.revision.clone(),
            trigger,
            started_at,
            finished_at: Utc::now(),
            state,
            counts,
            resources,
            errors,
            cancelled,
            message: None,
        };

        let summary = format!(
            "{}: {} created, {} updated, {} deleted, {} skipped, {} failed",
            state, counts.created, counts.updated, counts.deleted, counts.skipped, counts.failed
        );
        if cancelled {
            log::info!(
                "Sync of {} at {} superseded; {} operations not started",
                self.application,
                desired.revision.short(),
                counts.not_started
            );
            progress.cancelled(&summary);
        } else {
            log::info!(
                "Sync of {} at {} finished. {}",
                self.application,
                desired.revision.short(),
                summary
            );
            progress.completed(desired.revision.as_str(), &summary);
        }

        Ok(result)
    }

    /// Namespaces holding managed resources after the last pass.
    pub fn managed_namespaces(&self) -> Vec<String> {
        self.namespaces_lock().iter().cloned().collect()
    }

    fn namespaces_lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.managed_namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keeps the namespaces of the snapshot plus those of any leftover that
    /// was not removed, so a later pass still lists them.
    fn remember_namespaces(&self, desired: &DesiredState, resources: &[ResourceOutcome]) {
        let leftovers = resources
            .iter()
            .filter(|r| r.classification == Classification::ToDelete)
            .filter(|r| !matches!(r.outcome, Outcome::Deleted | Outcome::AlreadyAbsent))
            .map(|r| r.key.namespace.clone());

        *self.namespaces_lock() = desired.namespaces().into_iter().chain(leftovers).collect();
    }

    /// Lists every namespace the snapshot touches plus the namespaces the
    /// previous pass left managed resources in.
    async fn list_live(
        &self,
        desired: &DesiredState,
        target: &dyn TargetEnvironment,
    ) -> Result<Vec<ResourceDefinition>> {
        let mut namespaces: BTreeSet<String> = desired.namespaces().into_iter().collect();
        namespaces.extend(self.namespaces_lock().iter().cloned());

        let mut live = Vec::new();
        for namespace in namespaces {
            let (result, _) = self.retry_operation(|| target.list(&namespace)).await;
            live.extend(result?);
        }
        Ok(live)
    }

    async fn execute(
        &self,
        index: usize,
        entry: &DiffEntry,
        target: &dyn TargetEnvironment,
        cancel: &SyncCancellation,
        progress: &SyncProgress,
    ) -> Executed {
        if cancel.is_cancelled() {
            return Executed::idle(index, entry, Outcome::NotStarted);
        }

        let (operation, result, attempts) = match (entry.classification, &entry.desired) {
            (Classification::ToDelete, _) => {
                let (result, attempts) = self.retry_operation(|| target.delete(&entry.key)).await;
                (ResourceOperation::Delete, result, attempts)
            }
            (classification, Some(definition)) => {
                let operation = if classification == Classification::ToCreate {
                    ResourceOperation::Create
                } else {
                    ResourceOperation::Update
                };
                let (result, attempts) = self.retry_operation(|| target.apply(definition)).await;
                (operation, result, attempts)
            }
            (_, None) => {
                // Create and update entries always carry a definition
                return Executed::idle(index, entry, Outcome::Unchanged);
            }
        };

        let (outcome, error) = match result {
            Ok(()) if operation == ResourceOperation::Delete => {
                progress.resource(&entry.key, "Deleted");
                (Outcome::Deleted, None)
            }
            Ok(()) => {
                progress.resource(&entry.key, "Applied");
                (Outcome::Applied, None)
            }
            Err(SyncError::DeleteNotFound(_)) if operation == ResourceOperation::Delete => {
                progress.resource(&entry.key, "Already absent");
                (Outcome::AlreadyAbsent, None)
            }
            Err(e) => {
                log::warn!(
                    "Failed to {:?} {} after {} attempt(s): {}",
                    operation,
                    entry.key,
                    attempts,
                    e
                );
                progress.resource_failed(&entry.key, &e.to_string());
                (
                    Outcome::Failed,
                    Some(ResourceError {
                        key: entry.key.clone(),
                        operation,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        attempts,
                    }),
                )
            }
        };

        Executed {
            index,
            outcome: ResourceOutcome {
                key: entry.key.clone(),
                classification: entry.classification,
                outcome,
                attempts,
            },
            error,
        }
    }

    /// Runs `op` until it succeeds, fails permanently or the retry limit is hit.
    ///
    /// Returns the last result and the number of attempts made.
    async fn retry_operation<T, F, Fut>(&self, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    log::warn!(
                        "Retryable error (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

impl Executed {
    /// An entry that issued no operation.
    fn idle(index: usize, entry: &DiffEntry, outcome: Outcome) -> Self {
        Self {
            index,
            outcome: ResourceOutcome {
                key: entry.key.clone(),
                classification: entry.classification,
                outcome,
                attempts: 0,
            },
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::resource::ObjectMeta;
    use crate::gitops::source::Destination;
    use crate::gitops::target::{InMemoryTarget, InjectedFailure, TargetOperation};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn deployment(name: &str, replicas: u32) -> ResourceDefinition {
        ResourceDefinition::new(
            "apps/v1",
            "Deployment",
            ObjectMeta::new(name).with_namespace("demo"),
            json!({ "replicas": replicas }),
        )
    }

    fn config_map(name: &str) -> ResourceDefinition {
        ResourceDefinition::new(
            "v1",
            "ConfigMap",
            ObjectMeta::new(name).with_namespace("demo"),
            json!({ "mode": "demo" }),
        )
    }

    fn desired(resources: Vec<ResourceDefinition>) -> DesiredState {
        DesiredState {
            revision: Revision::new("rev-1"),
            path: ".".to_string(),
            destination: Destination::new("https://kubernetes.default.svc", "demo"),
            resources,
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new("demo")
            .with_retry(RetryPolicy::immediate(3))
            .with_concurrency(4)
    }

    async fn run(
        reconciler: &Reconciler,
        state: &DesiredState,
        target: &InMemoryTarget,
        policy: SyncPolicy,
        trigger: SyncTrigger,
    ) -> SyncResult {
        reconciler
            .reconcile(
                state,
                target,
                &policy,
                trigger,
                &SyncCancellation::new(),
                &SyncProgress::detached("demo"),
            )
            .await
            .unwrap()
    }

    fn replicas(definition: &ResourceDefinition) -> u64 {
        definition.spec().unwrap()["replicas"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_creates_missing_and_is_idempotent() {
        let target = InMemoryTarget::new();
        let state = desired(vec![deployment("api", 2), config_map("settings")]);
        let r = reconciler();

        let first = run(&r, &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;
        assert_eq!(first.state, SyncState::InSync);
        assert_eq!(first.counts.created, 2);

        target.clear_calls().await;
        let second = run(&r, &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;
        assert_eq!(second.state, SyncState::InSync);
        assert_eq!(second.counts.in_sync, 2);
        assert_eq!(second.changes(), 0);
        assert!(target.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_self_heal_overwrites_drift() {
        let target = InMemoryTarget::new();
        target.insert_unmanaged(deployment("api", 1)).await;
        let state = desired(vec![deployment("api", 2)]);

        let result = run(&reconciler(), &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;

        assert_eq!(result.state, SyncState::InSync);
        assert_eq!(result.counts.updated, 1);
        let live = target
            .get(&ResourceKey::new("Deployment", "demo", "api"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replicas(&live), 2);
    }

    #[tokio::test]
    async fn test_drift_without_self_heal_is_reported() {
        let target = InMemoryTarget::new();
        target.insert_unmanaged(deployment("api", 1)).await;
        let state = desired(vec![deployment("api", 2)]);
        let policy = SyncPolicy::automated().with_self_heal(false);

        let result = run(&reconciler(), &state, &target, policy, SyncTrigger::Poll).await;

        assert_eq!(result.state, SyncState::OutOfSync);
        assert_eq!(result.counts.to_update, 1);
        assert_eq!(result.resources[0].outcome, Outcome::Skipped);
        let live = target
            .get(&ResourceKey::new("Deployment", "demo", "api"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replicas(&live), 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_updates_without_self_heal() {
        let target = InMemoryTarget::new();
        target.insert_unmanaged(deployment("api", 1)).await;
        let state = desired(vec![deployment("api", 2)]);
        let policy = SyncPolicy::automated().with_self_heal(false);

        let result = run(&reconciler(), &state, &target, policy, SyncTrigger::Manual).await;

        assert_eq!(result.state, SyncState::InSync);
        assert_eq!(result.counts.updated, 1);
    }

    #[tokio::test]
    async fn test_prune_deletes_orphans() {
        let target = InMemoryTarget::new();
        target.insert_unmanaged(config_map("old-config")).await;
        let state = desired(vec![deployment("api", 2)]);

        let result = run(&reconciler(), &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;

        assert_eq!(result.state, SyncState::InSync);
        assert_eq!(result.counts.deleted, 1);
        assert!(
            !target
                .contains(&ResourceKey::new("ConfigMap", "demo", "old-config"))
                .await
        );
    }

    #[tokio::test]
    async fn test_without_prune_orphans_remain() {
        let target = InMemoryTarget::new();
        target.insert_unmanaged(config_map("old-config")).await;
        let state = desired(vec![deployment("api", 2)]);
        let policy = SyncPolicy::automated().with_prune(false);

        let result = run(&reconciler(), &state, &target, policy, SyncTrigger::Manual).await;

        assert_eq!(result.state, SyncState::OutOfSync);
        assert_eq!(result.counts.to_delete, 1);
        assert!(
            target
                .contains(&ResourceKey::new("ConfigMap", "demo", "old-config"))
                .await
        );
    }

    #[tokio::test]
    async fn test_prune_reaches_namespace_dropped_from_source() {
        let target = InMemoryTarget::new();
        let reconciler = reconciler();
        let backend_config = ResourceDefinition::new(
            "v1",
            "ConfigMap",
            ObjectMeta::new("old").with_namespace("backend"),
            json!({ "mode": "backend" }),
        );
        let first = desired(vec![backend_config, deployment("api", 2)]);
        run(&reconciler, &first, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;
        assert_eq!(reconciler.managed_namespaces(), vec!["backend", "demo"]);

        let mut second = desired(vec![deployment("api", 2)]);
        second.revision = Revision::new("rev-2");
        let result = run(&reconciler, &second, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;

        assert_eq!(result.state, SyncState::InSync);
        assert_eq!(result.counts.to_delete, 1);
        assert_eq!(result.counts.deleted, 1);
        assert!(
            !target
                .contains(&ResourceKey::new("ConfigMap", "backend", "old"))
                .await
        );
        assert_eq!(reconciler.managed_namespaces(), vec!["demo"]);
    }

    #[tokio::test]
    async fn test_unpruned_namespace_stays_listed() {
        let target = InMemoryTarget::new();
        let reconciler = reconciler();
        let policy = SyncPolicy::automated().with_prune(false);
        let edge_config = ResourceDefinition::new(
            "v1",
            "ConfigMap",
            ObjectMeta::new("edge").with_namespace("edge"),
            json!({}),
        );
        run(&reconciler, &desired(vec![edge_config]), &target, policy, SyncTrigger::Poll).await;

        let result = run(&reconciler, &desired(vec![]), &target, policy, SyncTrigger::Poll).await;
        assert_eq!(result.state, SyncState::OutOfSync);
        assert_eq!(result.counts.to_delete, 1);
        assert_eq!(reconciler.managed_namespaces(), vec!["demo", "edge"]);

        let result = run(&reconciler, &desired(vec![]), &target, SyncPolicy::automated(), SyncTrigger::Poll).await;
        assert_eq!(result.counts.deleted, 1);
        assert_eq!(reconciler.managed_namespaces(), vec!["demo"]);
    }

    #[tokio::test]
    async fn test_rejected_resource_is_isolated() {
        let target = InMemoryTarget::new();
        let bad = ResourceKey::new("ConfigMap", "demo", "bad");
        target.fail_next(&bad, InjectedFailure::Rejected, 10).await;
        let state = desired(vec![config_map("bad"), deployment("api", 2), config_map("good")]);

        let result = run(&reconciler(), &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;

        assert_eq!(result.state, SyncState::Error);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].key, bad);
        assert_eq!(result.errors[0].kind, "ApplyRejectedError");
        // Rejections are not retried
        assert_eq!(result.errors[0].attempts, 1);
        assert_eq!(result.counts.created, 2);
        assert!(target.contains(&ResourceKey::new("ConfigMap", "demo", "good")).await);
        assert!(target.contains(&ResourceKey::new("Deployment", "demo", "api")).await);
    }

    #[tokio::test]
    async fn test_conflict_retried_until_success() {
        let target = InMemoryTarget::new();
        let key = ResourceKey::new("Deployment", "demo", "api");
        target.fail_next(&key, InjectedFailure::Conflict, 2).await;
        let state = desired(vec![deployment("api", 2)]);

        let result = run(&reconciler(), &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;

        assert_eq!(result.state, SyncState::InSync);
        assert_eq!(result.resources[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_conflict_exhausts_retries() {
        let target = InMemoryTarget::new();
        let key = ResourceKey::new("Deployment", "demo", "api");
        target.fail_next(&key, InjectedFailure::Timeout, 10).await;
        let state = desired(vec![deployment("api", 2)]);

        let result = run(&reconciler(), &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;

        assert_eq!(result.state, SyncState::Error);
        assert_eq!(result.errors[0].kind, "TimeoutError");
        // limit 3 means three retries after the first attempt
        assert_eq!(result.errors[0].attempts, 4);
    }

    #[tokio::test]
    async fn test_phase_order_is_create_update_delete() {
        let target = InMemoryTarget::new();
        target.insert_unmanaged(deployment("api", 1)).await;
        target.insert_unmanaged(config_map("old-config")).await;
        let state = desired(vec![deployment("api", 3), config_map("new-config")]);

        run(&reconciler(), &state, &target, SyncPolicy::automated(), SyncTrigger::Poll).await;

        let calls = target.calls().await;
        let order: Vec<(TargetOperation, String)> = calls
            .iter()
            .map(|c| (c.operation, c.key.name.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (TargetOperation::Apply, "new-config".to_string()),
                (TargetOperation::Apply, "api".to_string()),
                (TargetOperation::Delete, "old-config".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_refresh_only_without_automation() {
        let target = InMemoryTarget::new();
        let state = desired(vec![deployment("api", 2)]);
        let policy = SyncPolicy::default().with_prune(true).with_self_heal(true);

        let refreshed = run(&reconciler(), &state, &target, policy, SyncTrigger::Poll).await;
        assert_eq!(refreshed.state, SyncState::OutOfSync);
        assert_eq!(refreshed.counts.to_create, 1);
        assert!(target.calls().await.is_empty());

        let applied = run(&reconciler(), &state, &target, policy, SyncTrigger::Manual).await;
        assert_eq!(applied.state, SyncState::InSync);
        assert_eq!(applied.counts.created, 1);
    }

    #[tokio::test]
    async fn test_cancelled_pass_starts_nothing() {
        let target = InMemoryTarget::new();
        let state = desired(vec![deployment("api", 2), config_map("settings")]);
        let cancel = SyncCancellation::new();
        cancel.cancel();

        let result = reconciler()
            .reconcile(
                &state,
                &target,
                &SyncPolicy::automated(),
                SyncTrigger::Poll,
                &cancel,
                &SyncProgress::detached("demo"),
            )
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.state, SyncState::OutOfSync);
        assert_eq!(result.counts.not_started, 2);
        assert!(result
            .resources
            .iter()
            .all(|r| r.outcome == Outcome::NotStarted));
        assert!(target.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_call_is_skipped() {
        let target = Arc::new(InMemoryTarget::new().with_latency(Duration::from_millis(200)));
        let state = desired(vec![deployment("api", 2)]);
        let r = Arc::new(reconciler());

        let first = {
            let (r, target, state) = (r.clone(), target.clone(), state.clone());
            tokio::spawn(async move {
                r.reconcile(
                    &state,
                    target.as_ref(),
                    &SyncPolicy::automated(),
                    SyncTrigger::Poll,
                    &SyncCancellation::new(),
                    &SyncProgress::detached("demo"),
                )
                .await
                .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = run(&r, &state, &target, SyncPolicy::automated(), SyncTrigger::Manual).await;
        assert!(second.is_concurrent_skip());
        assert!(second.resources.is_empty());

        let first = first.await.unwrap();
        assert_eq!(first.state, SyncState::InSync);
        assert_eq!(target.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_result_serializes_camel_case() {
        let target = InMemoryTarget::new();
        let state = desired(vec![deployment("api", 2)]);
        let result = run(&reconciler(), &state, &target, SyncPolicy::automated(), SyncTrigger::Manual).await;

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "InSync");
        assert_eq!(json["counts"]["toCreate"], 1);
        assert_eq!(json["trigger"]["type"], "manual");
        assert_eq!(json["resources"][0]["outcome"], "applied");
    }
}
