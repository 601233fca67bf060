//! In-memory target environment.
//!
//! Backs dry runs and tests. Failures can be scripted per key, and
//! out-of-band edits simulate someone changing the cluster by hand.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use super::TargetEnvironment;
use crate::gitops::error::{Result, SyncError};
use crate::gitops::resource::{ResourceDefinition, ResourceKey};

/// Failure to return from the next operation on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Conflict,
    Timeout,
    Rejected,
}

/// Kind of mutating call made against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOperation {
    Apply,
    Delete,
}

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCall {
    pub operation: TargetOperation,
    pub key: ResourceKey,
    pub succeeded: bool,
}

#[derive(Default)]
struct State {
    resources: BTreeMap<ResourceKey, ResourceDefinition>,
    failures: HashMap<ResourceKey, VecDeque<InjectedFailure>>,
    calls: Vec<TargetCall>,
    next_version: u64,
}

/// Thread-safe in-memory live resource set.
#[derive(Default)]
pub struct InMemoryTarget {
    state: Mutex<State>,
    latency: Duration,
}

impl InMemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every mutating call, to make concurrent passes observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inserts or replaces a resource without going through `apply`.
    ///
    /// Not recorded in the call log.
    pub async fn insert_unmanaged(&self, definition: ResourceDefinition) {
        let mut state = self.state.lock().await;
        state.resources.insert(definition.key(), definition);
    }

    /// Removes a resource without going through `delete`.
    pub async fn remove_unmanaged(&self, key: &ResourceKey) -> Option<ResourceDefinition> {
        self.state.lock().await.resources.remove(key)
    }

    /// Makes the next `times` operations on `key` fail with `failure`.
    pub async fn fail_next(&self, key: &ResourceKey, failure: InjectedFailure, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(key.clone()).or_default();
        for _ in 0..times {
            queue.push_back(failure);
        }
    }

    /// Snapshot of all live resources.
    pub async fn snapshot(&self) -> Vec<ResourceDefinition> {
        self.state.lock().await.resources.values().cloned().collect()
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        self.state.lock().await.resources.contains_key(key)
    }

    /// Every mutating call made so far, in order.
    pub async fn calls(&self) -> Vec<TargetCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    fn injected_error(key: &ResourceKey, failure: InjectedFailure) -> SyncError {
        match failure {
            InjectedFailure::Conflict => SyncError::ApplyConflict {
                key: key.clone(),
                message: "the object has been modified; please apply your changes to the latest version".to_string(),
            },
            InjectedFailure::Timeout => SyncError::Timeout {
                key: key.clone(),
                message: "request timed out".to_string(),
            },
            InjectedFailure::Rejected => SyncError::ApplyRejected {
                key: key.clone(),
                message: "admission webhook denied the request".to_string(),
            },
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl TargetEnvironment for InMemoryTarget {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceDefinition>> {
        Ok(self.state.lock().await.resources.get(key).cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<ResourceDefinition>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .values()
            .filter(|d| d.namespace() == namespace)
            .cloned()
            .collect())
    }

    async fn apply(&self, definition: &ResourceDefinition) -> Result<()> {
        self.simulate_latency().await;

        let key = definition.key();
        let mut state = self.state.lock().await;

        if let Some(failure) = state.failures.get_mut(&key).and_then(|q| q.pop_front()) {
            state.calls.push(TargetCall {
                operation: TargetOperation::Apply,
                key: key.clone(),
                succeeded: false,
            });
            return Err(Self::injected_error(&key, failure));
        }

        state.next_version += 1;
        let version = state.next_version;

        let mut stored = definition.clone();
        let created_at = state
            .resources
            .get(&key)
            .and_then(|existing| existing.metadata.server_fields.get("creationTimestamp"))
            .cloned()
            .unwrap_or_else(|| serde_json::Value::String(Utc::now().to_rfc3339()));
        stored
            .metadata
            .server_fields
            .insert("creationTimestamp".to_string(), created_at);
        stored.metadata.server_fields.insert(
            "resourceVersion".to_string(),
            serde_json::Value::String(version.to_string()),
        );

        state.resources.insert(key.clone(), stored);
        state.calls.push(TargetCall {
            operation: TargetOperation::Apply,
            key,
            succeeded: true,
        });
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.simulate_latency().await;

        let mut state = self.state.lock().await;

        if let Some(failure) = state.failures.get_mut(key).and_then(|q| q.pop_front()) {
            state.calls.push(TargetCall {
                operation: TargetOperation::Delete,
                key: key.clone(),
                succeeded: false,
            });
            return Err(Self::injected_error(key, failure));
        }

        let removed = state.resources.remove(key).is_some();
        state.calls.push(TargetCall {
            operation: TargetOperation::Delete,
            key: key.clone(),
            succeeded: removed,
        });

        if removed {
            Ok(())
        } else {
            Err(SyncError::DeleteNotFound(key.clone()))
        }
    }
}
