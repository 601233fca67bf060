//! Sync pass progress tracking for real-time status updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::resource::ResourceKey;

/// Phase of a sync pass reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventPhase {
    /// Desired state was fetched; the pass is starting.
    Started,
    /// Live state was listed and diffed against the desired state.
    Planned,
    /// A single resource operation finished (successfully or not).
    Resource,
    /// Pass finished and produced a result.
    Completed,
    /// Pass aborted before any mutation (fetch or list failure).
    Failed,
    /// Pass was superseded by a newer revision.
    Cancelled,
}

impl std::fmt::Display for SyncEventPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncEventPhase::Started => write!(f, "Starting..."),
            SyncEventPhase::Planned => write!(f, "Planned"),
            SyncEventPhase::Resource => write!(f, "Resource"),
            SyncEventPhase::Completed => write!(f, "Completed"),
            SyncEventPhase::Failed => write!(f, "Failed"),
            SyncEventPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A sync progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    /// Unique identifier for this pass.
    pub sync_id: String,
    /// Application being synced.
    pub application: String,
    pub phase: SyncEventPhase,
    /// Human-readable status message.
    pub message: String,
    /// Resource this event is about, for `Resource` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ResourceKey>,
    /// Revision being synced, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncEvent {
    pub fn new(sync_id: &str, application: &str, phase: SyncEventPhase, message: &str) -> Self {
        Self {
            sync_id: sync_id.to_string(),
            application: application.to_string(),
            phase,
            message: message.to_string(),
            key: None,
            revision: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: &ResourceKey) -> Self {
        self.key = Some(key.clone());
        self
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Tracks progress for a single sync pass.
#[derive(Clone)]
pub struct SyncProgress {
    sync_id: String,
    application: String,
    broadcaster: Arc<broadcast::Sender<SyncEvent>>,
}

impl SyncProgress {
    pub fn new(application: &str, broadcaster: Arc<broadcast::Sender<SyncEvent>>) -> Self {
        Self {
            sync_id: Uuid::new_v4().to_string(),
            application: application.to_string(),
            broadcaster,
        }
    }

    /// Progress tracker with no subscribers.
    pub fn detached(application: &str) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(application, Arc::new(sender))
    }

    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    fn send(&self, event: SyncEvent) {
        // No active receivers is fine
        let _ = self.broadcaster.send(event);
    }

    fn event(&self, phase: SyncEventPhase, message: &str) -> SyncEvent {
        SyncEvent::new(&self.sync_id, &self.application, phase, message)
    }

    pub fn started(&self, message: &str) {
        self.send(self.event(SyncEventPhase::Started, message));
    }

    pub fn planned(&self, revision: &str, message: &str) {
        self.send(
            self.event(SyncEventPhase::Planned, message)
                .with_revision(revision),
        );
    }

    pub fn resource(&self, key: &ResourceKey, message: &str) {
        self.send(self.event(SyncEventPhase::Resource, message).with_key(key));
    }

    pub fn resource_failed(&self, key: &ResourceKey, error: &str) {
        self.send(
            self.event(SyncEventPhase::Resource, "Operation failed")
                .with_key(key)
                .with_error(error),
        );
    }

    pub fn completed(&self, revision: &str, message: &str) {
        self.send(
            self.event(SyncEventPhase::Completed, message)
                .with_revision(revision),
        );
    }

    pub fn failed(&self, error: &str) {
        self.send(
            self.event(SyncEventPhase::Failed, "Sync failed")
                .with_error(error),
        );
    }

    pub fn cancelled(&self, message: &str) {
        self.send(self.event(SyncEventPhase::Cancelled, message));
    }
}
