//! Sync policy, retry policy and trigger types.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Policy options governing what a sync pass is allowed to change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Delete live resources absent from the source.
    pub prune: bool,
    /// Overwrite live resources that drifted from the source.
    pub self_heal: bool,
    /// Run without a manual trigger.
    pub automated: bool,
}

impl SyncPolicy {
    /// Fully automated policy with prune and self-heal.
    pub fn automated() -> Self {
        Self {
            prune: true,
            self_heal: true,
            automated: true,
        }
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_self_heal(mut self, self_heal: bool) -> Self {
        self.self_heal = self_heal;
        self
    }
}

/// Bounded exponential backoff for transient per-resource failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub limit: u32,
    /// Delay before the first retry.
    pub duration: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub factor: u32,
    /// Upper bound for a single delay.
    pub max_duration: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            duration: Duration::from_secs(5),
            factor: 2,
            max_duration: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    /// Retry policy without delays, for tests and dry runs.
    pub fn immediate(limit: u32) -> Self {
        Self {
            limit,
            duration: Duration::ZERO,
            factor: 1,
            max_duration: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.duration
            .saturating_mul(multiplier)
            .min(self.max_duration)
    }

    /// Total number of attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.limit.saturating_add(1)
    }
}

/// What started a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncTrigger {
    /// The poll timer fired.
    Poll,
    /// A push notification; `revision` names the new revision if known.
    Webhook {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<String>,
    },
    /// An operator asked for a sync.
    Manual,
}

impl SyncTrigger {
    pub fn is_manual(&self) -> bool {
        matches!(self, SyncTrigger::Manual)
    }

    /// Revision announced by a webhook, if any.
    pub fn revision(&self) -> Option<&str> {
        match self {
            SyncTrigger::Webhook { revision } => revision.as_deref(),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTrigger::Poll => write!(f, "poll"),
            SyncTrigger::Webhook { .. } => write!(f, "webhook"),
            SyncTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Cancellation flag shared between a sync pass and whoever supersedes it.
///
/// Cancelling never interrupts an operation that already started; it only
/// prevents further operations from starting.
#[derive(Debug, Clone, Default)]
pub struct SyncCancellation {
    cancelled: Arc<AtomicBool>,
}

impl SyncCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
