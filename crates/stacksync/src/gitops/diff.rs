//! Structural diff between desired and live resource sets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::resource::{Comparison, ResourceDefinition, ResourceKey};

/// How a resource key relates desired state to live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Classification {
    /// In source, not in live.
    ToCreate,
    /// In both, specs differ.
    ToUpdate,
    /// In live, not in source.
    ToDelete,
    /// In both, specs equal.
    InSync,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::ToCreate => write!(f, "ToCreate"),
            Classification::ToUpdate => write!(f, "ToUpdate"),
            Classification::ToDelete => write!(f, "ToDelete"),
            Classification::InSync => write!(f, "InSync"),
        }
    }
}

/// One classified key with both sides of the comparison.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub key: ResourceKey,
    pub classification: Classification,
    pub desired: Option<ResourceDefinition>,
    pub live: Option<ResourceDefinition>,
}

/// Classified diff of a desired snapshot against a live snapshot.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    entries: Vec<DiffEntry>,
}

impl SyncPlan {
    /// Computes the symmetric diff keyed by (kind, namespace, name).
    ///
    /// Desired keys keep source order; keys only present live follow,
    /// sorted by key.
    pub fn compute(
        desired: &[ResourceDefinition],
        live: &[ResourceDefinition],
        comparison: Comparison,
    ) -> Self {
        let live_by_key: BTreeMap<ResourceKey, &ResourceDefinition> =
            live.iter().map(|d| (d.key(), d)).collect();
        let desired_keys: HashSet<ResourceKey> = desired.iter().map(|d| d.key()).collect();

        let mut entries = Vec::with_capacity(desired.len() + live.len());

        for definition in desired {
            let key = definition.key();
            let entry = match live_by_key.get(&key) {
                None => DiffEntry {
                    key,
                    classification: Classification::ToCreate,
                    desired: Some(definition.clone()),
                    live: None,
                },
                Some(current) => {
                    let classification = if definition.matches_live(current, comparison) {
                        Classification::InSync
                    } else {
                        Classification::ToUpdate
                    };
                    DiffEntry {
                        key,
                        classification,
                        desired: Some(definition.clone()),
                        live: Some((*current).clone()),
                    }
                }
            };
            entries.push(entry);
        }

        for (key, current) in &live_by_key {
            if !desired_keys.contains(key) {
                entries.push(DiffEntry {
                    key: key.clone(),
                    classification: Classification::ToDelete,
                    desired: None,
                    live: Some((*current).clone()),
                });
            }
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[DiffEntry] {
        &self.entries
    }

    /// Entries with the given classification, in plan order.
    pub fn of(&self, classification: Classification) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(move |e| e.classification == classification)
    }

    pub fn count(&self, classification: Classification) -> usize {
        self.of(classification).count()
    }

    /// True if any key is not in sync.
    pub fn has_drift(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.classification != Classification::InSync)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
