//! Per-kind "operation in progress" flags derived from the command store.

use crate::core::{CommandKind, EntityKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A registry entry that flipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub kind: CommandKind,
    pub entity_id: String,
    pub pending: bool,
}

/// One map of entity id to pending flag per operation kind.
///
/// Entries are only written by the dispatcher (set) and the reconciler
/// (recompute). Readers must treat the flags as eventually consistent.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    kinds: HashMap<CommandKind, HashMap<String, bool>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, kind: CommandKind, entity_id: &str) -> bool {
        self.kinds
            .get(&kind)
            .and_then(|entities| entities.get(entity_id))
            .copied()
            .unwrap_or(false)
    }

    /// Writes an entry and reports the change if the visible value flipped.
    ///
    /// Only `true` entries are stored; clearing a flag removes the entry, so
    /// the map holds at most one entry per entity with work in flight.
    pub(crate) fn set(&mut self, key: &EntityKey, pending: bool) -> Option<PendingChange> {
        let previous = if pending {
            self.kinds
                .entry(key.kind)
                .or_default()
                .insert(key.entity_id.clone(), true)
                .unwrap_or(false)
        } else {
            let removed = self
                .kinds
                .get_mut(&key.kind)
                .and_then(|entities| entities.remove(&key.entity_id))
                .unwrap_or(false);
            if self.kinds.get(&key.kind).is_some_and(HashMap::is_empty) {
                self.kinds.remove(&key.kind);
            }
            removed
        };

        (previous != pending).then(|| PendingChange {
            kind: key.kind,
            entity_id: key.entity_id.clone(),
            pending,
        })
    }

    /// Entities of `kind` currently flagged, sorted.
    pub fn pending_entities(&self, kind: CommandKind) -> Vec<String> {
        let mut entities: Vec<String> = self
            .kinds
            .get(&kind)
            .map(|entities| {
                entities
                    .iter()
                    .filter(|(_, pending)| **pending)
                    .map(|(entity_id, _)| entity_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        entities.sort();
        entities
    }

    /// Number of stored entries across all kinds.
    pub fn entry_count(&self) -> usize {
        self.kinds.values().map(HashMap::len).sum()
    }

    pub fn pending_total(&self) -> usize {
        self.kinds
            .values()
            .map(|entities| entities.values().filter(|pending| **pending).count())
            .sum()
    }
}
