use crate::core::{Command, CommandId, CommandStatus, DispatchError, EntityKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Result of applying a terminal status to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreResolution {
    /// The command is unknown (never dispatched here, or evicted).
    NotTracked,
    /// The command already reached a terminal status; nothing changed.
    AlreadyTerminal(CommandStatus),
    /// The command moved from `Pending` to a terminal status.
    Resolved(Command),
}

/// Keyed collection of known commands.
///
/// Invariant: a command id is outstanding iff the stored command is
/// `Pending`, and every outstanding id appears in the pending index under its
/// `(kind, target)` key.
#[derive(Debug, Default)]
pub struct CommandStore {
    commands: HashMap<CommandId, Command>,
    pending_index: HashMap<EntityKey, BTreeSet<CommandId>>,
    outstanding: BTreeSet<CommandId>,
    fetch_failures: HashMap<CommandId, u32>,
}

impl CommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, id: &CommandId) -> Option<&Command> {
        self.commands.get(id)
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.commands.contains_key(id)
    }

    /// Inserts a freshly dispatched command.
    pub fn insert_pending(&mut self, command: Command) -> Result<(), DispatchError> {
        if self.commands.contains_key(&command.id) {
            return Err(DispatchError::DuplicateCommandId(command.id));
        }

        let mut command = command;
        command.status = CommandStatus::Pending;
        command.resolved_at = None;

        self.pending_index
            .entry(command.key())
            .or_default()
            .insert(command.id.clone());
        self.outstanding.insert(command.id.clone());
        self.commands.insert(command.id.clone(), command);
        Ok(())
    }

    /// Refreshes a still-pending command from a poll result.
    ///
    /// Returns the stored status, or `None` if the command is not tracked.
    /// Terminal commands are left untouched.
    pub fn refresh_pending(
        &mut self,
        id: &CommandId,
        updated_at: DateTime<Utc>,
        metadata: &BTreeMap<String, String>,
    ) -> Option<CommandStatus> {
        let command = self.commands.get_mut(id)?;
        if command.status.is_terminal() {
            return Some(command.status);
        }

        if updated_at > command.updated_at {
            command.updated_at = updated_at;
        }
        command
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.fetch_failures.remove(id);
        Some(CommandStatus::Pending)
    }

    /// Moves a pending command to a terminal status.
    ///
    /// Applying a terminal status to an already terminal command is a no-op.
    pub fn resolve(
        &mut self,
        id: &CommandId,
        status: CommandStatus,
        resolved_at: DateTime<Utc>,
        metadata: &BTreeMap<String, String>,
    ) -> StoreResolution {
        let Some(command) = self.commands.get_mut(id) else {
            return StoreResolution::NotTracked;
        };

        if !command.status.can_transition_to(status) {
            return StoreResolution::AlreadyTerminal(command.status);
        }

        command.status = status;
        command.updated_at = resolved_at;
        command.resolved_at = Some(resolved_at);
        command
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        let resolved = command.clone();

        self.unlink_pending(&resolved.key(), id);
        StoreResolution::Resolved(resolved)
    }

    /// Whether any stored command for `key` is still pending.
    pub fn has_pending(&self, key: &EntityKey) -> bool {
        self.pending_index
            .get(key)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn pending_count(&self, key: &EntityKey) -> usize {
        self.pending_index.get(key).map_or(0, BTreeSet::len)
    }

    /// Snapshot of outstanding ids, in id order.
    pub fn outstanding_ids(&self) -> Vec<CommandId> {
        self.outstanding.iter().cloned().collect()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, id: &CommandId) -> bool {
        self.outstanding.contains(id)
    }

    /// Removes a command regardless of its status.
    pub fn evict(&mut self, id: &CommandId) -> Option<Command> {
        let command = self.commands.remove(id)?;
        self.unlink_pending(&command.key(), id);
        Some(command)
    }

    /// Removes terminal commands resolved strictly before `cutoff`.
    pub fn purge_resolved_before(&mut self, cutoff: DateTime<Utc>) -> Vec<CommandId> {
        let stale: Vec<CommandId> = self
            .commands
            .values()
            .filter(|command| command.resolved_at.is_some_and(|at| at < cutoff))
            .map(|command| command.id.clone())
            .collect();

        for id in &stale {
            self.commands.remove(id);
        }
        stale
    }

    /// Records one failed fetch and returns the consecutive failure count.
    pub fn record_fetch_failure(&mut self, id: &CommandId) -> u32 {
        let failures = self.fetch_failures.entry(id.clone()).or_default();
        *failures += 1;
        *failures
    }

    pub fn fetch_failures(&self, id: &CommandId) -> u32 {
        self.fetch_failures.get(id).copied().unwrap_or_default()
    }

    /// Commands recorded for `key`, oldest first.
    pub fn commands_for(&self, key: &EntityKey) -> Vec<Command> {
        let mut commands: Vec<Command> = self
            .commands
            .values()
            .filter(|command| command.kind == key.kind && command.target_entity_id == key.entity_id)
            .cloned()
            .collect();
        sort_by_creation(&mut commands);
        commands
    }

    /// All stored commands, oldest first.
    pub fn list(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self.commands.values().cloned().collect();
        sort_by_creation(&mut commands);
        commands
    }

    fn unlink_pending(&mut self, key: &EntityKey, id: &CommandId) {
        self.outstanding.remove(id);
        self.fetch_failures.remove(id);
        if let Some(ids) = self.pending_index.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                self.pending_index.remove(key);
            }
        }
    }
}

fn sort_by_creation(commands: &mut [Command]) {
    commands.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CommandKind;
    use chrono::Duration;

    fn pending(id: &str, kind: CommandKind, entity: &str) -> Command {
        Command::pending(id, kind, entity, Utc::now())
    }

    #[test]
    fn insert_tracks_outstanding_and_index() {
        let mut store = CommandStore::new();
        store
            .insert_pending(pending("c-1", CommandKind::SyncApplication, "app-1"))
            .unwrap();

        let key = EntityKey::new(CommandKind::SyncApplication, "app-1");
        assert!(store.has_pending(&key));
        assert_eq!(store.outstanding_ids(), vec![CommandId::new("c-1")]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut store = CommandStore::new();
        store
            .insert_pending(pending("c-1", CommandKind::SyncApplication, "app-1"))
            .unwrap();

        let err = store
            .insert_pending(pending("c-1", CommandKind::SyncApplication, "app-1"))
            .unwrap_err();
        assert_eq!(err, DispatchError::DuplicateCommandId(CommandId::new("c-1")));
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut store = CommandStore::new();
        let id = CommandId::new("c-1");
        store
            .insert_pending(pending("c-1", CommandKind::CancelDeployment, "dep-1"))
            .unwrap();

        let now = Utc::now();
        let first = store.resolve(&id, CommandStatus::Succeeded, now, &BTreeMap::new());
        assert!(matches!(first, StoreResolution::Resolved(_)));

        let second = store.resolve(&id, CommandStatus::Succeeded, now, &BTreeMap::new());
        assert_eq!(
            second,
            StoreResolution::AlreadyTerminal(CommandStatus::Succeeded)
        );

        let conflicting = store.resolve(&id, CommandStatus::Failed, now, &BTreeMap::new());
        assert_eq!(
            conflicting,
            StoreResolution::AlreadyTerminal(CommandStatus::Succeeded)
        );
        assert_eq!(store.get(&id).unwrap().status, CommandStatus::Succeeded);
        assert_eq!(store.outstanding_len(), 0);
    }

    #[test]
    fn overlapping_commands_keep_key_pending() {
        let mut store = CommandStore::new();
        let key = EntityKey::new(CommandKind::CancelDeployment, "dep-1");
        store
            .insert_pending(pending("c-1", CommandKind::CancelDeployment, "dep-1"))
            .unwrap();
        store
            .insert_pending(pending("c-2", CommandKind::CancelDeployment, "dep-1"))
            .unwrap();

        store.resolve(
            &CommandId::new("c-1"),
            CommandStatus::Failed,
            Utc::now(),
            &BTreeMap::new(),
        );
        assert!(store.has_pending(&key));
        assert_eq!(store.pending_count(&key), 1);

        store.resolve(
            &CommandId::new("c-2"),
            CommandStatus::Succeeded,
            Utc::now(),
            &BTreeMap::new(),
        );
        assert!(!store.has_pending(&key));
    }

    #[test]
    fn refresh_does_not_revert_terminal_command() {
        let mut store = CommandStore::new();
        let id = CommandId::new("c-1");
        store
            .insert_pending(pending("c-1", CommandKind::ApproveStage, "stage-1"))
            .unwrap();
        store.resolve(&id, CommandStatus::Failed, Utc::now(), &BTreeMap::new());

        let status = store.refresh_pending(&id, Utc::now(), &BTreeMap::new());
        assert_eq!(status, Some(CommandStatus::Failed));
        assert!(!store.is_outstanding(&id));
    }

    #[test]
    fn evict_drops_pending_command_from_outstanding() {
        let mut store = CommandStore::new();
        let id = CommandId::new("c-1");
        store
            .insert_pending(pending("c-1", CommandKind::SyncApplication, "app-1"))
            .unwrap();
        store.record_fetch_failure(&id);

        let evicted = store.evict(&id).unwrap();
        assert_eq!(evicted.status, CommandStatus::Pending);
        assert!(!store.is_outstanding(&id));
        assert_eq!(store.fetch_failures(&id), 0);
        assert!(store.evict(&id).is_none());
    }

    #[test]
    fn purge_only_removes_old_resolved_commands() {
        let mut store = CommandStore::new();
        let now = Utc::now();
        store
            .insert_pending(pending("old", CommandKind::SyncApplication, "app-1"))
            .unwrap();
        store
            .insert_pending(pending("fresh", CommandKind::SyncApplication, "app-2"))
            .unwrap();
        store
            .insert_pending(pending("open", CommandKind::SyncApplication, "app-3"))
            .unwrap();

        store.resolve(
            &CommandId::new("old"),
            CommandStatus::Succeeded,
            now - Duration::minutes(20),
            &BTreeMap::new(),
        );
        store.resolve(
            &CommandId::new("fresh"),
            CommandStatus::Succeeded,
            now,
            &BTreeMap::new(),
        );

        let purged = store.purge_resolved_before(now - Duration::minutes(10));
        assert_eq!(purged, vec![CommandId::new("old")]);
        assert_eq!(store.len(), 2);
        assert!(store.is_outstanding(&CommandId::new("open")));
    }
}
