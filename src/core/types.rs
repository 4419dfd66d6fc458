use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Correlation id minted by the gateway at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Class of entity a command acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityClass {
    Application,
    Deployment,
    Stage,
    Piped,
    Project,
}

/// Operation type of a command.
///
/// The kind selects the pending registry a command feeds and tells consumers
/// how to read the metadata returned on resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandKind {
    SyncApplication,
    UpdateApplicationConfig,
    CancelDeployment,
    ApproveStage,
    BuildPlanPreview,
    ChainSyncApplication,
    SkipStage,
    RestartPiped,
    CancelPlanPreview,
    GenerateSealedSecret,
}

impl CommandKind {
    pub const ALL: [CommandKind; 10] = [
        CommandKind::SyncApplication,
        CommandKind::UpdateApplicationConfig,
        CommandKind::CancelDeployment,
        CommandKind::ApproveStage,
        CommandKind::BuildPlanPreview,
        CommandKind::ChainSyncApplication,
        CommandKind::SkipStage,
        CommandKind::RestartPiped,
        CommandKind::CancelPlanPreview,
        CommandKind::GenerateSealedSecret,
    ];

    pub fn entity_class(self) -> EntityClass {
        match self {
            Self::SyncApplication
            | Self::UpdateApplicationConfig
            | Self::ChainSyncApplication
            | Self::GenerateSealedSecret => EntityClass::Application,
            Self::CancelDeployment => EntityClass::Deployment,
            Self::ApproveStage | Self::SkipStage => EntityClass::Stage,
            Self::RestartPiped | Self::BuildPlanPreview | Self::CancelPlanPreview => {
                EntityClass::Piped
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncApplication => "SyncApplication",
            Self::UpdateApplicationConfig => "UpdateApplicationConfig",
            Self::CancelDeployment => "CancelDeployment",
            Self::ApproveStage => "ApproveStage",
            Self::BuildPlanPreview => "BuildPlanPreview",
            Self::ChainSyncApplication => "ChainSyncApplication",
            Self::SkipStage => "SkipStage",
            Self::RestartPiped => "RestartPiped",
            Self::CancelPlanPreview => "CancelPlanPreview",
            Self::GenerateSealedSecret => "GenerateSealedSecret",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Not handled yet by the control plane.
    Pending,
    Succeeded,
    Failed,
    /// The control plane gave up waiting for the command to be handled.
    TimedOut,
    /// The engine stopped tracking the command without learning its outcome.
    Abandoned,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Statuses only move out of `Pending`, and only once.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        self == Self::Pending && next != Self::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Abandoned => "Abandoned",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a pending registry entry: one operation kind on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: CommandKind,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(kind: CommandKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.entity_id)
    }
}

/// Correlation record for one asynchronous remote action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    pub target_entity_id: String,
    pub status: CommandStatus,
    pub commander: Option<String>,
    /// Kind-specific output, e.g. the deployment a sync triggered.
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff the status is terminal.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn pending(
        id: impl Into<CommandId>,
        kind: CommandKind,
        target_entity_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            target_entity_id: target_entity_id.into(),
            status: CommandStatus::Pending,
            commander: None,
            metadata: BTreeMap::new(),
            created_at,
            updated_at: created_at,
            resolved_at: None,
        }
    }

    pub fn with_commander(mut self, commander: impl Into<String>) -> Self {
        self.commander = Some(commander.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Copy of this command moved to `status` at `at`.
    ///
    /// A pending status clears `resolved_at`; any other status sets it.
    pub fn with_status(mut self, status: CommandStatus, at: DateTime<Utc>) -> Self {
        self.status = status;
        self.updated_at = at;
        self.resolved_at = status.is_terminal().then_some(at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.target_entity_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_out_of_pending_once() {
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Succeeded));
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Abandoned));
        assert!(!CommandStatus::Pending.can_transition_to(CommandStatus::Pending));
        assert!(!CommandStatus::Succeeded.can_transition_to(CommandStatus::Pending));
        assert!(!CommandStatus::Failed.can_transition_to(CommandStatus::Succeeded));
    }

    #[test]
    fn with_status_tracks_resolved_at() {
        let now = Utc::now();
        let command = Command::pending("c-1", CommandKind::SyncApplication, "app-1", now);
        assert!(command.resolved_at.is_none());

        let done = command.with_status(CommandStatus::Failed, now);
        assert_eq!(done.resolved_at, Some(now));
        assert!(done.is_terminal());
    }

    #[test]
    fn kinds_map_to_entity_classes() {
        assert_eq!(
            CommandKind::CancelDeployment.entity_class(),
            EntityClass::Deployment
        );
        assert_eq!(CommandKind::SkipStage.entity_class(), EntityClass::Stage);
        assert_eq!(CommandKind::ALL.len(), 10);
    }

    #[test]
    fn command_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&CommandId::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }
}
