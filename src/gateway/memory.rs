use super::CommandGateway;
use crate::core::{
    Command, CommandId, CommandKind, CommandStatus, EngineError, GatewayError, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Scripted outcome applied once a command has been fetched enough times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledResolution {
    after_fetches: u32,
    status: CommandStatus,
}

struct SimulatedCommand {
    command: Command,
    fetches: u32,
    fetch_failures: VecDeque<GatewayError>,
    scheduled: Option<ScheduledResolution>,
}

#[derive(Default)]
struct SimulatorState {
    commands: HashMap<CommandId, SimulatedCommand>,
    dispatch_failures: VecDeque<GatewayError>,
    dispatch_calls: u64,
    auto_resolution: Option<ScheduledResolution>,
}

/// An in-memory control plane implementing `CommandGateway`.
///
/// Commands stay pending until resolved explicitly or by a scripted
/// resolution. Used by the simulator binary and the test suite.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<SimulatorState>>,
}

impl InMemoryGateway {
    /// Creates a new, empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next dispatch call fail with `error`.
    pub async fn fail_next_dispatch(&self, error: GatewayError) {
        let mut state = self.state.lock().await;
        state.dispatch_failures.push_back(error);
    }

    /// Resolves every future command with `status` on its `after_fetches`-th fetch.
    pub async fn auto_resolve_after(&self, after_fetches: u32, status: CommandStatus) {
        let mut state = self.state.lock().await;
        state.auto_resolution = Some(ScheduledResolution {
            after_fetches,
            status,
        });
    }

    /// Resolves one command with `status` on its `after_fetches`-th fetch.
    pub async fn resolve_after(
        &self,
        id: &CommandId,
        after_fetches: u32,
        status: CommandStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let simulated = state
            .commands
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        simulated.scheduled = Some(ScheduledResolution {
            after_fetches,
            status,
        });
        Ok(())
    }

    /// Marks a command as handled by the control plane.
    pub async fn resolve(&self, id: &CommandId, status: CommandStatus) -> Result<()> {
        self.resolve_with_metadata(id, status, BTreeMap::new()).await
    }

    pub async fn resolve_with_metadata(
        &self,
        id: &CommandId,
        status: CommandStatus,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let simulated = state
            .commands
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        let command = &mut simulated.command;
        command.metadata.extend(metadata);
        *command = command.clone().with_status(status, Utc::now());
        Ok(())
    }

    /// Queues fetch failures returned before the command is served again.
    pub async fn fail_fetches(
        &self,
        id: &CommandId,
        errors: impl IntoIterator<Item = GatewayError>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let simulated = state
            .commands
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        simulated.fetch_failures.extend(errors);
        Ok(())
    }

    /// Drops a command from the control plane; later fetches report `NotFound`.
    pub async fn forget(&self, id: &CommandId) {
        let mut state = self.state.lock().await;
        state.commands.remove(id);
    }

    pub async fn dispatch_calls(&self) -> u64 {
        self.state.lock().await.dispatch_calls
    }

    pub async fn fetch_calls(&self, id: &CommandId) -> u32 {
        let state = self.state.lock().await;
        state
            .commands
            .get(id)
            .map(|simulated| simulated.fetches)
            .unwrap_or_default()
    }

    pub async fn command(&self, id: &CommandId) -> Option<Command> {
        let state = self.state.lock().await;
        state.commands.get(id).map(|simulated| simulated.command.clone())
    }
}

#[async_trait]
impl CommandGateway for InMemoryGateway {
    async fn dispatch(
        &self,
        kind: CommandKind,
        target_entity_id: &str,
        _params: &serde_json::Value,
        commander: Option<&str>,
    ) -> std::result::Result<CommandId, GatewayError> {
        let mut state = self.state.lock().await;
        state.dispatch_calls += 1;

        if let Some(error) = state.dispatch_failures.pop_front() {
            return Err(error);
        }

        let id = CommandId::new(Uuid::new_v4().to_string());
        let mut command = Command::pending(id.clone(), kind, target_entity_id, Utc::now());
        command.commander = commander.map(str::to_string);

        let scheduled = state.auto_resolution;
        state.commands.insert(
            id.clone(),
            SimulatedCommand {
                command,
                fetches: 0,
                fetch_failures: VecDeque::new(),
                scheduled,
            },
        );
        Ok(id)
    }

    async fn fetch_command(&self, id: &CommandId) -> std::result::Result<Command, GatewayError> {
        if Uuid::parse_str(id.as_str()).is_err() {
            return Err(GatewayError::InvalidCommandId(id.to_string()));
        }

        let mut state = self.state.lock().await;
        let simulated = state
            .commands
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        simulated.fetches += 1;

        if let Some(error) = simulated.fetch_failures.pop_front() {
            return Err(error);
        }

        if let Some(scheduled) = simulated.scheduled {
            if simulated.fetches >= scheduled.after_fetches && !simulated.command.is_terminal() {
                simulated.command = simulated
                    .command
                    .clone()
                    .with_status(scheduled.status, Utc::now());
                simulated.scheduled = None;
            }
        }

        Ok(simulated.command.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_mints_uuid_ids() {
        let gateway = InMemoryGateway::new();
        let id = gateway
            .dispatch(CommandKind::SyncApplication, "app-1", &json!({}), Some("alice"))
            .await
            .unwrap();

        assert!(Uuid::parse_str(id.as_str()).is_ok());
        let command = gateway.fetch_command(&id).await.unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.commander.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn scheduled_resolution_applies_on_nth_fetch() {
        let gateway = InMemoryGateway::new();
        gateway
            .auto_resolve_after(2, CommandStatus::Succeeded)
            .await;
        let id = gateway
            .dispatch(CommandKind::CancelDeployment, "dep-1", &json!({}), None)
            .await
            .unwrap();

        assert_eq!(
            gateway.fetch_command(&id).await.unwrap().status,
            CommandStatus::Pending
        );
        assert_eq!(
            gateway.fetch_command(&id).await.unwrap().status,
            CommandStatus::Succeeded
        );
        assert_eq!(gateway.fetch_calls(&id).await, 2);
    }

    #[tokio::test]
    async fn malformed_and_unknown_ids_are_distinguished() {
        let gateway = InMemoryGateway::new();
        let malformed = gateway.fetch_command(&CommandId::new("nope")).await;
        assert!(matches!(malformed, Err(GatewayError::InvalidCommandId(_))));

        let unknown = CommandId::new(Uuid::new_v4().to_string());
        let missing = gateway.fetch_command(&unknown).await.unwrap_err();
        assert!(missing.is_transient());
    }

    #[tokio::test]
    async fn queued_dispatch_failure_is_returned_once() {
        let gateway = InMemoryGateway::new();
        gateway
            .fail_next_dispatch(GatewayError::Rejected("bad params".to_string()))
            .await;

        assert!(gateway
            .dispatch(CommandKind::ApproveStage, "stage-1", &json!({}), None)
            .await
            .is_err());
        assert!(gateway
            .dispatch(CommandKind::ApproveStage, "stage-1", &json!({}), None)
            .await
            .is_ok());
        assert_eq!(gateway.dispatch_calls().await, 2);
    }
}
