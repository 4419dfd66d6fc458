use crate::core::{Command, CommandId, CommandKind, GatewayError};
use async_trait::async_trait;

pub mod memory;

pub use memory::InMemoryGateway;

/// Remote control plane that executes actions and reports their status.
///
/// Transport, authentication and wire format live behind this trait.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    /// Submits an action and returns the correlation id minted for it.
    async fn dispatch(
        &self,
        kind: CommandKind,
        target_entity_id: &str,
        params: &serde_json::Value,
        commander: Option<&str>,
    ) -> Result<CommandId, GatewayError>;

    /// Fetches the current state of a previously dispatched command.
    ///
    /// `NotFound` and `Unavailable` are retried; `InvalidCommandId` means the
    /// id can never resolve.
    async fn fetch_command(&self, id: &CommandId) -> Result<Command, GatewayError>;
}
