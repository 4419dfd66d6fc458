use super::types::CommandId;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`CommandGateway`](crate::gateway::CommandGateway).
///
/// Fetch failures are split into transient ones (retried on the next tick)
/// and permanent ones (the command can never be resolved remotely).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Command '{0}' not found")]
    NotFound(String),

    #[error("Action rejected: {0}")]
    Rejected(String),

    #[error("Invalid command id '{0}'")]
    InvalidCommandId(String),

    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Transient errors leave the command outstanding for the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::NotFound(_) | Self::Timeout(_)
        )
    }
}

/// The action never got a command id. No state was created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Dispatch failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway returned an empty command id")]
    EmptyCommandId,

    #[error("Command '{0}' is already tracked")]
    DuplicateCommandId(CommandId),

    #[error("Engine is stopped")]
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Poll worker error: {0}")]
    Worker(String),

    #[error("Command '{0}' not found")]
    NotFound(CommandId),
}

pub type Result<T> = std::result::Result<T, EngineError>;
