use super::{EngineEvent, EngineShared, SchedulerState};
use crate::core::{Command, CommandKind, DispatchError};
use crate::gateway::CommandGateway;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{Instrument, Level, event, info_span};

/// Sends actions to the gateway and records the resulting commands.
///
/// The dispatcher is the only writer of new commands and of registry entries
/// set to `true`. It returns as soon as the gateway has minted an id.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<EngineShared>,
    gateway: Arc<dyn CommandGateway>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<EngineShared>, gateway: Arc<dyn CommandGateway>) -> Self {
        Self { shared, gateway }
    }

    /// Dispatches `kind` against `target_entity_id`.
    ///
    /// `params` is handed to the gateway untouched. On failure nothing is
    /// stored and no pending flag is set.
    pub async fn dispatch(
        &self,
        kind: CommandKind,
        target_entity_id: &str,
        params: serde_json::Value,
        commander: Option<&str>,
    ) -> Result<Command, DispatchError> {
        if target_entity_id.trim().is_empty() {
            return Err(DispatchError::InvalidTarget(format!(
                "{} requires a non-empty target entity id",
                kind
            )));
        }
        if self.shared.state.lock().await.stopped {
            return Err(DispatchError::Stopped);
        }

        let span = info_span!("engine.dispatch", kind = %kind, entity = %target_entity_id);
        self.dispatch_inner(kind, target_entity_id, &params, commander)
            .instrument(span)
            .await
    }

    async fn dispatch_inner(
        &self,
        kind: CommandKind,
        target_entity_id: &str,
        params: &serde_json::Value,
        commander: Option<&str>,
    ) -> Result<Command, DispatchError> {
        let dispatch_timeout = self.shared.config.dispatch_timeout;
        let call = self
            .gateway
            .dispatch(kind, target_entity_id, params, commander);

        let id = match timeout(dispatch_timeout, call).await {
            Ok(Ok(id)) if !id.is_empty() => id,
            Ok(Ok(_)) => return Err(self.fail(DispatchError::EmptyCommandId).await),
            Ok(Err(err)) => return Err(self.fail(DispatchError::Gateway(err)).await),
            Err(_) => return Err(self.fail(DispatchError::Timeout(dispatch_timeout)).await),
        };

        let mut command = Command::pending(id, kind, target_entity_id, self.shared.clock.now());
        if let Some(commander) = commander {
            command = command.with_commander(commander);
        }

        {
            let mut state = self.shared.state.lock().await;
            // Shutdown may have joined the poll worker while the gateway call was in flight.
            if state.stopped {
                state.counters.dispatch_failures += 1;
                event!(
                    Level::WARN,
                    command_id = %command.id,
                    "engine stopped during dispatch; command not tracked"
                );
                return Err(DispatchError::Stopped);
            }
            if let Err(err) = state.store.insert_pending(command.clone()) {
                state.counters.dispatch_failures += 1;
                event!(Level::ERROR, error = %err, "gateway reused a tracked command id");
                return Err(err);
            }
            if let Some(change) = state.registry.set(&command.key(), true) {
                self.shared.emit(EngineEvent::PendingChanged(change));
            }
            state.counters.dispatched += 1;
            self.shared.set_scheduler(&mut state, SchedulerState::Active);
        }
        self.shared.wake.notify_one();

        event!(Level::INFO, command_id = %command.id, "command dispatched");
        Ok(command)
    }

    async fn fail(&self, err: DispatchError) -> DispatchError {
        self.shared.state.lock().await.counters.dispatch_failures += 1;
        event!(Level::WARN, error = %err, "dispatch failed");
        err
    }
}
