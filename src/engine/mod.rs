// Engine internals are split by role: the dispatcher creates commands, the
// reconciler resolves them, and the scheduler decides when to poll. All three
// share one `EngineShared` and mutate it only under its state lock.

pub mod dispatcher;
pub mod reconciler;
pub mod scheduler;

pub use dispatcher::Dispatcher;
pub use reconciler::{ABANDON_REASON_KEY, ReconcileOutcome, Reconciler};
pub use scheduler::{PollScheduler, SchedulerState, TickReport};

use crate::config::EngineConfig;
use crate::core::{Clock, Command, CommandId, CommandStatus, EntityKey, GatewayError};
use crate::registry::{PendingChange, PendingRegistry};
use crate::stats::EngineCounters;
use crate::store::{CommandStore, StoreResolution};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, broadcast};
use tracing::{Level, event};

/// Notifications published on the engine's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A registry entry flipped.
    PendingChanged(PendingChange),
    /// A command reached a terminal status.
    CommandResolved(Command),
    /// A fetch failed; transient failures keep the command outstanding.
    FetchFailed {
        command_id: CommandId,
        error: GatewayError,
        consecutive_failures: u32,
    },
    CommandEvicted(CommandId),
    SchedulerStateChanged(SchedulerState),
}

#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) store: CommandStore,
    pub(crate) registry: PendingRegistry,
    pub(crate) scheduler: SchedulerState,
    pub(crate) counters: EngineCounters,
    pub(crate) stopped: bool,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            store: CommandStore::new(),
            registry: PendingRegistry::new(),
            scheduler: SchedulerState::Idle,
            counters: EngineCounters::default(),
            stopped: false,
        }
    }
}

pub(crate) struct EngineShared {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
    /// Wakes the poll worker out of `Idle`. Holds a permit if nobody waits.
    pub(crate) wake: Notify,
}

impl EngineShared {
    pub(crate) fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            state: Mutex::new(EngineState::default()),
            config,
            clock,
            events,
            wake: Notify::new(),
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    pub(crate) fn set_scheduler(&self, state: &mut EngineState, next: SchedulerState) {
        if state.scheduler == next {
            return;
        }
        state.scheduler = next;
        event!(Level::DEBUG, scheduler = ?next, "poll scheduler state changed");
        self.emit(EngineEvent::SchedulerStateChanged(next));
    }

    /// Sets the registry entry for `key` from the pending index.
    pub(crate) fn recompute_locked(&self, state: &mut EngineState, key: &EntityKey) {
        let still_pending = state.store.has_pending(key);
        if let Some(change) = state.registry.set(key, still_pending) {
            event!(
                Level::DEBUG,
                kind = %change.kind,
                entity = %change.entity_id,
                pending = change.pending,
                "pending flag flipped"
            );
            self.emit(EngineEvent::PendingChanged(change));
        }
    }

    /// Moves a command to a terminal status and recomputes its registry entry.
    pub(crate) fn resolve_locked(
        &self,
        state: &mut EngineState,
        id: &CommandId,
        status: CommandStatus,
        resolved_at: DateTime<Utc>,
        metadata: &BTreeMap<String, String>,
    ) -> ReconcileOutcome {
        match state.store.resolve(id, status, resolved_at, metadata) {
            StoreResolution::NotTracked => ReconcileOutcome::Untracked,
            StoreResolution::AlreadyTerminal(current) => {
                event!(Level::DEBUG, command_id = %id, status = %current, "command already resolved");
                ReconcileOutcome::AlreadyResolved(current)
            }
            StoreResolution::Resolved(command) => {
                state.counters.record_resolution(status);
                self.recompute_locked(state, &command.key());
                event!(
                    Level::INFO,
                    command_id = %id,
                    kind = %command.kind,
                    entity = %command.target_entity_id,
                    status = %status,
                    "command resolved"
                );
                self.emit(EngineEvent::CommandResolved(command));
                ReconcileOutcome::Resolved(status)
            }
        }
    }
}
