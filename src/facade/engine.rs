use crate::config::EngineConfig;
use crate::core::{
    Clock, Command, CommandId, CommandKind, DispatchError, EngineError, EntityKey, Result,
    SystemClock,
};
use crate::engine::scheduler::{PollWorker, spawn_poll_worker};
use crate::engine::{
    Dispatcher, EngineEvent, EngineShared, PollScheduler, Reconciler, SchedulerState, TickReport,
};
use crate::gateway::CommandGateway;
use crate::stats::EngineStats;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{Level, event};

struct EngineInner {
    shared: Arc<EngineShared>,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    scheduler: Arc<PollScheduler>,
    worker: Mutex<Option<PollWorker>>,
}

/// Command tracking engine
///
/// Owns the command store, the pending registries and the poll scheduler.
/// Cloning is cheap; clones share the same engine. Dropping the last clone
/// aborts the poll worker.
///
/// # Examples
///
/// ```
/// use cmdtrack::{CommandEngine, CommandKind, CommandStatus, EngineConfig, InMemoryGateway};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let gateway = InMemoryGateway::new();
/// let engine = CommandEngine::start(EngineConfig::default(), Arc::new(gateway.clone())).await?;
///
/// let command = engine
///     .dispatch(CommandKind::SyncApplication, "app-1", serde_json::json!({}))
///     .await?;
/// assert!(engine.is_pending(CommandKind::SyncApplication, "app-1").await);
///
/// gateway.resolve(&command.id, CommandStatus::Succeeded).await?;
/// engine.poll_now().await;
/// assert!(!engine.is_pending(CommandKind::SyncApplication, "app-1").await);
/// # engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CommandEngine {
    inner: Arc<EngineInner>,
}

impl CommandEngine {
    /// Starts an engine using the system clock.
    pub async fn start(config: EngineConfig, gateway: Arc<dyn CommandGateway>) -> Result<Self> {
        Self::start_with_clock(config, gateway, Arc::new(SystemClock)).await
    }

    /// Starts an engine with an explicit clock for command timestamps and deadlines.
    pub async fn start_with_clock(
        config: EngineConfig,
        gateway: Arc<dyn CommandGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let poll_interval_ms = config.effective_poll_interval().as_millis() as u64;
        let shared = Arc::new(EngineShared::new(config, clock));
        let reconciler = Reconciler::new(Arc::clone(&shared));
        let dispatcher = Dispatcher::new(Arc::clone(&shared), Arc::clone(&gateway));
        let scheduler = Arc::new(PollScheduler::new(
            Arc::clone(&shared),
            gateway,
            reconciler.clone(),
        ));
        let worker = spawn_poll_worker(Arc::clone(&scheduler));

        event!(Level::INFO, poll_interval_ms, "command engine started");
        Ok(Self {
            inner: Arc::new(EngineInner {
                shared,
                dispatcher,
                reconciler,
                scheduler,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Dispatches an action; see [`Dispatcher::dispatch`].
    pub async fn dispatch(
        &self,
        kind: CommandKind,
        entity_id: &str,
        params: serde_json::Value,
    ) -> std::result::Result<Command, DispatchError> {
        self.inner
            .dispatcher
            .dispatch(kind, entity_id, params, None)
            .await
    }

    /// Dispatches an action on behalf of `commander`.
    pub async fn dispatch_as(
        &self,
        kind: CommandKind,
        entity_id: &str,
        params: serde_json::Value,
        commander: &str,
    ) -> std::result::Result<Command, DispatchError> {
        self.inner
            .dispatcher
            .dispatch(kind, entity_id, params, Some(commander))
            .await
    }

    pub async fn is_pending(&self, kind: CommandKind, entity_id: &str) -> bool {
        let state = self.inner.shared.state.lock().await;
        state.registry.is_pending(kind, entity_id)
    }

    pub async fn pending_entities(&self, kind: CommandKind) -> Vec<String> {
        let state = self.inner.shared.state.lock().await;
        state.registry.pending_entities(kind)
    }

    pub async fn get(&self, id: &CommandId) -> Option<Command> {
        let state = self.inner.shared.state.lock().await;
        state.store.get(id).cloned()
    }

    /// Removes a command from the store and stops polling it.
    ///
    /// Evicting a pending command leaves its pending flag as it was unless
    /// `recompute_on_evict` is configured. Evicting the last outstanding
    /// command stops the poll timer right away.
    pub async fn evict(&self, id: &CommandId) -> Option<Command> {
        let shared = &self.inner.shared;
        let mut state = shared.state.lock().await;
        let command = state.store.evict(id)?;
        state.counters.evicted += 1;

        if !command.is_terminal() && shared.config.recompute_on_evict {
            shared.recompute_locked(&mut state, &command.key());
        }
        if state.store.outstanding_len() == 0 {
            shared.set_scheduler(&mut state, SchedulerState::Idle);
        }
        event!(Level::DEBUG, command_id = %id, status = %command.status, "command evicted");
        shared.emit(EngineEvent::CommandEvicted(id.clone()));
        Some(command)
    }

    /// Commands recorded for one kind and entity, oldest first.
    pub async fn commands_for(&self, kind: CommandKind, entity_id: &str) -> Vec<Command> {
        let state = self.inner.shared.state.lock().await;
        state.store.commands_for(&EntityKey::new(kind, entity_id))
    }

    /// All stored commands, oldest first.
    pub async fn commands(&self) -> Vec<Command> {
        self.inner.shared.state.lock().await.store.list()
    }

    pub async fn outstanding_ids(&self) -> Vec<CommandId> {
        self.inner.shared.state.lock().await.store.outstanding_ids()
    }

    /// Removes terminal commands resolved before `cutoff`.
    pub async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Vec<CommandId> {
        let mut state = self.inner.shared.state.lock().await;
        let purged = state.store.purge_resolved_before(cutoff);
        state.counters.purged += purged.len() as u64;
        purged
    }

    pub async fn scheduler_state(&self) -> SchedulerState {
        self.inner.scheduler.state().await
    }

    /// Runs one poll tick immediately.
    pub async fn poll_now(&self) -> TickReport {
        self.inner.scheduler.tick().await
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Waits until `id` reaches a terminal status.
    ///
    /// Fails with `NotFound` if the command is not tracked or gets evicted
    /// while waiting. There is no built-in deadline; wrap the call in
    /// `tokio::time::timeout` to bound it.
    pub async fn wait_for(&self, id: &CommandId) -> Result<Command> {
        let mut events = self.subscribe();
        if let Some(done) = self.terminal_or_missing(id).await? {
            return Ok(done);
        }

        loop {
            match events.recv().await {
                Ok(EngineEvent::CommandResolved(command)) if &command.id == id => {
                    return Ok(command);
                }
                Ok(EngineEvent::CommandEvicted(evicted)) if &evicted == id => {
                    return Err(EngineError::NotFound(id.clone()));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if let Some(done) = self.terminal_or_missing(id).await? {
                        return Ok(done);
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(EngineError::Worker("event channel closed".to_string()));
                }
            }
        }
    }

    async fn terminal_or_missing(&self, id: &CommandId) -> Result<Option<Command>> {
        let state = self.inner.shared.state.lock().await;
        match state.store.get(id) {
            None => Err(EngineError::NotFound(id.clone())),
            Some(command) if command.is_terminal() => Ok(Some(command.clone())),
            Some(_) => Ok(None),
        }
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.inner.shared.state.lock().await;
        let counters = &state.counters;
        EngineStats {
            dispatched: counters.dispatched,
            dispatch_failures: counters.dispatch_failures,
            ticks: counters.ticks,
            fetches: counters.fetches,
            fetch_errors: counters.fetch_errors,
            succeeded: counters.succeeded,
            failed: counters.failed,
            timed_out: counters.timed_out,
            abandoned: counters.abandoned,
            evicted: counters.evicted,
            purged: counters.purged,
            outstanding: state.store.outstanding_len(),
            stored: state.store.len(),
            pending_flags: state.registry.pending_total(),
            scheduler: state.scheduler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// Stops the poll worker and rejects further dispatches.
    ///
    /// Stored commands stay readable; `poll_now` keeps working.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shared.state.lock().await.stopped = true;
        let worker = self.inner.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await?;
            event!(Level::INFO, "command engine stopped");
        }
        Ok(())
    }
}
