/// Dispatch and fetch edge-case tests
///
/// Gateways that hang, park or misbehave, run on a paused tokio clock so
/// timeouts fire without real waiting.
/// Run with: cargo test --test dispatch_tests

use async_trait::async_trait;
use cmdtrack::{
    Command, CommandEngine, CommandGateway, CommandId, CommandKind, CommandStatus, DispatchError,
    EngineConfig, GatewayError, InMemoryGateway, SchedulerState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

#[derive(Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    Normal,
    Hang,
    EmptyId,
    /// Wait for a permit from `release` before minting the id.
    Park,
}

struct StubGateway {
    inner: InMemoryGateway,
    dispatch_mode: DispatchMode,
    hang_fetches: bool,
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl StubGateway {
    fn new(dispatch_mode: DispatchMode, hang_fetches: bool) -> Self {
        Self {
            inner: InMemoryGateway::new(),
            dispatch_mode,
            hang_fetches,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl CommandGateway for StubGateway {
    async fn dispatch(
        &self,
        kind: CommandKind,
        target_entity_id: &str,
        params: &serde_json::Value,
        commander: Option<&str>,
    ) -> Result<CommandId, GatewayError> {
        match self.dispatch_mode {
            DispatchMode::Normal => {}
            DispatchMode::Hang => std::future::pending::<()>().await,
            DispatchMode::EmptyId => return Ok(CommandId::new("")),
            DispatchMode::Park => {
                self.entered.notify_one();
                let _permit = self
                    .release
                    .acquire()
                    .await
                    .map_err(|err| GatewayError::Unavailable(err.to_string()))?;
            }
        }
        self.inner
            .dispatch(kind, target_entity_id, params, commander)
            .await
    }

    async fn fetch_command(&self, id: &CommandId) -> Result<Command, GatewayError> {
        if self.hang_fetches {
            std::future::pending::<()>().await;
        }
        self.inner.fetch_command(id).await
    }
}

async fn start(config: EngineConfig, gateway: StubGateway) -> (CommandEngine, Arc<StubGateway>) {
    let gateway = Arc::new(gateway);
    let engine = CommandEngine::start(
        config.poll_interval(Duration::from_secs(3_600)),
        gateway.clone(),
    )
    .await
    .unwrap();
    (engine, gateway)
}

async fn assert_nothing_tracked(engine: &CommandEngine, kind: CommandKind, entity: &str) {
    assert!(engine.commands().await.is_empty());
    assert!(engine.outstanding_ids().await.is_empty());
    assert!(!engine.is_pending(kind, entity).await);
    assert_eq!(engine.scheduler_state().await, SchedulerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn hung_dispatch_times_out_without_state() {
    let config = EngineConfig::new().dispatch_timeout(Duration::from_secs(5));
    let (engine, _) = start(config, StubGateway::new(DispatchMode::Hang, false)).await;

    let err = engine
        .dispatch(CommandKind::SyncApplication, "app-1", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Timeout(Duration::from_secs(5)));

    assert_nothing_tracked(&engine, CommandKind::SyncApplication, "app-1").await;
    let stats = engine.stats().await;
    assert_eq!(stats.dispatch_failures, 1);
    assert_eq!(stats.dispatched, 0);
}

#[tokio::test]
async fn empty_command_id_is_rejected() {
    let (engine, _) = start(
        EngineConfig::new(),
        StubGateway::new(DispatchMode::EmptyId, false),
    )
    .await;

    let err = engine
        .dispatch(CommandKind::CancelDeployment, "dep-1", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::EmptyCommandId);

    assert_nothing_tracked(&engine, CommandKind::CancelDeployment, "dep-1").await;
    assert_eq!(engine.stats().await.dispatch_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn hung_fetch_counts_as_transient_failure() {
    let config = EngineConfig::new().fetch_timeout(Duration::from_secs(2));
    let (engine, _) = start(config, StubGateway::new(DispatchMode::Normal, true)).await;
    let command = engine
        .dispatch(CommandKind::ApproveStage, "stage-1", json!({}))
        .await
        .unwrap();

    let report = engine.poll_now().await;
    assert_eq!(report.polled, 1);
    assert_eq!(report.retrying, 1);
    assert_eq!(report.resolved, 0);

    assert_eq!(
        engine.get(&command.id).await.unwrap().status,
        CommandStatus::Pending
    );
    assert!(engine.is_pending(CommandKind::ApproveStage, "stage-1").await);
    assert_eq!(engine.outstanding_ids().await, vec![command.id]);
    assert_eq!(engine.scheduler_state().await, SchedulerState::Active);
    assert_eq!(engine.stats().await.fetch_errors, 1);
}

#[tokio::test]
async fn dispatch_in_flight_during_shutdown_is_not_tracked() {
    let (engine, gateway) =
        start(EngineConfig::new(), StubGateway::new(DispatchMode::Park, false)).await;

    let dispatching = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .dispatch(CommandKind::SyncApplication, "app-1", json!({}))
                .await
        })
    };

    gateway.entered.notified().await;
    engine.shutdown().await.unwrap();
    gateway.release.add_permits(1);

    let result = dispatching.await.unwrap();
    assert_eq!(result.unwrap_err(), DispatchError::Stopped);

    assert_nothing_tracked(&engine, CommandKind::SyncApplication, "app-1").await;
    assert_eq!(engine.stats().await.dispatch_failures, 1);
}
