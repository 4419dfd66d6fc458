use super::{EngineShared, ReconcileOutcome, Reconciler};
use crate::core::{CommandStatus, EngineError, GatewayError, Result};
use crate::gateway::CommandGateway;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, Level, event, info_span};

/// Whether the shared poll timer is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Nothing outstanding; the timer is stopped.
    Idle,
    /// At least one command outstanding; ticks run every poll interval.
    Active,
}

/// Summary of one poll tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Outstanding ids fetched this tick.
    pub polled: usize,
    /// Commands that reached a terminal status from a fetch result.
    pub resolved: usize,
    pub still_pending: usize,
    /// Transient fetch failures.
    pub retrying: usize,
    /// Commands abandoned (permanent fetch error or deadline).
    pub abandoned: usize,
    pub purged: usize,
    /// Outstanding commands left after the tick.
    pub outstanding: usize,
}

/// Single shared poll timer over the outstanding command set.
pub struct PollScheduler {
    shared: Arc<EngineShared>,
    gateway: Arc<dyn CommandGateway>,
    reconciler: Reconciler,
    /// Serializes ticks so a command is never fetched by two ticks at once.
    tick_lock: Mutex<()>,
}

impl PollScheduler {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        gateway: Arc<dyn CommandGateway>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            shared,
            gateway,
            reconciler,
            tick_lock: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        self.shared.state.lock().await.scheduler
    }

    /// Polls every outstanding command once.
    ///
    /// Ids are snapshotted up front; fetches run concurrently and each result
    /// is reconciled as soon as it arrives. The scheduler goes `Idle` when
    /// nothing is outstanding afterwards.
    pub async fn tick(&self) -> TickReport {
        let _tick = self.tick_lock.lock().await;

        let ids = {
            let mut state = self.shared.state.lock().await;
            let ids = state.store.outstanding_ids();
            state.counters.ticks += 1;
            state.counters.fetches += ids.len() as u64;
            ids
        };

        let span = info_span!("engine.tick", outstanding = ids.len());
        async move {
            let mut report = TickReport {
                polled: ids.len(),
                ..TickReport::default()
            };

            let fetch_timeout = self.shared.config.fetch_timeout;
            let polls = ids.into_iter().map(|id| {
                let gateway = Arc::clone(&self.gateway);
                let reconciler = self.reconciler.clone();
                async move {
                    let fetched = match timeout(fetch_timeout, gateway.fetch_command(&id)).await {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::Timeout(fetch_timeout)),
                    };
                    match fetched {
                        Ok(command) => reconciler.reconcile_fetched(&id, command).await,
                        Err(error) => reconciler.record_fetch_error(&id, error).await,
                    }
                }
            });

            for outcome in join_all(polls).await {
                match outcome {
                    ReconcileOutcome::Resolved(CommandStatus::Abandoned) => report.abandoned += 1,
                    ReconcileOutcome::Resolved(_) => report.resolved += 1,
                    ReconcileOutcome::StillPending => report.still_pending += 1,
                    ReconcileOutcome::Retrying { .. } => report.retrying += 1,
                    ReconcileOutcome::AlreadyResolved(_) | ReconcileOutcome::Untracked => {}
                }
            }

            report.abandoned += self.reconciler.expire_overdue().await.len();
            report.purged = self.reconciler.purge_expired().await.len();

            let mut state = self.shared.state.lock().await;
            report.outstanding = state.store.outstanding_len();
            if report.outstanding == 0 {
                self.shared
                    .set_scheduler(&mut state, SchedulerState::Idle);
            }

            event!(
                Level::DEBUG,
                resolved = report.resolved,
                retrying = report.retrying,
                outstanding = report.outstanding,
                "poll tick finished"
            );
            report
        }
        .instrument(span)
        .await
    }
}

/// Background task driving `PollScheduler::tick` on the poll interval.
pub(crate) struct PollWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl PollWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub(crate) async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| EngineError::Worker(format!("poll worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the poll worker. Must be called inside a tokio runtime.
pub(crate) fn spawn_poll_worker(scheduler: Arc<PollScheduler>) -> PollWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let interval = scheduler.shared.config.effective_poll_interval();

    let join_handle = tokio::spawn(async move {
        loop {
            while scheduler.state().await == SchedulerState::Idle {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = scheduler.shared.wake.notified() => {}
                }
            }

            tokio::select! {
                _ = &mut stop_rx => return,
                _ = sleep(interval) => {
                    scheduler.tick().await;
                }
            }
        }
    });

    PollWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
