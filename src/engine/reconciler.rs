use super::{EngineEvent, EngineShared};
use crate::core::{Command, CommandId, CommandStatus, GatewayError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event};

/// Metadata key recording why the engine abandoned a command.
pub const ABANDON_REASON_KEY: &str = "abandon_reason";

/// What a single reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The command is still pending and stays outstanding.
    StillPending,
    /// The command moved to this terminal status.
    Resolved(CommandStatus),
    /// The command was already terminal; nothing changed.
    AlreadyResolved(CommandStatus),
    /// The command is not in the store (evicted or never dispatched here).
    Untracked,
    /// A transient fetch error; the command is retried next tick.
    Retrying { consecutive_failures: u32 },
}

/// Applies poll results to the store and recomputes pending flags.
///
/// The reconciler is the only writer of terminal statuses and of registry
/// recomputes. Applying the same terminal result twice is a no-op.
#[derive(Clone)]
pub struct Reconciler {
    shared: Arc<EngineShared>,
}

impl Reconciler {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Reconciles a fetched command, keyed by its own id.
    pub async fn reconcile(&self, fetched: Command) -> ReconcileOutcome {
        let id = fetched.id.clone();
        self.reconcile_fetched(&id, fetched).await
    }

    /// Reconciles the result of fetching `requested`.
    pub(crate) async fn reconcile_fetched(
        &self,
        requested: &CommandId,
        fetched: Command,
    ) -> ReconcileOutcome {
        if &fetched.id != requested {
            event!(
                Level::WARN,
                requested = %requested,
                returned = %fetched.id,
                "gateway returned a different command id"
            );
        }

        let mut state = self.shared.state.lock().await;
        let Some(stored) = state.store.get(requested) else {
            event!(Level::DEBUG, command_id = %requested, "fetched command is no longer tracked");
            return ReconcileOutcome::Untracked;
        };
        if stored.kind != fetched.kind || stored.target_entity_id != fetched.target_entity_id {
            event!(
                Level::WARN,
                command_id = %requested,
                "fetched command disagrees with the dispatched kind or target"
            );
        }

        if !fetched.status.is_terminal() {
            return match state
                .store
                .refresh_pending(requested, fetched.updated_at, &fetched.metadata)
            {
                Some(CommandStatus::Pending) => ReconcileOutcome::StillPending,
                Some(status) => ReconcileOutcome::AlreadyResolved(status),
                None => ReconcileOutcome::Untracked,
            };
        }

        let resolved_at = fetched
            .resolved_at
            .unwrap_or_else(|| self.shared.clock.now());
        self.shared.resolve_locked(
            &mut state,
            requested,
            fetched.status,
            resolved_at,
            &fetched.metadata,
        )
    }

    /// Records a failed fetch.
    ///
    /// Transient errors never touch the registry. A permanently invalid id
    /// abandons the command since it can never resolve remotely.
    pub async fn record_fetch_error(&self, id: &CommandId, error: GatewayError) -> ReconcileOutcome {
        let mut state = self.shared.state.lock().await;
        state.counters.fetch_errors += 1;

        if !state.store.is_outstanding(id) {
            return match state.store.get(id) {
                Some(command) => ReconcileOutcome::AlreadyResolved(command.status),
                None => ReconcileOutcome::Untracked,
            };
        }

        let consecutive_failures = state.store.record_fetch_failure(id);
        self.shared.emit(EngineEvent::FetchFailed {
            command_id: id.clone(),
            error: error.clone(),
            consecutive_failures,
        });

        if error.is_transient() {
            event!(
                Level::WARN,
                command_id = %id,
                error = %error,
                consecutive_failures,
                "command fetch failed; retrying next tick"
            );
            return ReconcileOutcome::Retrying {
                consecutive_failures,
            };
        }

        event!(Level::ERROR, command_id = %id, error = %error, "command can never resolve; abandoning");
        let metadata = BTreeMap::from([(ABANDON_REASON_KEY.to_string(), error.to_string())]);
        let now = self.shared.clock.now();
        self.shared
            .resolve_locked(&mut state, id, CommandStatus::Abandoned, now, &metadata)
    }

    /// Abandons outstanding commands whose resolution deadline has passed.
    pub async fn expire_overdue(&self) -> Vec<CommandId> {
        let now = self.shared.clock.now();
        let config = &self.shared.config;
        let mut state = self.shared.state.lock().await;

        let overdue: Vec<(CommandId, u128)> = state
            .store
            .outstanding_ids()
            .into_iter()
            .filter_map(|id| {
                let command = state.store.get(&id)?;
                let timeout = config.resolution_timeout_for(command.kind)?;
                let deadline = command
                    .created_at
                    .checked_add_signed(chrono::Duration::from_std(timeout).ok()?)?;
                (deadline <= now).then_some((id, timeout.as_millis()))
            })
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for (id, timeout_ms) in overdue {
            event!(Level::WARN, command_id = %id, timeout_ms, "command resolution deadline exceeded");
            let metadata = BTreeMap::from([(
                ABANDON_REASON_KEY.to_string(),
                format!("no resolution within {} ms", timeout_ms),
            )]);
            let outcome = self.shared.resolve_locked(
                &mut state,
                &id,
                CommandStatus::Abandoned,
                now,
                &metadata,
            );
            if outcome == ReconcileOutcome::Resolved(CommandStatus::Abandoned) {
                expired.push(id);
            }
        }
        expired
    }

    /// Drops resolved commands older than the configured retention.
    pub async fn purge_expired(&self) -> Vec<CommandId> {
        let Some(retention) = self.shared.config.resolved_retention else {
            return Vec::new();
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        let Some(cutoff) = self.shared.clock.now().checked_sub_signed(retention) else {
            return Vec::new();
        };

        let mut state = self.shared.state.lock().await;
        let purged = state.store.purge_resolved_before(cutoff);
        state.counters.purged += purged.len() as u64;
        if !purged.is_empty() {
            event!(Level::DEBUG, purged = purged.len(), "purged resolved commands");
        }
        purged
    }
}
