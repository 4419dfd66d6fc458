use crate::core::CommandStatus;
use crate::engine::SchedulerState;
use serde::{Deserialize, Serialize};

/// Engine statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Commands accepted by the gateway.
    pub dispatched: u64,
    /// Dispatch attempts that never produced a command id.
    pub dispatch_failures: u64,
    /// Poll ticks run, background or manual.
    pub ticks: u64,
    /// Fetch calls issued.
    pub fetches: u64,
    /// Fetch calls that failed, transient or permanent.
    pub fetch_errors: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Commands resolved locally with an unknown outcome.
    pub abandoned: u64,
    pub evicted: u64,
    /// Resolved commands removed by the retention sweep.
    pub purged: u64,
    /// Commands currently polled.
    pub outstanding: usize,
    /// Commands currently in the store.
    pub stored: usize,
    /// Registry entries currently set.
    pub pending_flags: usize,
    pub scheduler: SchedulerState,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct EngineCounters {
    pub(crate) dispatched: u64,
    pub(crate) dispatch_failures: u64,
    pub(crate) ticks: u64,
    pub(crate) fetches: u64,
    pub(crate) fetch_errors: u64,
    pub(crate) succeeded: u64,
    pub(crate) failed: u64,
    pub(crate) timed_out: u64,
    pub(crate) abandoned: u64,
    pub(crate) evicted: u64,
    pub(crate) purged: u64,
}

impl EngineCounters {
    pub(crate) fn record_resolution(&mut self, status: CommandStatus) {
        match status {
            CommandStatus::Succeeded => self.succeeded += 1,
            CommandStatus::Failed => self.failed += 1,
            CommandStatus::TimedOut => self.timed_out += 1,
            CommandStatus::Abandoned => self.abandoned += 1,
            CommandStatus::Pending => {}
        }
    }
}
