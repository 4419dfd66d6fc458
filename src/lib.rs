// ============================================================================
// cmdtrack Library
// ============================================================================

pub mod config;
pub mod core;
pub mod engine;
pub mod facade;
pub mod gateway;
pub mod registry;
pub mod stats;
pub mod store;

// Re-export main types for convenience
pub use config::{DEFAULT_POLL_INTERVAL, EngineConfig};
pub use crate::core::{
    Clock, Command, CommandId, CommandKind, CommandStatus, DispatchError, EngineError,
    EntityClass, EntityKey, GatewayError, ManualClock, Result, SystemClock,
};
pub use engine::{
    ABANDON_REASON_KEY, Dispatcher, EngineEvent, PollScheduler, ReconcileOutcome, Reconciler,
    SchedulerState, TickReport,
};
pub use facade::CommandEngine;
pub use gateway::{CommandGateway, InMemoryGateway};
pub use registry::{PendingChange, PendingRegistry};
pub use stats::EngineStats;
pub use store::{CommandStore, StoreResolution};
