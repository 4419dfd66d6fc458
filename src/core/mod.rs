pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DispatchError, EngineError, GatewayError, Result};
pub use types::{Command, CommandId, CommandKind, CommandStatus, EntityClass, EntityKey};
