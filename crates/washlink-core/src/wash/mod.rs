//! Wash control
//!
//! Step interpretation, the session model, the tasks that drive a wash
//! from start command to completion, and the readiness reads made between
//! washes.

pub mod dispatcher;
pub mod manager;
pub mod poller;
pub mod readiness;
pub mod session;
pub mod steps;

pub use dispatcher::{Acknowledged, CommandDispatcher, CommandPermit, CommandSlot, DispatchError};
pub use manager::{WashError, WashManager};
pub use poller::{PollEvent, StatusPoller, StepReport};
pub use readiness::{MachineReadiness, WashCounters};
pub use session::{SessionFault, SessionState, WashMode, WashSession};
pub use steps::StepCode;
