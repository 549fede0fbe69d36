//! # WashLink Core Library
//!
//! Serial control driver for Modbus-ASCII car-wash controllers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Modbus-ASCII frame encoding and decoding with LRC checksums
//! - Serial transport with ordered frame fan-out
//! - Start-command retries, step polling and wash session tracking
//! - Pause and resume, bay readiness and wash counter reads
//! - Per-revision device profiles loaded from JSON
//! - A protocol simulator for testing without hardware
//!
//! ## Supported Controllers
//!
//! - FL3.0
//! - SG90
//! - Other revisions through a custom [`config::DeviceProfile`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use washlink_core::prelude::*;
//!
//! let config = DriverConfig::new("bay-1", "/dev/ttyUSB0", DeviceProfile::fl30());
//! let manager = WashManager::new(config)?;
//! manager.connect().await?;
//!
//! let mut updates = manager.subscribe();
//! manager.start_wash(WashMode::Mode1).await?;
//! while let Ok(update) = updates.recv().await {
//!     println!("{}", update.status.current_step.description);
//! }
//! ```

pub mod api;
pub mod config;
pub mod protocol;
pub mod simulator;
pub mod wash;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{ApiResponse, DeviceStatus, StatusUpdate, UpdateKind};
    pub use crate::config::{DeviceProfile, DriverConfig, Revision};
    pub use crate::protocol::{Frame, FrameCodec, Transport, TransportEvent};
    pub use crate::simulator::{Simulator, SimulatorConfig, SimulatorHandle};
    pub use crate::wash::{
        MachineReadiness, SessionState, StepCode, WashCounters, WashError, WashManager, WashMode,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
