//! IPC boundary
//!
//! Serializable request results and status snapshots handed to the UI layer,
//! plus thin command functions that wrap [`WashManager`] calls into
//! [`ApiResponse`] values.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::config::{DriverConfig, Revision};
use crate::wash::{
    MachineReadiness, SessionFault, SessionState, StepReport, WashCounters, WashError, WashManager,
    WashMode, WashSession,
};

/// Result of a command issued through the IPC boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    /// Whether the command succeeded
    pub success: bool,
    /// Confirmation or error text for the operator
    pub message: String,
    /// Snapshot after connect and disconnect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
}

impl ApiResponse {
    /// Successful response
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            status: None,
        }
    }

    /// Failed response carrying the error text
    pub fn failed(error: &WashError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            status: None,
        }
    }

    /// Attach a status snapshot
    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn from_result(result: Result<(), WashError>, message: impl Into<String>) -> Self {
        match result {
            Ok(()) => Self::ok(message),
            Err(e) => {
                warn!("Command failed: {}", e);
                Self::failed(&e)
            }
        }
    }
}

/// Static description of the attached machine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    /// Operator-assigned machine name
    pub machine_id: String,
    /// Controller revision
    pub revision: Revision,
    /// Modbus slave address
    pub slave_address: u8,
    /// Configured serial port
    pub port_name: String,
    /// Modes this revision can start
    pub modes: Vec<WashMode>,
    /// Whether a running wash can be paused
    pub supports_pause: bool,
}

impl From<&DriverConfig> for MachineInfo {
    fn from(config: &DriverConfig) -> Self {
        Self {
            machine_id: config.machine_id.clone(),
            revision: config.profile.revision,
            slave_address: config.profile.slave_address,
            port_name: config.port_name.clone(),
            modes: config.profile.modes().collect(),
            supports_pause: config.profile.coils.pause.is_some(),
        }
    }
}

/// Progress of the current wash
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WashStatus {
    /// Lifecycle state
    pub state: SessionState,
    /// Mode of the current session
    pub mode: Option<WashMode>,
    /// Last step the controller reported
    pub current_step: StepReport,
    /// Seconds left on the mode's duration estimate
    pub remaining_time: u64,
    /// 0..=100
    pub progress: u8,
    /// Held by the pause coil
    pub paused: bool,
    /// Latched fault, if any
    pub error: Option<SessionFault>,
    /// False once status frames stop arriving mid-wash
    pub connection_healthy: bool,
}

impl WashStatus {
    pub(crate) fn from_session(session: &WashSession, now: Instant) -> Self {
        Self {
            state: session.state,
            mode: session.mode,
            current_step: session.step_code.into(),
            remaining_time: session.remaining_time(now),
            progress: session.progress(now),
            paused: session.paused,
            error: session.error.clone(),
            connection_healthy: session.connection_healthy,
        }
    }
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// A transport is attached
    pub connected: bool,
    /// Session progress
    pub status: WashStatus,
    /// Static machine description
    pub machine_info: MachineInfo,
    /// Wall-clock time of the last status frame
    pub last_status_received_at: Option<DateTime<Utc>>,
}

/// What triggered a [`StatusUpdate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateKind {
    /// Transport attached
    Connected,
    /// Transport released
    Disconnected,
    /// Lifecycle state moved
    StateChanged,
    /// Controller reported a new step
    StepChanged,
    /// Running wash held
    Paused,
    /// Held wash continued
    Resumed,
    /// Fault latched
    Fault,
    /// Fault cleared by reset
    FaultCleared,
    /// Connection health flipped
    HealthChanged,
}

/// Event pushed to subscribers on every observable change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// What changed
    pub kind: UpdateKind,
    /// Machine the update belongs to
    pub machine_id: String,
    /// Current session, if any
    pub session_id: Option<Uuid>,
    /// Progress at the time of the change
    #[serde(flatten)]
    pub status: WashStatus,
    /// When the update was emitted
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    /// Event name used on the IPC channel
    pub const EVENT_NAME: &'static str = "status-update";

    pub(crate) fn new(kind: UpdateKind, session: &WashSession) -> Self {
        Self {
            kind,
            machine_id: session.machine_id.clone(),
            session_id: session.session_id,
            status: WashStatus::from_session(session, Instant::now()),
            timestamp: Utc::now(),
        }
    }
}

// IPC commands

/// Open the configured port
pub async fn connect_device(manager: &WashManager) -> ApiResponse {
    let result = manager.connect().await;
    ApiResponse::from_result(result, "Device connected").with_status(manager.status().await)
}

/// Release the port and cancel any session
pub async fn disconnect_device(manager: &WashManager) -> ApiResponse {
    let result = manager.disconnect().await;
    ApiResponse::from_result(result, "Device disconnected").with_status(manager.status().await)
}

/// Start a wash and wait for the controller to acknowledge it
pub async fn start_wash(manager: &WashManager, mode: WashMode) -> ApiResponse {
    ApiResponse::from_result(manager.start_wash(mode).await, format!("{} started", mode))
}

/// Abort the current wash
pub async fn stop_wash(manager: &WashManager) -> ApiResponse {
    ApiResponse::from_result(manager.stop_wash().await, "Wash stopped")
}

/// Reset the controller and clear a latched fault
pub async fn reset(manager: &WashManager) -> ApiResponse {
    ApiResponse::from_result(manager.reset().await, "Controller reset")
}

/// Hold the running wash
pub async fn pause_wash(manager: &WashManager) -> ApiResponse {
    ApiResponse::from_result(manager.pause().await, "Wash paused")
}

/// Continue a held wash
pub async fn resume_wash(manager: &WashManager) -> ApiResponse {
    ApiResponse::from_result(manager.resume().await, "Wash resumed")
}

/// Current connection and session snapshot
pub async fn get_status(manager: &WashManager) -> DeviceStatus {
    manager.status().await
}

/// Gantry and vehicle flags; fails while a wash runs
pub async fn get_readiness(manager: &WashManager) -> Result<MachineReadiness, String> {
    manager.read_readiness().await.map_err(|e| e.to_string())
}

/// Controller wash counters; fails while a wash runs
pub async fn get_wash_counts(manager: &WashManager) -> Result<WashCounters, String> {
    manager.read_counters().await.map_err(|e| e.to_string())
}
