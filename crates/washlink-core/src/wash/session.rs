//! Wash session model
//!
//! The session is the single mutable record of what the machine is doing.
//! Only the manager mutates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::steps::StepCode;

/// Wash programme selected by the customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WashMode {
    /// Programme 1
    Mode1,
    /// Programme 2
    Mode2,
    /// Programme 3
    Mode3,
    /// Programme 4
    Mode4,
}

impl WashMode {
    /// Every mode, in programme order
    pub const ALL: [WashMode; 4] = [
        WashMode::Mode1,
        WashMode::Mode2,
        WashMode::Mode3,
        WashMode::Mode4,
    ];
}

impl fmt::Display for WashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WashMode::Mode1 => "MODE1",
            WashMode::Mode2 => "MODE2",
            WashMode::Mode3 => "MODE3",
            WashMode::Mode4 => "MODE4",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a wash session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// No wash in progress
    Idle,
    /// Start command issued, waiting for acknowledgement
    Starting,
    /// Machine acknowledged and is washing
    Washing,
    /// Wash finished; transient before returning to idle
    Completed,
}

/// Fault that latches the session error flag until `reset`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SessionFault {
    /// The controller raised its error coil
    Hardware,
    /// The serial link failed
    Transport(String),
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFault::Hardware => f.write_str("Hardware error reported by controller"),
            SessionFault::Transport(e) => write!(f, "Serial link failure: {}", e),
        }
    }
}

/// One wash cycle, from start command to completion or abort
#[derive(Debug, Clone)]
pub struct WashSession {
    /// Identifies the cycle in logs and events
    pub session_id: Option<Uuid>,
    /// Machine this session runs on
    pub machine_id: String,
    /// Programme of the current cycle
    pub mode: Option<WashMode>,
    /// Lifecycle state
    pub state: SessionState,
    /// Last step read from the controller
    pub step_code: StepCode,
    /// Wall-clock start, reported to the UI
    pub started_at: Option<DateTime<Utc>>,
    /// Monotonic start, used for remaining-time maths
    pub started_instant: Option<Instant>,
    /// Expected cycle length for the mode
    pub total_duration_estimate: Duration,
    /// Monotonic time of the last valid status frame
    pub last_status_at: Option<Instant>,
    /// Wall-clock time of the last valid status frame
    pub last_status_received_at: Option<DateTime<Utc>>,
    /// False once status frames stop arriving while washing
    pub connection_healthy: bool,
    /// Latched fault; only `reset` clears a hardware fault
    pub error: Option<SessionFault>,
    /// Set once a washing step has been observed in this cycle
    pub saw_washing_step: bool,
    /// Set while the controller holds the cycle
    pub paused: bool,
    /// When the current pause began
    pub paused_at: Option<Instant>,
    /// Pauses already ended in this cycle
    pub paused_total: Duration,
    /// Bumped on every transition out of idle; stale timers compare against it
    pub epoch: u64,
}

impl WashSession {
    /// An idle session for `machine_id`
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            session_id: None,
            machine_id: machine_id.into(),
            mode: None,
            state: SessionState::Idle,
            step_code: StepCode::Idle,
            started_at: None,
            started_instant: None,
            total_duration_estimate: Duration::ZERO,
            last_status_at: None,
            last_status_received_at: None,
            connection_healthy: true,
            error: None,
            saw_washing_step: false,
            paused: false,
            paused_at: None,
            paused_total: Duration::ZERO,
            epoch: 0,
        }
    }

    /// Begin a new cycle; returns the epoch that owns it
    pub fn begin(&mut self, mode: WashMode, estimate: Duration) -> u64 {
        self.epoch += 1;
        self.session_id = Some(Uuid::new_v4());
        self.mode = Some(mode);
        self.state = SessionState::Starting;
        self.step_code = StepCode::Idle;
        self.started_at = None;
        self.started_instant = None;
        self.total_duration_estimate = estimate;
        self.connection_healthy = true;
        self.saw_washing_step = false;
        self.clear_pause();
        self.epoch
    }

    /// Return to idle, keeping the error flag and status timestamps
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.session_id = None;
        self.mode = None;
        self.state = SessionState::Idle;
        self.step_code = StepCode::Idle;
        self.started_at = None;
        self.started_instant = None;
        self.total_duration_estimate = Duration::ZERO;
        self.connection_healthy = true;
        self.saw_washing_step = false;
        self.clear_pause();
    }

    /// Hold the cycle clock
    pub fn pause(&mut self, now: Instant) {
        if !self.paused {
            self.paused = true;
            self.paused_at = Some(now);
        }
    }

    /// Restart the cycle clock
    pub fn resume(&mut self, now: Instant) {
        if let Some(since) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
        self.paused = false;
    }

    fn clear_pause(&mut self) {
        self.paused = false;
        self.paused_at = None;
        self.paused_total = Duration::ZERO;
    }

    /// Washing time so far, not counting pauses
    fn washing_elapsed(&self, start: Instant, now: Instant) -> Duration {
        let current_pause = self
            .paused_at
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        now.saturating_duration_since(start)
            .saturating_sub(self.paused_total)
            .saturating_sub(current_pause)
    }

    /// True for any state other than idle
    pub fn is_active(&self) -> bool {
        self.state != SessionState::Idle
    }

    /// Seconds left according to the mode's duration estimate
    pub fn remaining_time(&self, now: Instant) -> u64 {
        match (self.state, self.started_instant) {
            (SessionState::Washing, Some(start)) => self
                .total_duration_estimate
                .saturating_sub(self.washing_elapsed(start, now))
                .as_secs(),
            (SessionState::Starting, _) => self.total_duration_estimate.as_secs(),
            _ => 0,
        }
    }

    /// Percentage of the duration estimate already elapsed
    pub fn progress(&self, now: Instant) -> u8 {
        match (self.state, self.started_instant) {
            (SessionState::Completed, _) => 100,
            (SessionState::Washing, Some(start)) if !self.total_duration_estimate.is_zero() => {
                let elapsed = self.washing_elapsed(start, now).as_secs_f64();
                let ratio = elapsed / self.total_duration_estimate.as_secs_f64();
                (ratio * 100.0).round().min(100.0) as u8
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_clear_bump_epoch() {
        let mut session = WashSession::new("bay-1");
        let epoch = session.begin(WashMode::Mode1, Duration::from_secs(480));
        assert_eq!(session.state, SessionState::Starting);
        assert!(session.session_id.is_some());

        session.clear();
        assert_ne!(session.epoch, epoch);
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.mode.is_none());
    }

    #[test]
    fn test_clear_keeps_error_flag() {
        let mut session = WashSession::new("bay-1");
        session.error = Some(SessionFault::Hardware);
        session.clear();
        assert_eq!(session.error, Some(SessionFault::Hardware));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_time_and_progress() {
        let mut session = WashSession::new("bay-1");
        session.begin(WashMode::Mode1, Duration::from_secs(400));
        session.state = SessionState::Washing;
        session.started_instant = Some(Instant::now());

        tokio::time::advance(Duration::from_secs(100)).await;
        let now = Instant::now();
        assert_eq!(session.remaining_time(now), 300);
        assert_eq!(session.progress(now), 25);

        tokio::time::advance(Duration::from_secs(1000)).await;
        let now = Instant::now();
        assert_eq!(session.remaining_time(now), 0);
        assert_eq!(session.progress(now), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_hold_remaining_time() {
        let mut session = WashSession::new("bay-1");
        session.begin(WashMode::Mode1, Duration::from_secs(400));
        session.state = SessionState::Washing;
        session.started_instant = Some(Instant::now());

        tokio::time::advance(Duration::from_secs(100)).await;
        session.pause(Instant::now());
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(session.remaining_time(Instant::now()), 300);

        session.resume(Instant::now());
        tokio::time::advance(Duration::from_secs(100)).await;
        let now = Instant::now();
        assert_eq!(session.remaining_time(now), 200);
        assert_eq!(session.progress(now), 50);
        assert!(!session.paused);

        session.clear();
        assert_eq!(session.paused_total, Duration::ZERO);
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(serde_json::to_string(&WashMode::Mode2).unwrap(), "\"MODE2\"");
        assert_eq!(WashMode::Mode3.to_string(), "MODE3");
    }
}
