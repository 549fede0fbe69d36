//! Status poller
//!
//! Reads the step register (and the error coil, when the revision has one)
//! on a fixed interval and forwards decoded results to the manager.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::steps::StepCode;
use crate::config::DeviceProfile;
use crate::protocol::{Frame, Request, Response, Transport, TransportEvent};

/// A decoded step register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    /// Decoded step
    pub step_code: StepCode,
    /// Operator-facing name of the step
    pub description: &'static str,
    /// True for steps that run a wash phase
    pub is_washing: bool,
}

impl From<StepCode> for StepReport {
    fn from(step_code: StepCode) -> Self {
        Self {
            step_code,
            description: step_code.description(),
            is_washing: step_code.is_washing(),
        }
    }
}

/// Results forwarded to the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// Step register read
    Step(StepReport),
    /// Error coil read
    ErrorFlag(bool),
}

/// Periodic reader of the controller's status
pub struct StatusPoller {
    transport: Arc<Transport>,
    step_register: u16,
    error_coil: Option<u16>,
    interval: Duration,
}

impl StatusPoller {
    /// Poller for the step register and error coil of `profile`
    pub fn new(transport: Arc<Transport>, profile: &DeviceProfile) -> Self {
        Self {
            transport,
            step_register: profile.registers.step,
            error_coil: profile.coils.error,
            interval: profile.timing.poll_interval(),
        }
    }

    /// Map a status response frame to a poll event
    pub fn interpret(frame: &Frame) -> Option<PollEvent> {
        match Response::from_frame(frame) {
            Ok(Response::Registers(values)) => {
                let raw = *values.first()?;
                Some(PollEvent::Step(StepCode::from_raw(raw).into()))
            }
            Ok(Response::Coils(coils)) => coils.first().map(|&on| PollEvent::ErrorFlag(on)),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring status frame: {}", e);
                None
            }
        }
    }

    /// Start polling; events go to `tx` until the task is aborted or `tx` closes
    pub fn spawn(self, tx: mpsc::Sender<PollEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(tx))
    }

    async fn run(self, tx: mpsc::Sender<PollEvent>) {
        let mut events = self.transport.subscribe();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.request_status().await {
                        warn!("Status request failed, stopping poller: {}", e);
                        return;
                    }
                }

                event = events.recv() => match event {
                    Ok(TransportEvent::Frame(frame)) => {
                        if let Some(poll_event) = Self::interpret(&frame) {
                            trace!("Poll result: {:?}", poll_event);
                            if tx.send(poll_event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(TransportEvent::Error(_)) | Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        debug!("Transport gone, stopping poller");
                        return;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Poller lagged, skipped {} transport events", skipped);
                    }
                },
            }
        }
    }

    async fn request_status(&self) -> Result<(), crate::protocol::TransportError> {
        self.transport
            .send(Request::ReadHoldingRegisters {
                start: self.step_register,
                quantity: 1,
            })
            .await?;
        if let Some(coil) = self.error_coil {
            self.transport
                .send(Request::ReadCoils {
                    start: coil,
                    quantity: 1,
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    #[test]
    fn test_interpret_step_register() {
        let frame = encode(0x0C, 0x03, &[0x02, 0x00, 0x06]);
        assert_eq!(
            StatusPoller::interpret(&frame),
            Some(PollEvent::Step(StepReport {
                step_code: StepCode::HighPressure,
                description: "High-pressure wash",
                is_washing: true,
            }))
        );
    }

    #[test]
    fn test_interpret_error_coil() {
        let frame = encode(0x0C, 0x01, &[0x01, 0x01]);
        assert_eq!(StatusPoller::interpret(&frame), Some(PollEvent::ErrorFlag(true)));
    }

    #[test]
    fn test_interpret_ignores_write_ack() {
        let frame = encode(0x0C, 0x05, &[0x00, 0x05, 0xFF, 0x00]);
        assert_eq!(StatusPoller::interpret(&frame), None);
    }

    #[test]
    fn test_interpret_empty_register_response() {
        let frame = encode(0x0C, 0x03, &[0x00]);
        assert_eq!(StatusPoller::interpret(&frame), None);
    }
}
