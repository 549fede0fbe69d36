//! Command dispatcher
//!
//! The controller acknowledges every coil write with the same echo frame and
//! no correlation id, and answers reads without naming the address read.
//! Replies can only be attributed correctly while at most one command is
//! outstanding, which the [`CommandSlot`] enforces: whoever issues a command
//! holds the single [`CommandPermit`] until the command is settled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::protocol::{Request, Response, Transport, TransportError, TransportEvent};

/// Errors from dispatching a command
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Every start write went unanswered
    #[error("No acknowledgement after {attempts} attempts")]
    Timeout {
        /// Writes issued
        attempts: u32,
    },

    /// The command's cancellation token fired
    #[error("Command cancelled")]
    Cancelled,

    /// A single write or read did not complete in time
    #[error("No response within {0:?}")]
    NoResponse(Duration),

    /// The controller answered with an exception
    #[error("Controller rejected function {function:#04x} with exception {code}")]
    Exception {
        /// Function code of the rejected request
        function: u8,
        /// Modbus exception code
        code: u8,
    },

    /// The transport closed underneath the command
    #[error("Transport closed while waiting for acknowledgement")]
    Closed,

    /// Writing to the transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// The single slot for an outstanding command
#[derive(Debug, Clone, Default)]
pub struct CommandSlot {
    inner: Arc<Mutex<()>>,
}

/// Proof that the holder owns the command slot; dropping it frees the slot
#[derive(Debug)]
pub struct CommandPermit {
    _guard: OwnedMutexGuard<()>,
}

impl CommandSlot {
    /// A free slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or `None` while another command holds it
    pub fn try_acquire(&self) -> Option<CommandPermit> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| CommandPermit { _guard: guard })
    }

    /// True while a permit is outstanding
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Outcome of an acknowledged command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledged {
    /// Writes issued before the acknowledgement arrived
    pub attempts: u32,
}

/// Writes coil commands, infers their acknowledgement and runs single reads
pub struct CommandDispatcher {
    transport: Arc<Transport>,
    retry_interval: Duration,
    max_attempts: u32,
    command_timeout: Duration,
}

impl CommandDispatcher {
    /// Dispatcher using the retry and timeout settings in `timing`
    pub fn new(transport: Arc<Transport>, timing: &Timing) -> Self {
        Self {
            command_timeout: timing.command_timeout(),
            ..Self::with_retry(transport, timing.retry_interval(), timing.max_attempts)
        }
    }

    /// Dispatcher with explicit start-command retry settings
    pub fn with_retry(transport: Arc<Transport>, retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            transport,
            retry_interval,
            max_attempts,
            command_timeout: Timing::default().command_timeout(),
        }
    }

    /// Set `coil` repeatedly until a write acknowledgement arrives.
    ///
    /// Issues at most `max_attempts` writes, one per retry interval, and
    /// fails with [`DispatchError::Timeout`] one interval after the last.
    /// The caller must hold the [`CommandPermit`] for the whole call.
    pub async fn send_start(&self, coil: u16, cancel: &CancellationToken) -> Result<Acknowledged, DispatchError> {
        // Subscribe before the first write so the echo cannot slip past
        let mut events = self.transport.subscribe();
        let request = Request::WriteSingleCoil {
            address: coil,
            on: true,
        };

        let mut ticker = interval(self.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Start command for coil {:#06x} cancelled after {} attempts", coil, attempts);
                    return Err(DispatchError::Cancelled);
                }

                event = events.recv() => match event {
                    Ok(TransportEvent::Frame(frame)) => match Response::from_frame(&frame) {
                        // Only echoes that follow a write of ours count
                        Ok(Response::WriteAck { address, .. }) if attempts == 0 => {
                            debug!("Ignoring echo of coil {:#06x} received before the first write", address);
                        }
                        Ok(Response::WriteAck { address, .. }) => {
                            if address != coil {
                                debug!("Acknowledgement names coil {:#06x}, pending {:#06x}", address, coil);
                            }
                            info!("Coil {:#06x} acknowledged after {} attempts", coil, attempts);
                            return Ok(Acknowledged { attempts });
                        }
                        Ok(Response::Exception { function, code }) => {
                            warn!("Controller rejected function {:#04x} with exception {}", function, code);
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Ignoring undecodable frame: {}", e),
                    },
                    Ok(TransportEvent::Error(e)) => {
                        return Err(DispatchError::Transport(TransportError::SerialError(e)));
                    }
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        return Err(DispatchError::Closed);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dispatcher lagged, skipped {} transport events", skipped);
                    }
                },

                _ = ticker.tick() => {
                    if attempts >= self.max_attempts {
                        warn!("Coil {:#06x} not acknowledged after {} attempts", coil, attempts);
                        return Err(DispatchError::Timeout { attempts });
                    }
                    attempts += 1;
                    debug!("Writing coil {:#06x} (attempt {}/{})", coil, attempts, self.max_attempts);
                    self.transport.send(request).await?;
                }
            }
        }
    }

    /// Set `coil` once without waiting for an acknowledgement
    pub async fn send_once(&self, coil: u16) -> Result<(), DispatchError> {
        self.write_coil(coil, true).await
    }

    /// Write `coil` once; bounded by the command timeout, no acknowledgement awaited
    pub async fn write_coil(&self, coil: u16, on: bool) -> Result<(), DispatchError> {
        debug!("Writing coil {:#06x} = {} once", coil, on);
        self.bounded(async {
            self.transport
                .send(Request::WriteSingleCoil { address: coil, on })
                .await
                .map_err(DispatchError::from)
        })
        .await
    }

    /// Read a single coil
    pub async fn read_coil(&self, address: u16) -> Result<bool, DispatchError> {
        let request = Request::ReadCoils {
            start: address,
            quantity: 1,
        };
        self.query(request, |response| match response {
            Response::Coils(bits) => bits.first().copied(),
            _ => None,
        })
        .await
    }

    /// Read a single holding register
    pub async fn read_register(&self, address: u16) -> Result<u16, DispatchError> {
        let request = Request::ReadHoldingRegisters {
            start: address,
            quantity: 1,
        };
        self.query(request, |response| match response {
            Response::Registers(values) if values.len() == 1 => values.first().copied(),
            _ => None,
        })
        .await
    }

    /// Send `request` and return the first reply `extract` accepts
    async fn query<T>(
        &self,
        request: Request,
        extract: impl Fn(Response) -> Option<T>,
    ) -> Result<T, DispatchError> {
        let mut events = self.transport.subscribe();
        let function = request.function().code();
        self.bounded(async {
            self.transport.send(request).await?;
            await_reply(&mut events, function, extract).await
        })
        .await
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, DispatchError>>,
    ) -> Result<T, DispatchError> {
        match timeout(self.command_timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No response within {:?}", self.command_timeout);
                Err(DispatchError::NoResponse(self.command_timeout))
            }
        }
    }
}

async fn await_reply<T>(
    events: &mut Receiver<TransportEvent>,
    function: u8,
    extract: impl Fn(Response) -> Option<T>,
) -> Result<T, DispatchError> {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Frame(frame)) => match Response::from_frame(&frame) {
                Ok(Response::Exception { function: rejected, code }) if rejected == function => {
                    return Err(DispatchError::Exception {
                        function: rejected,
                        code,
                    });
                }
                Ok(response) => {
                    if let Some(value) = extract(response) {
                        return Ok(value);
                    }
                }
                Err(e) => debug!("Ignoring undecodable frame: {}", e),
            },
            Ok(TransportEvent::Error(e)) => {
                return Err(DispatchError::Transport(TransportError::SerialError(e)));
            }
            Ok(TransportEvent::Closed) | Err(RecvError::Closed) => return Err(DispatchError::Closed),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Reply wait lagged, skipped {} transport events", skipped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_exclusive() {
        let slot = CommandSlot::new();
        let permit = slot.try_acquire().expect("first permit");
        assert!(slot.is_busy());
        assert!(slot.try_acquire().is_none());
        drop(permit);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn test_slot_clones_share_state() {
        let slot = CommandSlot::new();
        let other = slot.clone();
        let _permit = slot.try_acquire().unwrap();
        assert!(other.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_without_reply_times_out() {
        let (driver_side, _device_side) = tokio::io::duplex(256);
        let transport = Arc::new(Transport::from_stream(driver_side, 0x0C));
        let dispatcher = CommandDispatcher::new(transport, &Timing::default());

        assert!(matches!(
            dispatcher.read_coil(0x0015).await,
            Err(DispatchError::NoResponse(d)) if d == Duration::from_secs(3)
        ));
    }
}
