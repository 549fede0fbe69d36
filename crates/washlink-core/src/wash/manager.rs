//! Wash session manager
//!
//! Composes transport, dispatcher and poller into the wash lifecycle
//! `Idle -> Starting -> Washing -> Completed -> Idle`. All session mutation
//! happens here, under one async lock. Background work (start dispatch,
//! poller, session supervisor, watchdog, transport monitor) runs in tasks
//! whose handles the manager owns and aborts on stop, completion, reset and
//! disconnect. While a start is pending the manager also owns the command
//! permit, so cancelling the session frees the slot in the same step.
//!
//! Every task that outlives a call holds a `Weak` reference to the manager
//! and the session epoch it was started for, so a timer that fires after its
//! session ended changes nothing.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Acknowledged, CommandDispatcher, CommandPermit, CommandSlot, DispatchError};
use super::poller::{PollEvent, StatusPoller};
use super::readiness::{MachineReadiness, WashCounters};
use super::session::{SessionFault, SessionState, WashMode, WashSession};
use super::steps::StepCode;
use crate::api::{DeviceStatus, MachineInfo, StatusUpdate, UpdateKind, WashStatus};
use crate::config::{ConfigError, DriverConfig};
use crate::protocol::serial::resolve_port;
use crate::protocol::{Transport, TransportError, TransportEvent};

/// Capacity of the status update channel
const UPDATE_CAPACITY: usize = 128;

/// Poll results buffered between poller and supervisor
const POLL_CHANNEL_CAPACITY: usize = 32;

/// Errors returned by [`WashManager`] operations
#[derive(Error, Debug)]
pub enum WashError {
    /// A session or another command holds the machine
    #[error("A wash session is already in progress")]
    SessionBusy,

    /// The controller never acknowledged the start command
    #[error("Start command not acknowledged after {attempts} attempts")]
    CommandTimeout {
        /// Writes issued
        attempts: u32,
    },

    /// A single command got no reply in time
    #[error("Controller did not respond within {0:?}")]
    NoResponse(Duration),

    /// The controller answered with an exception
    #[error("Controller rejected function {function:#04x} with exception {code}")]
    Rejected {
        /// Function code of the rejected request
        function: u8,
        /// Modbus exception code
        code: u8,
    },

    /// No transport is attached
    #[error("Device not connected")]
    NotConnected,

    /// A transport is already attached
    #[error("Device already connected")]
    AlreadyConnected,

    /// The error flag is latched
    #[error("Device fault: {0}")]
    DeviceFault(SessionFault),

    /// The revision has no start coil for this mode
    #[error("Mode {0} is not supported by this controller")]
    UnsupportedMode(WashMode),

    /// The revision has no address for this function
    #[error("{0} is not supported by this controller")]
    UnsupportedCommand(&'static str),

    /// The command needs a washing session
    #[error("No wash in progress")]
    NotWashing,

    /// The session was stopped, reset or disconnected first
    #[error("Command cancelled")]
    Cancelled,

    /// Serial link failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid driver configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<DispatchError> for WashError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Timeout { attempts } => WashError::CommandTimeout { attempts },
            DispatchError::Cancelled => WashError::Cancelled,
            DispatchError::NoResponse(after) => WashError::NoResponse(after),
            DispatchError::Exception { function, code } => WashError::Rejected { function, code },
            DispatchError::Closed => WashError::Transport(TransportError::Closed),
            DispatchError::Transport(e) => WashError::Transport(e),
        }
    }
}

/// Driver for one wash machine
#[derive(Clone)]
pub struct WashManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: DriverConfig,
    state: Mutex<ManagerState>,
    slot: CommandSlot,
    updates: broadcast::Sender<StatusUpdate>,
}

struct ManagerState {
    connection: Option<Connection>,
    session: WashSession,
    tasks: SessionTasks,
}

struct Connection {
    transport: Arc<Transport>,
    watchdog: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl Connection {
    fn abort_tasks(&self) {
        self.watchdog.abort();
        self.monitor.abort();
    }
}

/// Tasks that belong to the current session
#[derive(Default)]
struct SessionTasks {
    /// Held from `Starting` until the start command settles
    permit: Option<CommandPermit>,
    start_cancel: Option<CancellationToken>,
    poller: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn cancel_all(&mut self) {
        if let Some(token) = self.start_cancel.take() {
            token.cancel();
        }
        // The cancelled dispatch may still be unwinding; the slot is free regardless
        self.permit = None;
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

impl WashManager {
    /// Create a manager; nothing is opened until [`connect`](Self::connect)
    pub fn new(config: DriverConfig) -> Result<Self, WashError> {
        config.validate()?;
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let session = WashSession::new(config.machine_id.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ManagerState {
                    connection: None,
                    session,
                    tasks: SessionTasks::default(),
                }),
                slot: CommandSlot::new(),
                updates,
            }),
        })
    }

    /// Configuration this manager was built with
    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Receive a [`StatusUpdate`] for every observable change
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.updates.subscribe()
    }

    /// Open the configured serial port
    pub async fn connect(&self) -> Result<(), WashError> {
        let mut state = self.inner.state.lock().await;
        if state.connection.is_some() {
            return Err(WashError::AlreadyConnected);
        }

        let profile = &self.inner.config.profile;
        let port = resolve_port(&self.inner.config.port_name)?;
        let transport = Transport::open(&port, &profile.serial, profile.slave_address)?;
        self.inner.attach(&mut state, transport);
        Ok(())
    }

    /// Attach to an already-open byte stream, such as a simulator pipe
    pub async fn connect_with_stream<S>(&self, stream: S) -> Result<(), WashError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut state = self.inner.state.lock().await;
        if state.connection.is_some() {
            return Err(WashError::AlreadyConnected);
        }

        let transport = Transport::from_stream(stream, self.inner.config.profile.slave_address);
        self.inner.attach(&mut state, transport);
        Ok(())
    }

    /// Cancel all session work and release the transport
    pub async fn disconnect(&self) -> Result<(), WashError> {
        let mut state = self.inner.state.lock().await;
        let connection = state.connection.take().ok_or(WashError::NotConnected)?;

        state.tasks.cancel_all();
        if state.session.is_active() {
            warn!("Disconnecting during an active session");
        }
        state.session.clear();
        connection.abort_tasks();
        connection.transport.close().await;

        info!("Machine {} disconnected", self.inner.config.machine_id);
        self.inner.emit(UpdateKind::Disconnected, &state.session);
        Ok(())
    }

    /// True while a transport is attached
    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connection.is_some()
    }

    /// Start a wash in `mode` and wait for the controller to acknowledge it
    pub async fn start_wash(&self, mode: WashMode) -> Result<(), WashError> {
        let permit = self.inner.slot.try_acquire().ok_or(WashError::SessionBusy)?;

        let (transport, coil, epoch, cancel) = {
            let mut state = self.inner.state.lock().await;
            let transport = state.transport().ok_or(WashError::NotConnected)?;
            if state.session.is_active() {
                return Err(WashError::SessionBusy);
            }
            if let Some(fault) = &state.session.error {
                return Err(WashError::DeviceFault(fault.clone()));
            }

            let profile = &self.inner.config.profile;
            let coil = profile
                .start_coil(mode)
                .ok_or(WashError::UnsupportedMode(mode))?;
            let epoch = state.session.begin(mode, profile.duration_estimate(mode));
            let cancel = CancellationToken::new();
            state.tasks.start_cancel = Some(cancel.clone());
            state.tasks.permit = Some(permit);

            info!(
                "Starting {} on machine {} (coil {:#06x})",
                mode, self.inner.config.machine_id, coil
            );
            self.inner.emit(UpdateKind::StateChanged, &state.session);
            (transport, coil, epoch, cancel)
        };

        // The dispatch runs in its own task so that dropping this future
        // cannot leave the session stuck in `Starting`
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let dispatcher = CommandDispatcher::new(transport.clone(), &inner.config.profile.timing);
            let result = dispatcher.send_start(coil, &cancel).await;
            inner.conclude_start(epoch, transport, result).await
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Start task failed: {}", e);
                Err(WashError::Cancelled)
            }
        }
    }

    /// Abort the current session from any state and send the stop command
    pub async fn stop_wash(&self) -> Result<(), WashError> {
        let mut state = self.inner.state.lock().await;
        let transport = state.transport().ok_or(WashError::NotConnected)?;

        state.tasks.cancel_all();
        if state.session.is_active() {
            info!("Stopping {:?} session", state.session.mode);
            state.session.clear();
            self.inner.emit(UpdateKind::StateChanged, &state.session);
        }

        // Written under the state lock so a new start cannot slip in first
        let timing = &self.inner.config.profile.timing;
        CommandDispatcher::new(transport, timing)
            .send_once(self.inner.config.profile.coils.stop)
            .await?;
        Ok(())
    }

    /// Cancel everything, send the reset command and clear the error flag
    pub async fn reset(&self) -> Result<(), WashError> {
        let mut state = self.inner.state.lock().await;
        let transport = state.transport().ok_or(WashError::NotConnected)?;

        state.tasks.cancel_all();
        let was_active = state.session.is_active();
        state.session.clear();
        if was_active {
            self.inner.emit(UpdateKind::StateChanged, &state.session);
        }

        let timing = &self.inner.config.profile.timing;
        CommandDispatcher::new(transport, timing)
            .send_once(self.inner.config.profile.coils.reset)
            .await?;

        if let Some(fault) = state.session.error.take() {
            info!("Cleared fault: {}", fault);
            self.inner.emit(UpdateKind::FaultCleared, &state.session);
        }
        Ok(())
    }

    /// Hold the running cycle
    pub async fn pause(&self) -> Result<(), WashError> {
        self.set_paused(true).await
    }

    /// Continue a held cycle
    pub async fn resume(&self) -> Result<(), WashError> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<(), WashError> {
        let mut state = self.inner.state.lock().await;
        let transport = state.transport().ok_or(WashError::NotConnected)?;
        let profile = &self.inner.config.profile;
        let coil = profile.coils.pause.ok_or(WashError::UnsupportedCommand("Pause"))?;
        if state.session.state != SessionState::Washing {
            return Err(WashError::NotWashing);
        }
        if state.session.paused == paused {
            return Ok(());
        }

        CommandDispatcher::new(transport, &profile.timing)
            .write_coil(coil, paused)
            .await?;

        let now = Instant::now();
        let kind = if paused {
            state.session.pause(now);
            UpdateKind::Paused
        } else {
            state.session.resume(now);
            UpdateKind::Resumed
        };
        info!("Session {:?} {:?}", state.session.session_id, kind);
        self.inner.emit(kind, &state.session);
        Ok(())
    }

    /// Read the gantry and vehicle flags; only while no wash runs
    pub async fn read_readiness(&self) -> Result<MachineReadiness, WashError> {
        let (dispatcher, _permit) = self.idle_dispatcher().await?;
        let readiness = MachineReadiness::read(&dispatcher, &self.inner.config.profile.coils).await?;
        debug!("Readiness: {:?}", readiness);
        Ok(readiness)
    }

    /// Read the controller's wash counters; only while no wash runs
    pub async fn read_counters(&self) -> Result<WashCounters, WashError> {
        let registers = &self.inner.config.profile.registers;
        if registers.total_count.is_none() && registers.daily_count.is_none() {
            return Err(WashError::UnsupportedCommand("Wash counters"));
        }
        let (dispatcher, _permit) = self.idle_dispatcher().await?;
        Ok(WashCounters::read(&dispatcher, registers).await?)
    }

    /// A dispatcher for one-off reads, with the command slot held.
    ///
    /// Read replies carry no address, so nothing else may be polling.
    async fn idle_dispatcher(&self) -> Result<(CommandDispatcher, CommandPermit), WashError> {
        let permit = self.inner.slot.try_acquire().ok_or(WashError::SessionBusy)?;
        let state = self.inner.state.lock().await;
        let transport = state.transport().ok_or(WashError::NotConnected)?;
        if state.session.is_active() {
            return Err(WashError::SessionBusy);
        }
        let dispatcher = CommandDispatcher::new(transport, &self.inner.config.profile.timing);
        Ok((dispatcher, permit))
    }

    /// Current connection and session snapshot
    pub async fn status(&self) -> DeviceStatus {
        let state = self.inner.state.lock().await;
        DeviceStatus {
            connected: state.connection.is_some(),
            status: WashStatus::from_session(&state.session, Instant::now()),
            machine_info: MachineInfo::from(&self.inner.config),
            last_status_received_at: state.session.last_status_received_at,
        }
    }

    /// Current lifecycle state
    pub async fn session_state(&self) -> SessionState {
        self.inner.state.lock().await.session.state
    }
}

impl ManagerState {
    fn transport(&self) -> Option<Arc<Transport>> {
        self.connection.as_ref().map(|c| c.transport.clone())
    }
}

impl Inner {
    fn emit(&self, kind: UpdateKind, session: &WashSession) {
        // No subscribers is fine
        let _ = self.updates.send(StatusUpdate::new(kind, session));
    }

    fn attach(self: &Arc<Self>, state: &mut ManagerState, transport: Transport) {
        let transport = Arc::new(transport);
        let events = transport.subscribe();

        let monitor = tokio::spawn(monitor_transport(Arc::downgrade(self), events));
        let watchdog = tokio::spawn(watchdog(
            Arc::downgrade(self),
            self.config.profile.timing.watchdog_interval(),
        ));

        // A new link supersedes a fault raised by the old one
        if matches!(state.session.error, Some(SessionFault::Transport(_))) {
            state.session.error = None;
        }
        state.session.connection_healthy = true;
        state.connection = Some(Connection {
            transport,
            watchdog,
            monitor,
        });

        info!(
            "Machine {} connected (slave {:#04x})",
            self.config.machine_id, self.config.profile.slave_address
        );
        self.emit(UpdateKind::Connected, &state.session);
    }

    async fn conclude_start(
        self: &Arc<Self>,
        epoch: u64,
        transport: Arc<Transport>,
        result: Result<Acknowledged, DispatchError>,
    ) -> Result<(), WashError> {
        let mut state = self.state.lock().await;
        if state.session.epoch != epoch {
            debug!("Start for epoch {} superseded", epoch);
            return Err(match result {
                Ok(_) => WashError::Cancelled,
                Err(e) => e.into(),
            });
        }
        state.tasks.start_cancel = None;
        state.tasks.permit = None;

        match result {
            Ok(ack) => {
                let now = Instant::now();
                state.session.state = SessionState::Washing;
                state.session.started_at = Some(Utc::now());
                state.session.started_instant = Some(now);
                info!(
                    "Session {:?} washing after {} attempts",
                    state.session.session_id, ack.attempts
                );

                let (tx, rx) = mpsc::channel(POLL_CHANNEL_CAPACITY);
                let poller = StatusPoller::new(transport, &self.config.profile).spawn(tx);
                let supervisor = tokio::spawn(supervise(
                    Arc::downgrade(self),
                    epoch,
                    rx,
                    self.config.profile.timing.wash_timeout(),
                ));
                state.tasks.poller = Some(poller);
                state.tasks.supervisor = Some(supervisor);

                self.emit(UpdateKind::StateChanged, &state.session);
                Ok(())
            }
            Err(e) => {
                warn!("Start failed: {}", e);
                state.session.clear();
                self.emit(UpdateKind::StateChanged, &state.session);
                Err(e.into())
            }
        }
    }

    /// Apply one poll result; returns false once the session is over
    async fn apply_poll(&self, epoch: u64, event: PollEvent) -> bool {
        let mut state = self.state.lock().await;
        if state.session.epoch != epoch || state.session.state != SessionState::Washing {
            return false;
        }

        let session = &mut state.session;
        session.last_status_at = Some(Instant::now());
        session.last_status_received_at = Some(Utc::now());
        if !session.connection_healthy {
            info!("Status frames resumed");
            session.connection_healthy = true;
            self.emit(UpdateKind::HealthChanged, session);
        }

        match event {
            PollEvent::ErrorFlag(true) if session.error.is_none() => {
                error!("Controller raised its error flag");
                session.error = Some(SessionFault::Hardware);
                self.emit(UpdateKind::Fault, session);
                true
            }
            PollEvent::ErrorFlag(_) => true,
            PollEvent::Step(report) => {
                let step = report.step_code;
                if step != session.step_code {
                    debug!("Step {} -> {}", session.step_code, step);
                    session.step_code = step;
                    self.emit(UpdateKind::StepChanged, session);
                }
                if step.is_washing() {
                    session.saw_washing_step = true;
                }

                let ended = step == StepCode::WashEnded
                    || (step == StepCode::Idle && session.saw_washing_step);
                if ended {
                    self.finish(&mut state);
                    return false;
                }
                true
            }
        }
    }

    async fn force_complete(&self, epoch: u64) {
        let mut state = self.state.lock().await;
        if state.session.epoch != epoch || state.session.state != SessionState::Washing {
            return;
        }
        warn!(
            "Session {:?} hit the hard timeout without a completion step, forcing completion",
            state.session.session_id
        );
        self.finish(&mut state);
    }

    /// `Washing -> Completed -> Idle`; only called from the supervisor
    fn finish(&self, state: &mut ManagerState) {
        state.session.state = SessionState::Completed;
        info!("Session {:?} completed", state.session.session_id);
        self.emit(UpdateKind::StateChanged, &state.session);

        if let Some(handle) = state.tasks.poller.take() {
            handle.abort();
        }
        // The supervisor is the caller and exits on its own
        state.tasks.supervisor.take();
        state.tasks.start_cancel.take();
        state.tasks.permit.take();

        state.session.clear();
        self.emit(UpdateKind::StateChanged, &state.session);
    }

    async fn check_health(&self) {
        let mut state = self.state.lock().await;
        let session = &mut state.session;
        if session.state != SessionState::Washing || !session.connection_healthy {
            return;
        }
        let Some(reference) = session.last_status_at.or(session.started_instant) else {
            return;
        };

        let silence = Instant::now().saturating_duration_since(reference);
        if silence > self.config.profile.timing.health_threshold() {
            warn!("No status frame for {:?}, connection unhealthy", silence);
            session.connection_healthy = false;
            self.emit(UpdateKind::HealthChanged, session);
        }
    }

    async fn transport_failed(&self, reason: String) {
        let mut state = self.state.lock().await;
        if state.connection.is_none() {
            return;
        }
        error!("Serial link failed: {}", reason);

        state.tasks.cancel_all();
        state.session.clear();
        state.session.error = Some(SessionFault::Transport(reason));
        state.session.connection_healthy = false;
        self.emit(UpdateKind::Fault, &state.session);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.tasks.cancel_all();
        if let Some(connection) = state.connection.take() {
            connection.abort_tasks();
        }
    }
}

/// Drive one washing session from poll results and the hard timeout
async fn supervise(
    inner: Weak<Inner>,
    epoch: u64,
    mut polls: mpsc::Receiver<PollEvent>,
    timeout: Duration,
) {
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                if let Some(inner) = inner.upgrade() {
                    inner.force_complete(epoch).await;
                }
                return;
            }

            event = polls.recv() => {
                let Some(event) = event else { return };
                let Some(inner) = inner.upgrade() else { return };
                if !inner.apply_poll(epoch, event).await {
                    return;
                }
            }
        }
    }
}

async fn watchdog(inner: Weak<Inner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        inner.check_health().await;
    }
}

async fn monitor_transport(inner: Weak<Inner>, mut events: broadcast::Receiver<TransportEvent>) {
    let reason = loop {
        match events.recv().await {
            Ok(TransportEvent::Frame(_)) | Err(RecvError::Lagged(_)) => continue,
            Ok(TransportEvent::Error(e)) => break e,
            Ok(TransportEvent::Closed) => break "stream closed by peer".to_string(),
            Err(RecvError::Closed) => return,
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.transport_failed(reason).await;
    }
}
