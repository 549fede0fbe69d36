//! Protocol Simulator - a virtual wash controller for testing
//!
//! Answers read-coil, read-register, write-coil and write-register requests
//! over an in-memory pipe, and runs a wash cycle through its step register
//! when a start coil is set. A set pause coil holds the cycle on its current
//! step, and finished cycles bump the wash counters.
//!
//! Line splitting, hex handling and checksums are implemented here
//! separately from [`crate::protocol`], so the simulator also checks the
//! driver's codec against a second implementation.
//!
//! Adversarial knobs (dropped frames, ignored writes, raised error flag,
//! muting) exercise the driver's retry and health logic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

use crate::config::DeviceProfile;

/// Size of the virtual coil and register spaces
const ADDRESS_SPACE: usize = 0x1_0000;

/// Longest request line the simulator accepts
const MAX_LINE: usize = 1024;

/// In-memory pipe capacity
const PIPE_CAPACITY: usize = 4096;

const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
const EXCEPTION_ILLEGAL_ADDRESS: u8 = 0x02;
const EXCEPTION_ILLEGAL_VALUE: u8 = 0x03;

/// Behaviour of a simulated controller
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Slave address the controller answers to
    pub slave_address: u8,
    /// Register holding the current step code
    pub step_register: u16,
    /// Set while a cycle runs
    pub running_coil: Option<u16>,
    /// Hardware error flag
    pub error_coil: Option<u16>,
    /// Step sequence run by each start coil
    pub programs: BTreeMap<u16, Vec<u16>>,
    /// Coils that abort a running cycle
    pub stop_coils: Vec<u16>,
    /// Coil that aborts the cycle and clears the error flag
    pub reset_coil: Option<u16>,
    /// Coil that holds the cycle while set
    pub pause_coil: Option<u16>,
    /// Register counting finished cycles
    pub total_count_register: Option<u16>,
    /// Register counting today's finished cycles
    pub daily_count_register: Option<u16>,
    /// Coil set while the gantry is parked
    pub at_origin_coil: Option<u16>,
    /// Coils set at power-on
    pub initial_coils: Vec<u16>,
    /// Time each step stays in the register
    pub step_interval: Duration,
    /// Fraction of inbound frames silently ignored
    pub drop_ratio: f64,
    /// Number of leading write requests silently ignored
    pub ignore_first_writes: u32,
    /// Seed for the drop decisions
    pub seed: u64,
}

const MODE1_STEPS: [u16; 8] = [10, 2, 3, 6, 7, 4, 5, 1];
const MODE2_STEPS: [u16; 10] = [10, 2, 3, 8, 9, 6, 7, 4, 5, 1];
const MODE3_STEPS: [u16; 6] = [10, 2, 6, 7, 5, 1];
const MODE4_STEPS: [u16; 11] = [10, 2, 3, 8, 9, 6, 3, 7, 4, 5, 1];

impl SimulatorConfig {
    /// FL3.0 controller
    pub fn fl30() -> Self {
        Self {
            slave_address: 0x0C,
            step_register: 0x000A,
            running_coil: Some(0x0092),
            error_coil: Some(0x0012),
            programs: BTreeMap::from([
                (0x012F, MODE1_STEPS.to_vec()),
                (0x012E, MODE2_STEPS.to_vec()),
            ]),
            stop_coils: vec![0x0005],
            reset_coil: Some(0x0005),
            pause_coil: None,
            total_count_register: None,
            daily_count_register: None,
            at_origin_coil: Some(0x0093),
            initial_coils: vec![0x0015, 0x0016, 0x0018],
            step_interval: Duration::from_secs(5),
            drop_ratio: 0.0,
            ignore_first_writes: 0,
            seed: 0,
        }
    }

    /// SG90 controller
    pub fn sg90() -> Self {
        Self {
            slave_address: 0x01,
            step_register: 0x1000,
            running_coil: Some(0x08D6),
            error_coil: Some(0x08D9),
            programs: BTreeMap::from([
                (0x0905, MODE1_STEPS.to_vec()),
                (0x0906, MODE2_STEPS.to_vec()),
                (0x0904, MODE3_STEPS.to_vec()),
                (0x0908, MODE4_STEPS.to_vec()),
            ]),
            stop_coils: vec![0x083C],
            reset_coil: Some(0x0820),
            pause_coil: Some(0x0847),
            total_count_register: Some(0x19F6),
            daily_count_register: Some(0x19F8),
            at_origin_coil: None,
            initial_coils: Vec::new(),
            step_interval: Duration::from_secs(5),
            drop_ratio: 0.0,
            ignore_first_writes: 0,
            seed: 0,
        }
    }

    /// A controller answering to the addresses in `profile`
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        let steps = [
            MODE1_STEPS.to_vec(),
            MODE2_STEPS.to_vec(),
            MODE3_STEPS.to_vec(),
            MODE4_STEPS.to_vec(),
        ];
        let programs = profile
            .coils
            .start
            .iter()
            .map(|(mode, &coil)| (coil, steps[*mode as usize].clone()))
            .collect();

        Self {
            slave_address: profile.slave_address,
            step_register: profile.registers.step,
            running_coil: profile.coils.running,
            error_coil: profile.coils.error,
            programs,
            stop_coils: vec![profile.coils.stop],
            reset_coil: Some(profile.coils.reset),
            pause_coil: profile.coils.pause,
            total_count_register: profile.registers.total_count,
            daily_count_register: profile.registers.daily_count,
            at_origin_coil: profile.coils.readiness.at_origin,
            initial_coils: profile.coils.readiness.origin.clone(),
            ..Self::fl30()
        }
    }

    /// Time each step stays in the register
    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    /// Ignore `ratio` of inbound frames, decided by a generator seeded with `seed`
    pub fn with_drop_ratio(mut self, ratio: f64, seed: u64) -> Self {
        self.drop_ratio = ratio.clamp(0.0, 1.0);
        self.seed = seed;
        self
    }

    /// Ignore the first `count` write requests
    pub fn with_ignore_first_writes(mut self, count: u32) -> Self {
        self.ignore_first_writes = count;
        self
    }
}

/// Entry point for spawning simulated controllers
pub struct Simulator;

impl Simulator {
    /// Spawn a controller task; returns the driver's end of the pipe.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: SimulatorConfig) -> (DuplexStream, SimulatorHandle) {
        let (driver_side, device_side) = tokio::io::duplex(PIPE_CAPACITY);
        let shared = Arc::new(Shared::new(config));
        let task = tokio::spawn(run(device_side, shared.clone()));
        (driver_side, SimulatorHandle { shared, task })
    }
}

/// Control and inspection of a running simulator
pub struct SimulatorHandle {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl SimulatorHandle {
    /// Raise or clear the hardware error coil
    pub fn set_error_flag(&self, on: bool) {
        let mut device = self.shared.lock();
        if let Some(coil) = self.shared.config.error_coil {
            device.coils[coil as usize] = on;
        }
    }

    /// Set a coil directly, as a field sensor would
    pub fn set_coil(&self, address: u16, on: bool) {
        self.shared.lock().coils[address as usize] = on;
    }

    /// Stop (or resume) answering every request
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
    }

    /// Valid frames addressed to this controller
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    /// Write requests received, answered or not
    pub fn writes_received(&self) -> u64 {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Responses sent
    pub fn answered(&self) -> u64 {
        self.shared.answered.load(Ordering::SeqCst)
    }

    /// Current value of a coil
    pub fn coil(&self, address: u16) -> bool {
        self.shared.lock().coils[address as usize]
    }

    /// Current value of a holding register
    pub fn register(&self, address: u16) -> u16 {
        self.shared.lock().registers[address as usize]
    }

    /// Current value of the step register
    pub fn step(&self) -> u16 {
        self.register(self.shared.config.step_register)
    }

    /// True while a wash cycle runs
    pub fn is_running(&self) -> bool {
        self.shared.lock().cycle.is_some()
    }

    /// True while the running cycle is held by the pause coil
    pub fn is_paused(&self) -> bool {
        self.shared
            .lock()
            .cycle
            .as_ref()
            .is_some_and(|c| c.held.is_some())
    }

    /// Stop the controller task and close its end of the pipe
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Cycle {
    coil: u16,
    steps: Vec<u16>,
    index: usize,
    next_step_at: Instant,
    /// Time left on the current step while paused
    held: Option<Duration>,
}

struct Device {
    coils: Vec<bool>,
    registers: Vec<u16>,
    cycle: Option<Cycle>,
    rng: StdRng,
    writes_ignored: u32,
}

struct Shared {
    config: SimulatorConfig,
    device: Mutex<Device>,
    muted: AtomicBool,
    received: AtomicU64,
    writes: AtomicU64,
    answered: AtomicU64,
}

impl Shared {
    fn new(config: SimulatorConfig) -> Self {
        let mut device = Device {
            coils: vec![false; ADDRESS_SPACE],
            registers: vec![0; ADDRESS_SPACE],
            cycle: None,
            rng: StdRng::seed_from_u64(config.seed),
            writes_ignored: 0,
        };
        for &coil in config.initial_coils.iter().chain(&config.at_origin_coil) {
            device.coils[coil as usize] = true;
        }
        Self {
            config,
            device: Mutex::new(device),
            muted: AtomicBool::new(false),
            received: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            answered: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Device> {
        // Nothing panics while holding the lock; recover anyway
        self.device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_step_at(&self) -> Option<Instant> {
        self.lock()
            .cycle
            .as_ref()
            .filter(|c| c.held.is_none())
            .map(|c| c.next_step_at)
    }

    /// Handle one request line; returns the response line, if any
    fn handle_line(&self, line: &str) -> Option<String> {
        let Some(bytes) = decode_line(line) else {
            debug!("Simulator ignoring malformed line {:?}", line);
            return None;
        };
        let (&slave, request) = bytes.split_first()?;
        if slave != self.config.slave_address || request.is_empty() {
            return None;
        }

        self.received.fetch_add(1, Ordering::SeqCst);
        let function = request[0];
        let is_write = matches!(function, 0x05 | 0x06);
        if is_write {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }

        if self.muted.load(Ordering::SeqCst) {
            trace!("Simulator muted, ignoring function {:#04x}", function);
            return None;
        }

        let mut device = self.lock();
        if is_write && device.writes_ignored < self.config.ignore_first_writes {
            device.writes_ignored += 1;
            debug!("Simulator ignoring write {}", device.writes_ignored);
            return None;
        }
        if self.config.drop_ratio > 0.0 && device.rng.gen_bool(self.config.drop_ratio) {
            debug!("Simulator dropping function {:#04x}", function);
            return None;
        }

        let body = match self.respond(&mut device, function, &request[1..]) {
            Ok(body) => body,
            Err(code) => vec![function | 0x80, code],
        };
        drop(device);

        let mut reply = Vec::with_capacity(body.len() + 1);
        reply.push(self.config.slave_address);
        reply.extend(body);
        self.answered.fetch_add(1, Ordering::SeqCst);
        Some(encode_line(&reply))
    }

    fn respond(&self, device: &mut Device, function: u8, data: &[u8]) -> Result<Vec<u8>, u8> {
        let (address, value) = match data {
            [a_hi, a_lo, v_hi, v_lo] => (
                u16::from_be_bytes([*a_hi, *a_lo]),
                u16::from_be_bytes([*v_hi, *v_lo]),
            ),
            _ if matches!(function, 0x01 | 0x03 | 0x05 | 0x06) => {
                return Err(EXCEPTION_ILLEGAL_VALUE)
            }
            _ => return Err(EXCEPTION_ILLEGAL_FUNCTION),
        };

        match function {
            0x01 => {
                let range = checked_range(address, value, 2000)?;
                let mut packed = vec![0u8; (range.len() + 7) / 8];
                for (i, on) in device.coils[range].iter().enumerate() {
                    if *on {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                let mut body = vec![0x01, packed.len() as u8];
                body.extend(packed);
                Ok(body)
            }
            0x03 => {
                let range = checked_range(address, value, 125)?;
                let mut body = vec![0x03, (range.len() * 2) as u8];
                for register in &device.registers[range] {
                    body.extend(register.to_be_bytes());
                }
                Ok(body)
            }
            0x05 => {
                let on = match value {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err(EXCEPTION_ILLEGAL_VALUE),
                };
                device.coils[address as usize] = on;
                if on {
                    self.on_coil_set(device, address);
                } else if self.config.pause_coil == Some(address) {
                    self.release_cycle(device);
                }
                Ok(echo(0x05, address, value))
            }
            0x06 => {
                device.registers[address as usize] = value;
                Ok(echo(0x06, address, value))
            }
            _ => Err(EXCEPTION_ILLEGAL_FUNCTION),
        }
    }

    fn on_coil_set(&self, device: &mut Device, coil: u16) {
        if self.config.pause_coil == Some(coil) {
            self.hold_cycle(device);
            return;
        }
        if let Some(steps) = self.config.programs.get(&coil) {
            if device.cycle.is_some() {
                debug!("Simulator already washing, ignoring start coil {:#06x}", coil);
                return;
            }
            let Some(&first) = steps.first() else { return };
            info!("Simulator starting program on coil {:#06x}", coil);
            device.registers[self.config.step_register as usize] = first;
            if let Some(running) = self.config.running_coil {
                device.coils[running as usize] = true;
            }
            if let Some(origin) = self.config.at_origin_coil {
                device.coils[origin as usize] = false;
            }
            device.cycle = Some(Cycle {
                coil,
                steps: steps.clone(),
                index: 0,
                next_step_at: Instant::now() + self.config.step_interval,
                held: None,
            });
            return;
        }

        let is_reset = self.config.reset_coil == Some(coil);
        if self.config.stop_coils.contains(&coil) || is_reset {
            if device.cycle.is_some() {
                info!("Simulator cycle stopped by coil {:#06x}", coil);
            }
            self.end_cycle(device);
            device.coils[coil as usize] = false;
        }
        if is_reset {
            if let Some(error) = self.config.error_coil {
                device.coils[error as usize] = false;
            }
        }
    }

    fn hold_cycle(&self, device: &mut Device) {
        let Some(cycle) = device.cycle.as_mut() else {
            debug!("Simulator not washing, pause ignored");
            return;
        };
        if cycle.held.is_none() {
            let left = cycle.next_step_at.saturating_duration_since(Instant::now());
            info!("Simulator cycle paused with {:?} left on step {}", left, cycle.index);
            cycle.held = Some(left);
        }
    }

    fn release_cycle(&self, device: &mut Device) {
        let Some(cycle) = device.cycle.as_mut() else { return };
        if let Some(left) = cycle.held.take() {
            info!("Simulator cycle resumed");
            cycle.next_step_at = Instant::now() + left;
        }
    }

    fn end_cycle(&self, device: &mut Device) {
        if let Some(cycle) = device.cycle.take() {
            device.coils[cycle.coil as usize] = false;
        }
        device.registers[self.config.step_register as usize] = 0;
        for coil in [self.config.running_coil, self.config.pause_coil].into_iter().flatten() {
            device.coils[coil as usize] = false;
        }
        if let Some(origin) = self.config.at_origin_coil {
            device.coils[origin as usize] = true;
        }
    }

    fn count_wash(&self, device: &mut Device) {
        for register in [self.config.total_count_register, self.config.daily_count_register]
            .into_iter()
            .flatten()
        {
            let count = &mut device.registers[register as usize];
            *count = count.wrapping_add(1);
        }
    }

    fn advance_step(&self) {
        let mut guard = self.lock();
        let device = &mut *guard;
        let Some(cycle) = device.cycle.as_mut() else { return };
        if cycle.held.is_some() {
            return;
        }

        cycle.index += 1;
        match cycle.steps.get(cycle.index).copied() {
            Some(step) => {
                cycle.next_step_at += self.config.step_interval;
                trace!("Simulator step -> {}", step);
                device.registers[self.config.step_register as usize] = step;
            }
            None => {
                debug!("Simulator cycle finished");
                self.end_cycle(device);
                self.count_wash(device);
            }
        }
    }
}

async fn run(stream: DuplexStream, shared: Arc<Shared>) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE));

    loop {
        let deadline = shared.next_step_at();
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    let Some(reply) = shared.handle_line(&line) else { continue };
                    trace!("Simulator TX: {}", reply.trim_end());
                    if let Err(e) = write_half.write_all(reply.as_bytes()).await {
                        warn!("Simulator write failed: {}", e);
                        return;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("Simulator discarding request line over {} bytes", MAX_LINE);
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!("Simulator read failed: {}", e);
                    return;
                }
                None => {
                    debug!("Simulator pipe closed");
                    return;
                }
            },

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                shared.advance_step();
            }
        }
    }
}

fn checked_range(start: u16, quantity: u16, max: u16) -> Result<std::ops::Range<usize>, u8> {
    if quantity == 0 || quantity > max {
        return Err(EXCEPTION_ILLEGAL_VALUE);
    }
    let start = start as usize;
    let end = start + quantity as usize;
    if end > ADDRESS_SPACE {
        return Err(EXCEPTION_ILLEGAL_ADDRESS);
    }
    Ok(start..end)
}

fn echo(function: u8, address: u16, value: u16) -> Vec<u8> {
    let mut body = vec![function];
    body.extend(address.to_be_bytes());
    body.extend(value.to_be_bytes());
    body
}

/// Longitudinal redundancy check: 0x100 minus the byte sum, modulo 0x100
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    ((0x100 - (sum % 0x100)) % 0x100) as u8
}

/// Render `bytes` plus checksum as a complete request/response line
pub fn encode_line(bytes: &[u8]) -> String {
    let mut line = String::with_capacity(bytes.len() * 2 + 5);
    line.push(':');
    for b in bytes.iter().chain(std::iter::once(&checksum(bytes))) {
        line.push_str(&format!("{:02X}", b));
    }
    line.push_str("\r\n");
    line
}

/// Parse one line (terminator optional); `None` unless the checksum verifies
pub fn decode_line(line: &str) -> Option<Vec<u8>> {
    let body = line.trim_end_matches(['\r', '\n']).strip_prefix(':')?;
    if !body.is_ascii() || body.len() % 2 != 0 || body.len() < 4 {
        return None;
    }

    let mut bytes = (0..body.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&body[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;

    let received = bytes.pop()?;
    (checksum(&bytes) == received).then_some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn handle(shared: &Shared, bytes: &[u8]) -> Option<Vec<u8>> {
        shared
            .handle_line(&encode_line(bytes))
            .and_then(|line| decode_line(&line))
    }

    #[test]
    fn test_line_codec() {
        assert_eq!(encode_line(&[0x01, 0x05, 0x09, 0x05, 0xFF, 0x00]), ":01050905FF00ED\r\n");
        assert_eq!(
            decode_line(":01050905ff00ed\r\n"),
            Some(vec![0x01, 0x05, 0x09, 0x05, 0xFF, 0x00])
        );
        assert_eq!(decode_line(":01050905FF00EE\r\n"), None);
        assert_eq!(decode_line("01050905FF00ED"), None);
    }

    #[test]
    fn test_write_coil_echoes() {
        let shared = Shared::new(SimulatorConfig::fl30());
        let reply = handle(&shared, &[0x0C, 0x05, 0x00, 0x40, 0xFF, 0x00]);
        assert_eq!(reply, Some(vec![0x0C, 0x05, 0x00, 0x40, 0xFF, 0x00]));
        assert!(shared.lock().coils[0x40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_coil_runs_program() {
        let shared = Shared::new(SimulatorConfig::fl30());
        handle(&shared, &[0x0C, 0x05, 0x01, 0x2F, 0xFF, 0x00]).unwrap();
        assert_eq!(shared.lock().registers[0x000A], 10);
        assert!(shared.lock().coils[0x0092]);

        for expected in [2, 3, 6, 7, 4, 5, 1] {
            shared.advance_step();
            assert_eq!(shared.lock().registers[0x000A], expected);
        }
        shared.advance_step();
        assert_eq!(shared.lock().registers[0x000A], 0);
        assert!(!shared.lock().coils[0x0092]);
        assert!(shared.lock().cycle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_coil_ends_cycle() {
        let shared = Shared::new(SimulatorConfig::fl30());
        handle(&shared, &[0x0C, 0x05, 0x01, 0x2E, 0xFF, 0x00]).unwrap();
        handle(&shared, &[0x0C, 0x05, 0x00, 0x05, 0xFF, 0x00]).unwrap();
        assert!(shared.lock().cycle.is_none());
        assert_eq!(shared.lock().registers[0x000A], 0);
    }

    #[test]
    fn test_reset_coil_clears_error_flag() {
        let shared = Shared::new(SimulatorConfig::sg90());
        shared.lock().coils[0x08D9] = true;
        handle(&shared, &[0x01, 0x05, 0x08, 0x3C, 0xFF, 0x00]).unwrap();
        assert!(shared.lock().coils[0x08D9]);
        handle(&shared, &[0x01, 0x05, 0x08, 0x20, 0xFF, 0x00]).unwrap();
        assert!(!shared.lock().coils[0x08D9]);
    }

    #[test]
    fn test_read_registers_and_coils() {
        let shared = Shared::new(SimulatorConfig::fl30());
        shared.lock().registers[0x000A] = 6;
        shared.lock().coils[0x0012] = true;

        assert_eq!(
            handle(&shared, &[0x0C, 0x03, 0x00, 0x0A, 0x00, 0x01]),
            Some(vec![0x0C, 0x03, 0x02, 0x00, 0x06])
        );
        assert_eq!(
            handle(&shared, &[0x0C, 0x01, 0x00, 0x12, 0x00, 0x01]),
            Some(vec![0x0C, 0x01, 0x01, 0x01])
        );
    }

    #[test]
    fn test_exceptions() {
        let shared = Shared::new(SimulatorConfig::fl30());
        assert_eq!(
            handle(&shared, &[0x0C, 0x03, 0xFF, 0xFF, 0x00, 0x02]),
            Some(vec![0x0C, 0x83, EXCEPTION_ILLEGAL_ADDRESS])
        );
        assert_eq!(
            handle(&shared, &[0x0C, 0x05, 0x00, 0x05, 0x12, 0x34]),
            Some(vec![0x0C, 0x85, EXCEPTION_ILLEGAL_VALUE])
        );
        assert_eq!(
            handle(&shared, &[0x0C, 0x10, 0x00, 0x05, 0x00, 0x01]),
            Some(vec![0x0C, 0x90, EXCEPTION_ILLEGAL_FUNCTION])
        );
    }

    #[test]
    fn test_ignore_first_writes_and_other_slaves() {
        let shared = Shared::new(SimulatorConfig::fl30().with_ignore_first_writes(2));
        let write = [0x0C, 0x05, 0x00, 0x40, 0xFF, 0x00];
        assert_eq!(handle(&shared, &write), None);
        assert_eq!(handle(&shared, &write), None);
        assert!(handle(&shared, &write).is_some());
        assert_eq!(handle(&shared, &[0x01, 0x05, 0x00, 0x40, 0xFF, 0x00]), None);

        assert_eq!(shared.received.load(Ordering::SeqCst), 3);
        assert_eq!(shared.writes.load(Ordering::SeqCst), 3);
        assert_eq!(shared.answered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_ratio_is_reproducible() {
        let answered = |seed| {
            let shared = Shared::new(SimulatorConfig::fl30().with_drop_ratio(0.5, seed));
            (0..64)
                .map(|_| handle(&shared, &[0x0C, 0x03, 0x00, 0x0A, 0x00, 0x01]).is_some())
                .collect::<Vec<_>>()
        };
        let first = answered(7);
        assert_eq!(first, answered(7));
        assert!(first.iter().any(|a| *a));
        assert!(first.iter().any(|a| !*a));
    }

    #[test]
    fn test_for_profile_matches_preset_addresses() {
        let config = SimulatorConfig::for_profile(&DeviceProfile::sg90());
        let preset = SimulatorConfig::sg90();
        assert_eq!(config.slave_address, preset.slave_address);
        assert_eq!(config.programs, preset.programs);
        assert_eq!(config.stop_coils, preset.stop_coils);
        assert_eq!(config.reset_coil, preset.reset_coil);
        assert_eq!(config.pause_coil, preset.pause_coil);
        assert_eq!(config.total_count_register, preset.total_count_register);
        assert_eq!(config.daily_count_register, preset.daily_count_register);

        let config = SimulatorConfig::for_profile(&DeviceProfile::fl30());
        let preset = SimulatorConfig::fl30();
        assert_eq!(config.at_origin_coil, preset.at_origin_coil);
        assert_eq!(config.initial_coils, preset.initial_coils);
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let (mut stream, simulator) = Simulator::spawn(SimulatorConfig::fl30());
        let mut junk = vec![b'0'; MAX_LINE * 2];
        junk.extend_from_slice(b"\r\n");
        stream.write_all(&junk).await.unwrap();
        let read_step = encode_line(&[0x0C, 0x03, 0x00, 0x0A, 0x00, 0x01]);
        stream.write_all(read_step.as_bytes()).await.unwrap();

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await.unwrap();
        assert_eq!(decode_line(&reply), Some(vec![0x0C, 0x03, 0x02, 0x00, 0x00]));
        assert_eq!(simulator.answered(), 1);
    }

    #[test]
    fn test_fl30_powers_on_homed() {
        let shared = Shared::new(SimulatorConfig::fl30());
        for coil in [0x15, 0x16, 0x18, 0x93] {
            assert!(shared.lock().coils[coil], "{:#x}", coil);
        }

        handle(&shared, &[0x0C, 0x05, 0x01, 0x2F, 0xFF, 0x00]).unwrap();
        assert!(!shared.lock().coils[0x93]);
        handle(&shared, &[0x0C, 0x05, 0x00, 0x05, 0xFF, 0x00]).unwrap();
        assert!(shared.lock().coils[0x93]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_step() {
        let shared = Shared::new(SimulatorConfig::sg90());
        handle(&shared, &[0x01, 0x05, 0x09, 0x05, 0xFF, 0x00]).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        handle(&shared, &[0x01, 0x05, 0x08, 0x47, 0xFF, 0x00]).unwrap();
        assert_eq!(shared.next_step_at(), None);
        shared.advance_step();
        assert_eq!(shared.lock().registers[0x1000], 10);

        tokio::time::advance(Duration::from_secs(60)).await;
        handle(&shared, &[0x01, 0x05, 0x08, 0x47, 0x00, 0x00]).unwrap();
        assert_eq!(shared.next_step_at(), Some(Instant::now() + Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_cycle_counts() {
        let shared = Shared::new(SimulatorConfig::sg90());
        handle(&shared, &[0x01, 0x05, 0x09, 0x04, 0xFF, 0x00]).unwrap();
        while shared.lock().cycle.is_some() {
            shared.advance_step();
        }
        assert_eq!(shared.lock().registers[0x19F6], 1);
        assert_eq!(shared.lock().registers[0x19F8], 1);

        // Stopped cycles are not counted
        handle(&shared, &[0x01, 0x05, 0x09, 0x04, 0xFF, 0x00]).unwrap();
        handle(&shared, &[0x01, 0x05, 0x08, 0x3C, 0xFF, 0x00]).unwrap();
        assert_eq!(shared.lock().registers[0x19F6], 1);
    }
}
