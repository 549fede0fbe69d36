//! Device configuration
//!
//! Controller revisions disagree on slave address, line settings and coil
//! map, so all of it lives in a [`DeviceProfile`] handed to the driver at
//! construction. Presets exist for the revisions seen in the field.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::serial::{DataBits, Parity, SerialSettings, StopBits};
use crate::wash::WashMode;

/// Errors in a driver configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field differs from the preset of the named revision
    #[error("Profile claims revision {revision} but its {field} does not match that revision")]
    RevisionMismatch {
        /// Revision the profile claims
        revision: Revision,
        /// Which part disagrees
        field: &'static str,
    },

    /// The start coil map is empty
    #[error("Profile defines no wash modes")]
    NoModes,

    /// A coil serves two purposes
    #[error("Coil {0:#06x} is assigned to more than one start mode or function")]
    DuplicateCoil(u16),

    /// A timing value is out of range
    #[error("Invalid timing: {0}")]
    InvalidTiming(&'static str),

    /// Empty or blank machine id
    #[error("Machine id must not be empty")]
    MissingMachineId,

    /// JSON did not parse
    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller hardware revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Revision {
    /// FL3.0 controller
    #[serde(rename = "FL30")]
    Fl30,
    /// SG90 controller
    #[serde(rename = "SG90")]
    Sg90,
    /// Anything else; no preset to compare against
    #[serde(rename = "custom")]
    Custom,
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Revision::Fl30 => "FL30",
            Revision::Sg90 => "SG90",
            Revision::Custom => "custom",
        })
    }
}

/// Coil addresses with a fixed meaning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoilMap {
    /// Start coil per wash mode
    pub start: BTreeMap<WashMode, u16>,
    /// Aborts the running cycle
    pub stop: u16,
    /// Clears the controller's fault state
    pub reset: u16,
    /// Hardware error flag, polled while washing
    #[serde(default)]
    pub error: Option<u16>,
    /// Set by the controller while a cycle runs
    #[serde(default)]
    pub running: Option<u16>,
    /// Set to hold the cycle, cleared to continue it
    #[serde(default)]
    pub pause: Option<u16>,
    /// Gantry and vehicle position flags
    #[serde(default)]
    pub readiness: ReadinessCoils,
}

/// Coils describing whether the bay can take the next car.
///
/// Every field is optional; revisions expose different subsets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessCoils {
    /// All of these must be set for the gantry to count as homed
    pub origin: Vec<u16>,
    /// Gantry parked at its origin
    pub at_origin: Option<u16>,
    /// A vehicle is in the bay
    pub car_present: Option<u16>,
    /// A vehicle has passed the entry sensor
    pub car_entry: Option<u16>,
    /// Vehicle stopped at the wash position
    pub car_stopped: Option<u16>,
    /// Vehicle still moving
    pub car_not_stopped: Option<u16>,
    /// Vehicle drove past the wash position
    pub car_over_position: Option<u16>,
}

impl ReadinessCoils {
    fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.origin.iter().copied().chain(
            [
                self.at_origin,
                self.car_present,
                self.car_entry,
                self.car_stopped,
                self.car_not_stopped,
                self.car_over_position,
            ]
            .into_iter()
            .flatten(),
        )
    }
}

/// Register addresses with a fixed meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMap {
    /// Holds the current [`StepCode`](crate::wash::StepCode)
    pub step: u16,
    /// Lifetime wash counter
    #[serde(default)]
    pub total_count: Option<u16>,
    /// Wash counter for the current day
    #[serde(default)]
    pub daily_count: Option<u16>,
}

/// Retry, polling and watchdog timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timing {
    /// Gap between start-command writes
    pub retry_interval_ms: u64,
    /// Start-command writes before giving up
    pub max_attempts: u32,
    /// Gap between status reads while washing
    pub poll_interval_ms: u64,
    /// Hard limit on one washing session
    pub wash_timeout_secs: u64,
    /// How often connection health is checked
    pub watchdog_interval_ms: u64,
    /// Silence after which the connection counts as unhealthy
    pub health_threshold_ms: u64,
    /// Bound on a single write or read round trip
    pub command_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            max_attempts: 30,
            poll_interval_ms: 1000,
            wash_timeout_secs: 20 * 60,
            watchdog_interval_ms: 10_000,
            health_threshold_ms: 30_000,
            command_timeout_ms: 3000,
        }
    }
}

impl Timing {
    /// [`retry_interval_ms`](Self::retry_interval_ms) as a duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// [`poll_interval_ms`](Self::poll_interval_ms) as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// [`wash_timeout_secs`](Self::wash_timeout_secs) as a duration
    pub fn wash_timeout(&self) -> Duration {
        Duration::from_secs(self.wash_timeout_secs)
    }

    /// [`watchdog_interval_ms`](Self::watchdog_interval_ms) as a duration
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// [`health_threshold_ms`](Self::health_threshold_ms) as a duration
    pub fn health_threshold(&self) -> Duration {
        Duration::from_millis(self.health_threshold_ms)
    }

    /// [`command_timeout_ms`](Self::command_timeout_ms) as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::InvalidTiming("retry interval must be non-zero"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidTiming("max attempts must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidTiming("poll interval must be non-zero"));
        }
        if self.watchdog_interval_ms == 0 {
            return Err(ConfigError::InvalidTiming("watchdog interval must be non-zero"));
        }
        if self.health_threshold_ms <= self.poll_interval_ms {
            return Err(ConfigError::InvalidTiming(
                "health threshold must exceed the poll interval",
            ));
        }
        if self.wash_timeout_secs == 0 {
            return Err(ConfigError::InvalidTiming("wash timeout must be non-zero"));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::InvalidTiming("command timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Everything revision-specific about a controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    /// Hardware revision; named revisions are checked against their preset
    pub revision: Revision,
    /// Modbus slave address of the controller
    pub slave_address: u8,
    /// Line settings
    pub serial: SerialSettings,
    /// Coil addresses
    pub coils: CoilMap,
    /// Register addresses
    pub registers: RegisterMap,
    /// Expected cycle length per mode, in seconds
    pub durations: BTreeMap<WashMode, u64>,
    /// Retry, polling and watchdog timing
    #[serde(default)]
    pub timing: Timing,
}

/// Used when a mode has no duration estimate
const FALLBACK_DURATION_SECS: u64 = 10 * 60;

impl DeviceProfile {
    /// FL3.0 controller: slave 12, 9600 7E1, two programmes
    pub fn fl30() -> Self {
        Self {
            revision: Revision::Fl30,
            slave_address: 0x0C,
            serial: SerialSettings {
                baud_rate: 9600,
                data_bits: DataBits::Seven,
                parity: Parity::Even,
                stop_bits: StopBits::One,
            },
            coils: CoilMap {
                start: BTreeMap::from([(WashMode::Mode1, 0x012F), (WashMode::Mode2, 0x012E)]),
                stop: 0x0005,
                reset: 0x0005,
                error: Some(0x0012),
                running: Some(0x0092),
                pause: None,
                readiness: ReadinessCoils {
                    // M21, M22, M24
                    origin: vec![0x0015, 0x0016, 0x0018],
                    at_origin: Some(0x0093),
                    car_stopped: Some(0x0011),
                    car_not_stopped: Some(0x000F),
                    car_over_position: Some(0x0010),
                    ..ReadinessCoils::default()
                },
            },
            registers: RegisterMap {
                step: 0x000A,
                total_count: None,
                daily_count: None,
            },
            durations: BTreeMap::from([(WashMode::Mode1, 8 * 60), (WashMode::Mode2, 12 * 60)]),
            timing: Timing::default(),
        }
    }

    /// SG90 controller: slave 1, 9600 7E1, four programmes
    pub fn sg90() -> Self {
        Self {
            revision: Revision::Sg90,
            slave_address: 0x01,
            serial: SerialSettings {
                baud_rate: 9600,
                data_bits: DataBits::Seven,
                parity: Parity::Even,
                stop_bits: StopBits::One,
            },
            coils: CoilMap {
                start: BTreeMap::from([
                    (WashMode::Mode1, 0x0905),
                    (WashMode::Mode2, 0x0906),
                    (WashMode::Mode3, 0x0904),
                    (WashMode::Mode4, 0x0908),
                ]),
                stop: 0x083C,
                reset: 0x0820,
                error: Some(0x08D9),
                running: Some(0x08D6),
                pause: Some(0x0847),
                readiness: ReadinessCoils {
                    car_present: Some(0x0AF0),
                    car_entry: Some(0x0866),
                    ..ReadinessCoils::default()
                },
            },
            registers: RegisterMap {
                step: 0x1000,
                total_count: Some(0x19F6),
                daily_count: Some(0x19F8),
            },
            durations: BTreeMap::from([
                (WashMode::Mode1, 8 * 60),
                (WashMode::Mode2, 10 * 60),
                (WashMode::Mode3, 12 * 60),
                (WashMode::Mode4, 15 * 60),
            ]),
            timing: Timing::default(),
        }
    }

    /// Preset for a known revision
    pub fn preset(revision: Revision) -> Option<Self> {
        match revision {
            Revision::Fl30 => Some(Self::fl30()),
            Revision::Sg90 => Some(Self::sg90()),
            Revision::Custom => None,
        }
    }

    /// Start coil for `mode`, if this revision supports it
    pub fn start_coil(&self, mode: WashMode) -> Option<u16> {
        self.coils.start.get(&mode).copied()
    }

    /// Modes this revision supports
    pub fn modes(&self) -> impl Iterator<Item = WashMode> + '_ {
        self.coils.start.keys().copied()
    }

    /// Expected cycle length for `mode`
    pub fn duration_estimate(&self, mode: WashMode) -> Duration {
        Duration::from_secs(
            self.durations
                .get(&mode)
                .copied()
                .unwrap_or(FALLBACK_DURATION_SECS),
        )
    }

    /// Check internal consistency and agreement with the named revision
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coils.start.is_empty() {
            return Err(ConfigError::NoModes);
        }

        // Start coils must be distinct from each other and from every control coil.
        // Stop and reset may share a coil; some revisions reset by stopping.
        let mut seen = BTreeSet::new();
        for &coil in self.coils.start.values() {
            if !seen.insert(coil) {
                return Err(ConfigError::DuplicateCoil(coil));
            }
        }
        let control = [
            Some(self.coils.stop),
            Some(self.coils.reset),
            self.coils.error,
            self.coils.pause,
        ];
        for coil in control.into_iter().flatten() {
            if seen.contains(&coil) {
                return Err(ConfigError::DuplicateCoil(coil));
            }
        }
        // Status flags are only read, but a start coil doubling as one is a typo
        for coil in self.coils.readiness.addresses() {
            if self.coils.start.values().any(|&start| start == coil) {
                return Err(ConfigError::DuplicateCoil(coil));
            }
        }

        self.timing.validate()?;

        if let Some(preset) = Self::preset(self.revision) {
            let mismatch = |field: &'static str| ConfigError::RevisionMismatch {
                revision: self.revision,
                field,
            };
            if preset.slave_address != self.slave_address {
                return Err(mismatch("slave address"));
            }
            if preset.serial != self.serial {
                return Err(mismatch("serial settings"));
            }
            if preset.coils.start != self.coils.start {
                return Err(mismatch("start coil map"));
            }
            if preset.registers.step != self.registers.step {
                return Err(mismatch("step register"));
            }
        }
        Ok(())
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::fl30()
    }
}

/// Configuration for one driver instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    /// Identifies the machine in status events
    pub machine_id: String,
    /// Serial port; empty picks the first available port
    #[serde(default)]
    pub port_name: String,
    /// Controller the driver talks to
    pub profile: DeviceProfile,
}

impl DriverConfig {
    /// Configuration from parts; not validated until used
    pub fn new(machine_id: impl Into<String>, port_name: impl Into<String>, profile: DeviceProfile) -> Self {
        Self {
            machine_id: machine_id.into(),
            port_name: port_name.into(),
            profile,
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check the machine id and the profile
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machine_id.trim().is_empty() {
            return Err(ConfigError::MissingMachineId);
        }
        self.profile.validate()
    }
}
