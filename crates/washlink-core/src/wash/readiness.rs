//! Bay readiness and wash counters
//!
//! One-off reads a kiosk makes while no wash runs: whether the gantry is
//! homed and free, where the car stands, and how many washes the controller
//! has counted. Each flag is read with its own request; a revision that has
//! no coil for a flag reports it as unknown.

use serde::Serialize;

use super::dispatcher::{CommandDispatcher, DispatchError};
use crate::config::{CoilMap, RegisterMap};

/// Snapshot of the bay before a wash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineReadiness {
    /// Homed, not running and no error; unknown flags do not block
    pub ready: bool,
    /// Every origin coil set
    pub origin: Option<bool>,
    /// Gantry parked at its origin
    pub at_origin: Option<bool>,
    /// A cycle is running
    pub running: Option<bool>,
    /// Hardware error flag
    pub error: Option<bool>,
    /// A vehicle is in the bay
    pub car_present: Option<bool>,
    /// A vehicle passed the entry sensor
    pub car_entered: Option<bool>,
    /// Vehicle stopped at the wash position
    pub car_stopped: Option<bool>,
    /// Vehicle still moving
    pub car_not_stopped: Option<bool>,
    /// Vehicle drove past the wash position
    pub car_over_position: Option<bool>,
}

impl MachineReadiness {
    /// Read every flag `coils` defines
    pub async fn read(dispatcher: &CommandDispatcher, coils: &CoilMap) -> Result<Self, DispatchError> {
        let flags = &coils.readiness;

        let origin = if flags.origin.is_empty() {
            None
        } else {
            let mut homed = true;
            for &coil in &flags.origin {
                homed &= dispatcher.read_coil(coil).await?;
            }
            Some(homed)
        };

        let readiness = Self {
            ready: false,
            origin,
            at_origin: read_flag(dispatcher, flags.at_origin).await?,
            running: read_flag(dispatcher, coils.running).await?,
            error: read_flag(dispatcher, coils.error).await?,
            car_present: read_flag(dispatcher, flags.car_present).await?,
            car_entered: read_flag(dispatcher, flags.car_entry).await?,
            car_stopped: read_flag(dispatcher, flags.car_stopped).await?,
            car_not_stopped: read_flag(dispatcher, flags.car_not_stopped).await?,
            car_over_position: read_flag(dispatcher, flags.car_over_position).await?,
        };
        Ok(readiness.assessed())
    }

    fn assessed(mut self) -> Self {
        self.ready = self.origin != Some(false)
            && self.at_origin != Some(false)
            && self.running != Some(true)
            && self.error != Some(true);
        self
    }

    /// Whether the car stands where the wash expects it, if the revision can tell
    pub fn car_in_position(&self) -> Option<bool> {
        match (self.car_stopped, self.car_over_position, self.car_present) {
            (Some(stopped), over, _) => Some(stopped && over != Some(true)),
            (None, _, Some(present)) => Some(present),
            (None, _, None) => None,
        }
    }
}

async fn read_flag(dispatcher: &CommandDispatcher, coil: Option<u16>) -> Result<Option<bool>, DispatchError> {
    match coil {
        Some(coil) => dispatcher.read_coil(coil).await.map(Some),
        None => Ok(None),
    }
}

/// Wash counters kept by the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WashCounters {
    /// Washes since the counter was last cleared
    pub total: Option<u16>,
    /// Washes today
    pub daily: Option<u16>,
}

impl WashCounters {
    /// Read the counter registers `registers` defines
    pub async fn read(dispatcher: &CommandDispatcher, registers: &RegisterMap) -> Result<Self, DispatchError> {
        let mut counters = Self::default();
        if let Some(address) = registers.total_count {
            counters.total = Some(dispatcher.read_register(address).await?);
        }
        if let Some(address) = registers.daily_count {
            counters.daily = Some(dispatcher.read_register(address).await?);
        }
        Ok(counters)
    }
}
