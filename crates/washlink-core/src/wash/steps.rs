//! Step codes
//!
//! The status register reports the current wash phase as an integer. This
//! table is the only place those integers get a meaning.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wash phase reported by the status register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum StepCode {
    /// 0
    Idle,
    /// 1
    WashEnded,
    /// 2
    PreWash,
    /// 3
    Foam,
    /// 4
    Wax,
    /// 5
    Drying,
    /// 6
    HighPressure,
    /// 7
    Rinse,
    /// 8
    Underbody,
    /// 9
    WheelWash,
    /// 10
    PaymentAccepted,
    /// Any value outside the table
    Unknown(u16),
}

impl StepCode {
    /// Every known step, in register order
    pub const KNOWN: [StepCode; 11] = [
        StepCode::Idle,
        StepCode::WashEnded,
        StepCode::PreWash,
        StepCode::Foam,
        StepCode::Wax,
        StepCode::Drying,
        StepCode::HighPressure,
        StepCode::Rinse,
        StepCode::Underbody,
        StepCode::WheelWash,
        StepCode::PaymentAccepted,
    ];

    /// Map a raw register value
    pub fn from_raw(value: u16) -> Self {
        match value {
            0 => StepCode::Idle,
            1 => StepCode::WashEnded,
            2 => StepCode::PreWash,
            3 => StepCode::Foam,
            4 => StepCode::Wax,
            5 => StepCode::Drying,
            6 => StepCode::HighPressure,
            7 => StepCode::Rinse,
            8 => StepCode::Underbody,
            9 => StepCode::WheelWash,
            10 => StepCode::PaymentAccepted,
            other => StepCode::Unknown(other),
        }
    }

    /// Raw register value
    pub fn raw(self) -> u16 {
        match self {
            StepCode::Idle => 0,
            StepCode::WashEnded => 1,
            StepCode::PreWash => 2,
            StepCode::Foam => 3,
            StepCode::Wax => 4,
            StepCode::Drying => 5,
            StepCode::HighPressure => 6,
            StepCode::Rinse => 7,
            StepCode::Underbody => 8,
            StepCode::WheelWash => 9,
            StepCode::PaymentAccepted => 10,
            StepCode::Unknown(value) => value,
        }
    }

    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            StepCode::Idle => "Standby",
            StepCode::WashEnded => "Wash complete",
            StepCode::PreWash => "Pre-wash",
            StepCode::Foam => "Foam",
            StepCode::Wax => "Wax",
            StepCode::Drying => "Drying",
            StepCode::HighPressure => "High-pressure wash",
            StepCode::Rinse => "Rinse",
            StepCode::Underbody => "Underbody wash",
            StepCode::WheelWash => "Wheel wash",
            StepCode::PaymentAccepted => "Payment accepted",
            StepCode::Unknown(_) => "Unknown step",
        }
    }

    /// True while the machine is busy with a car
    pub fn is_washing(self) -> bool {
        !matches!(
            self,
            StepCode::Idle | StepCode::WashEnded | StepCode::Unknown(_)
        )
    }
}

impl From<u16> for StepCode {
    fn from(value: u16) -> Self {
        StepCode::from_raw(value)
    }
}

impl From<StepCode> for u16 {
    fn from(step: StepCode) -> Self {
        step.raw()
    }
}

impl fmt::Display for StepCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.raw())
    }
}
