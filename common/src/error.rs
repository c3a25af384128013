use thiserror::Error;

use crate::{
    sensors::Exclusion,
    types::{PinId, PinLevel, Season},
};

/// Raised while turning a raw configuration into an [`HvacConfig`](crate::HvacConfig).
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid time {value}: expected HHMM with hour < 24 and minute < 60")]
    InvalidTime { value: u16 },
    #[error("{season} has no time window covering minute {minute}")]
    ScheduleGap { season: Season, minute: u16 },
    #[error("{season} windows `{first}` and `{second}` overlap at minute {minute}")]
    ScheduleOverlap {
        season: Season,
        first: String,
        second: String,
        minute: u16,
    },
    #[error("sensor group `{group}` references unknown sensor `{sensor}`")]
    UnknownSensor { group: String, sensor: String },
    #[error("sensor group `{0}` has no members")]
    EmptyGroup(String),
    #[error("sensor group `{0}` is not configured")]
    UnknownGroup(String),
    #[error("no sensor group selected for the HVAC and {0} groups are configured")]
    AmbiguousGroup(usize),
    #[error("month {month} is mapped to {season}, which has no temperature settings")]
    MissingSeason { month: u32, season: Season },
    #[error("month {month} is mapped to more than one season")]
    DuplicateMonth { month: u32 },
    #[error("month {0} is outside 1..=12")]
    InvalidMonth(u32),
    #[error("{season} has no default temperature and no global default is set")]
    MissingDefaultTemp { season: Season },
    #[error("pin {pin} is assigned to both {first} and {second}")]
    DuplicatePin {
        pin: PinId,
        first: &'static str,
        second: &'static str,
    },
    #[error("tuning value `{field}` is out of range: {reason}")]
    InvalidTuning {
        field: &'static str,
        reason: &'static str,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("schedule gap: {season} has no window containing minute {minute}")]
    Gap { season: Season, minute: u16 },
    #[error("{0} has no temperature settings")]
    UnknownSeason(Season),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorError {
    #[error("sensor `{0}` did not answer before the read timeout")]
    Timeout(String),
    #[error("sensor `{0}` is unavailable")]
    Unavailable(String),
    #[error("no valid sensor data for group `{group}`")]
    NoSensorData {
        group: String,
        excluded: Vec<Exclusion>,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PinError {
    #[error("pin {0} did not respond before the timeout")]
    Timeout(PinId),
    #[error("pin {pin} i/o failure: {reason}")]
    Io { pin: PinId, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActuationFault {
    #[error("sense pin {sense} reads {observed:?}, expected {expected:?} after pulsing pin {commanded}")]
    SenseMismatch {
        commanded: PinId,
        sense: PinId,
        expected: PinLevel,
        observed: PinLevel,
    },
    #[error("pin access failed during actuation: {0}")]
    Pin(#[from] PinError),
}
