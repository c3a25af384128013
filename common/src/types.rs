use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Season {
    Winter,
    Summer,
}

impl Season {
    pub const ALL: [Season; 2] = [Season::Winter, Season::Summer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Winter => "WINTER",
            Self::Summer => "SUMMER",
        }
    }
}

impl std::fmt::Display for Season {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HvacMode {
    Off,
    Heating,
    Cooling,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Heating => "HEATING",
            Self::Cooling => "COOLING",
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl std::fmt::Display for HvacMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn from_bool(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }

    pub fn is_high(self) -> bool {
        matches!(self, Self::High)
    }
}

/// Logical pin number as written in the `controlPins` table.
pub type PinId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    ScheduleGap,
    NoSensorData,
    ActuationFault,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScheduleGap => "SCHEDULE_GAP",
            Self::NoSensorData => "NO_SENSOR_DATA",
            Self::ActuationFault => "ACTUATION_FAULT",
        }
    }
}
