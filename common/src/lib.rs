pub mod config;
pub mod decision;
pub mod error;
pub mod hvac;
pub mod pins;
pub mod schedule;
pub mod sensors;
pub mod target;
pub mod topics;
pub mod types;

pub use config::{ControlTuning, HvacConfig, RuntimeConfig};
pub use decision::{Controller, DecisionRecord};
pub use error::{ActuationFault, ConfigError, PinError, ScheduleError, SensorError};
pub use hvac::{HvacState, HvacStateMachine, HvacStatus};
pub use pins::{HvacPinSet, HvacPins, PinAction};
pub use schedule::{AdjustmentSource, SeasonCalendar, SeasonSchedule, TimeWindow};
pub use sensors::{Aggregate, Exclusion, SensorCache, SensorDriver, SensorGroup, SensorReading};
pub use target::{compute_target, resolve_target, Target};
pub use topics::*;
pub use types::{FaultKind, HvacMode, PinId, PinLevel, Season};
