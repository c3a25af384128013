//! Pin-level actuation: the capability trait the hardware backends implement
//! and the executor that turns [`PinAction`] sequences into writes and
//! sense-pin confirmations.

pub mod sim;

use std::{
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::ControlTuning,
    error::{ActuationFault, ConfigError, PinError},
    types::{PinId, PinLevel},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HvacPinSet {
    pub heat_off: PinId,
    pub heat_on: PinId,
    pub cool_off: PinId,
    pub cool_on: PinId,
    pub heat_sense: PinId,
    pub cool_sense: PinId,
}

impl Default for HvacPinSet {
    fn default() -> Self {
        Self {
            heat_off: 2,
            heat_on: 3,
            cool_off: 4,
            cool_on: 5,
            heat_sense: 6,
            cool_sense: 7,
        }
    }
}

impl HvacPinSet {
    pub fn roles(&self) -> [(&'static str, PinId); 6] {
        [
            ("heatOff", self.heat_off),
            ("heatOn", self.heat_on),
            ("coolOff", self.cool_off),
            ("coolOn", self.cool_on),
            ("heatSense", self.heat_sense),
            ("coolSense", self.cool_sense),
        ]
    }

    pub fn outputs(&self) -> [PinId; 4] {
        [self.heat_off, self.heat_on, self.cool_off, self.cool_on]
    }

    pub fn inputs(&self) -> [PinId; 2] {
        [self.heat_sense, self.cool_sense]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let roles = self.roles();
        for (index, (first, pin)) in roles.iter().enumerate() {
            if let Some((second, _)) = roles[index + 1..].iter().find(|(_, other)| other == pin) {
                return Err(ConfigError::DuplicatePin {
                    pin: *pin,
                    first: *first,
                    second: *second,
                });
            }
        }
        Ok(())
    }
}

/// Hardware actuation collaborator. Both calls block for at most the
/// backend's own timeout and report it as [`PinError::Timeout`].
pub trait HvacPins {
    fn write(&mut self, pin: PinId, level: PinLevel) -> Result<(), PinError>;
    fn read(&mut self, pin: PinId) -> Result<PinLevel, PinError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinAction {
    /// Latching relay pulse: HIGH for `pulse_ms`, then LOW for `pulse_ms`.
    Pulse(PinId),
    /// Poll `sense` until it reads `expected` or the sense timeout elapses.
    Confirm {
        commanded: PinId,
        sense: PinId,
        expected: PinLevel,
    },
}

/// Runs `actions` in order and stops at the first failure.
pub fn execute<P: HvacPins + ?Sized>(
    pins: &mut P,
    actions: &[PinAction],
    tuning: &ControlTuning,
) -> Result<(), ActuationFault> {
    for action in actions {
        match *action {
            PinAction::Pulse(pin) => pulse(pins, pin, tuning.pulse_ms)?,
            PinAction::Confirm {
                commanded,
                sense,
                expected,
            } => confirm(pins, commanded, sense, expected, tuning)?,
        }
    }
    Ok(())
}

/// Runs every action regardless of failures and returns what went wrong.
/// Used for the shutdown sequence after a fault, where stopping early would
/// leave an output asserted.
pub fn execute_best_effort<P: HvacPins + ?Sized>(
    pins: &mut P,
    actions: &[PinAction],
    tuning: &ControlTuning,
) -> Vec<ActuationFault> {
    actions
        .iter()
        .filter_map(|action| execute(pins, std::slice::from_ref(action), tuning).err())
        .collect()
}

fn pulse<P: HvacPins + ?Sized>(pins: &mut P, pin: PinId, pulse_ms: u64) -> Result<(), PinError> {
    pins.write(pin, PinLevel::High)?;
    sleep_ms(pulse_ms);
    let released = pins.write(pin, PinLevel::Low);
    sleep_ms(pulse_ms);
    released
}

fn confirm<P: HvacPins + ?Sized>(
    pins: &mut P,
    commanded: PinId,
    sense: PinId,
    expected: PinLevel,
    tuning: &ControlTuning,
) -> Result<(), ActuationFault> {
    let deadline = Instant::now() + Duration::from_millis(tuning.sense_timeout_ms);
    loop {
        let observed = pins.read(sense)?;
        if observed == expected {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ActuationFault::SenseMismatch {
                commanded,
                sense,
                expected,
                observed,
            });
        }
        let remaining = deadline - now;
        thread::sleep(remaining.min(Duration::from_millis(tuning.sense_poll_ms)));
    }
}

fn sleep_ms(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}
